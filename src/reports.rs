use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;

const HEATMAP_SAMPLE_ROWS: usize = 100;
const HEATMAP_TOP_N: usize = 5;
const FAILED_WEIGHT: i64 = 70;
const HEALED_WEIGHT: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBand {
    Critical,
    Brittle,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskItem {
    pub url: String,
    pub risk_score: i64,
    pub status: RiskBand,
    pub recommendation: String,
}

/// Fold the most recent execution logs into a per-target fragility score:
/// failed steps weigh heaviest, healed steps signal brittle selectors.
pub fn risk_heatmap(connection: &Connection, user_id: &str) -> Result<Vec<RiskItem>, String> {
    let mut stmt = connection
        .prepare(
            "SELECT el.status, tr.url
             FROM execution_logs el
             JOIN test_runs tr ON tr.id = el.run_id
             WHERE tr.user_id = ?1
             ORDER BY el.id DESC
             LIMIT ?2",
        )
        .map_err(|e| format!("Failed to prepare heatmap query: {e}"))?;
    let rows = stmt
        .query_map(params![user_id, HEATMAP_SAMPLE_ROWS as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| format!("Failed to query heatmap rows: {e}"))?;

    let mut stats: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for row in rows {
        let (status, url) = row.map_err(|e| format!("Failed to parse heatmap row: {e}"))?;
        let entry = stats.entry(url).or_insert((0, 0));
        entry.0 += 1;
        match status.to_ascii_uppercase().as_str() {
            "FAILED" => entry.1 += FAILED_WEIGHT,
            "HEALED" => entry.1 += HEALED_WEIGHT,
            _ => {}
        }
    }

    let mut items: Vec<RiskItem> = stats
        .into_iter()
        .map(|(url, (total, weight))| {
            let score = ((weight as f64 / total as f64).round() as i64).min(100);
            let status = if score > 60 {
                RiskBand::Critical
            } else if score > 25 {
                RiskBand::Brittle
            } else {
                RiskBand::Stable
            };
            let recommendation = if score > 60 {
                "Immediate Logic Audit".to_string()
            } else {
                "Selector Optimization".to_string()
            };
            RiskItem {
                url,
                risk_score: score,
                status,
                recommendation,
            }
        })
        .collect();

    items.sort_by(|a, b| b.risk_score.cmp(&a.risk_score));
    items.truncate(HEATMAP_TOP_N);
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_schema;
    use crate::missions::create_run;
    use crate::realtime::LogBus;
    use crate::schema::RunMode;
    use crate::telemetry::{ingest, TelemetryPayload};
    use pretty_assertions::assert_eq;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        bootstrap_schema(&mut conn).expect("bootstrap");
        conn
    }

    fn log_status(conn: &Connection, run_id: &str, step_id: i64, status: &str) {
        let bus = LogBus::new();
        ingest(
            conn,
            &bus,
            &TelemetryPayload {
                run_id: run_id.to_string(),
                message: Some("step".to_string()),
                status: Some(status.to_string()),
                details: None,
                role: None,
                action: Some("click".to_string()),
                step_id: Some(step_id),
                selector: None,
                value: None,
                screenshot_url: None,
            },
        )
        .expect("ingest");
    }

    #[test]
    fn scores_band_targets_by_failure_weight() {
        let conn = test_conn();
        let critical = create_run(&conn, "user_1", "https://broken.test", "check broken", RunMode::Sniper)
            .expect("run");
        log_status(&conn, &critical.id, 1, "FAILED");
        log_status(&conn, &critical.id, 2, "SUCCESS");

        let brittle = create_run(&conn, "user_1", "https://flaky.test", "check flaky", RunMode::Sniper)
            .expect("run");
        log_status(&conn, &brittle.id, 1, "HEALED");
        log_status(&conn, &brittle.id, 2, "SUCCESS");

        let stable = create_run(&conn, "user_1", "https://solid.test", "check solid", RunMode::Sniper)
            .expect("run");
        log_status(&conn, &stable.id, 1, "SUCCESS");

        let items = risk_heatmap(&conn, "user_1").expect("heatmap");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].url, "https://broken.test");
        assert_eq!(items[0].risk_score, 35);
        assert_eq!(items[0].status, RiskBand::Brittle);

        let solid = items.iter().find(|i| i.url == "https://solid.test").expect("solid");
        assert_eq!(solid.risk_score, 0);
        assert_eq!(solid.status, RiskBand::Stable);
        assert_eq!(solid.recommendation, "Selector Optimization");
    }

    #[test]
    fn all_failed_steps_hit_the_critical_band() {
        let conn = test_conn();
        let run = create_run(&conn, "user_1", "https://down.test", "check down", RunMode::Sniper)
            .expect("run");
        log_status(&conn, &run.id, 1, "FAILED");
        log_status(&conn, &run.id, 2, "FAILED");

        let items = risk_heatmap(&conn, "user_1").expect("heatmap");
        assert_eq!(items[0].risk_score, 70);
        assert_eq!(items[0].status, RiskBand::Critical);
        assert_eq!(items[0].recommendation, "Immediate Logic Audit");
    }

    #[test]
    fn heatmap_is_scoped_to_the_requesting_user() {
        let conn = test_conn();
        let foreign = create_run(&conn, "user_2", "https://other.test", "someone else", RunMode::Sniper)
            .expect("run");
        log_status(&conn, &foreign.id, 1, "FAILED");

        assert!(risk_heatmap(&conn, "user_1").expect("heatmap").is_empty());
    }
}
