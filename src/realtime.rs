use crate::telemetry::{fetch_logs, ExecutionLogRecord};
use rusqlite::Connection;
use tokio::sync::broadcast;

/// Most recent rows retained per projection; older rows are evicted so a
/// very long run cannot grow the in-memory list without bound.
pub const MAX_PROJECTED_ROWS: usize = 100;

const BUS_CAPACITY: usize = 256;

/// In-process change feed for freshly inserted execution-log rows. The
/// telemetry ingress publishes after every insert; read-side projections
/// subscribe and filter by run id.
#[derive(Clone)]
pub struct LogBus {
    tx: broadcast::Sender<ExecutionLogRecord>,
}

impl LogBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, record: &ExecutionLogRecord) {
        // No receivers is fine: nobody is watching this run right now.
        let _ = self.tx.send(record.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionLogRecord> {
        self.tx.subscribe()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side projection of one run's log stream: the already-persisted rows
/// in step order, then inserts as they arrive. Rows are appended exactly
/// once and the buffer is bounded to `MAX_PROJECTED_ROWS`. Dropping the
/// projection tears the subscription down.
pub struct LogProjection {
    run_id: String,
    rows: Vec<ExecutionLogRecord>,
    last_seen_id: i64,
    rx: broadcast::Receiver<ExecutionLogRecord>,
}

impl LogProjection {
    pub fn open(connection: &Connection, bus: &LogBus, run_id: &str) -> Result<Self, String> {
        // Subscribe before the initial fetch so no insert can fall between.
        let rx = bus.subscribe();
        let mut rows = fetch_logs(connection, run_id)?;
        if rows.len() > MAX_PROJECTED_ROWS {
            rows.drain(..rows.len() - MAX_PROJECTED_ROWS);
        }
        let last_seen_id = rows.last().map(|row| row.id).unwrap_or(0);
        Ok(Self {
            run_id: run_id.to_string(),
            rows,
            last_seen_id,
            rx,
        })
    }

    /// Drain every event that arrived since the last call, appending the
    /// ones for the watched run in arrival order (out-of-order delivery is
    /// tolerated, not re-sorted).
    pub fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(record) => {
                    if record.run_id != self.run_id || record.id <= self.last_seen_id {
                        continue;
                    }
                    self.last_seen_id = record.id;
                    self.rows.push(record);
                    if self.rows.len() > MAX_PROJECTED_ROWS {
                        let excess = self.rows.len() - MAX_PROJECTED_ROWS;
                        self.rows.drain(..excess);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("log projection lagged, skipped {skipped} events");
                }
                Err(_) => break,
            }
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn rows(&self) -> &[ExecutionLogRecord] {
        &self.rows
    }

    /// Explicit teardown; dropping the projection is equivalent.
    pub fn close(self) {}

    /// Split into the buffered rows and the live receiver, for serving
    /// layers that push events instead of polling `pump`.
    pub fn into_parts(self) -> (Vec<ExecutionLogRecord>, broadcast::Receiver<ExecutionLogRecord>) {
        (self.rows, self.rx)
    }
}
