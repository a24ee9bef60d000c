mod config;
mod db;
mod dispatch;
mod missions;
mod realtime;
mod registry;
mod reports;
mod schema;
mod server;
mod telemetry;
mod vault;
mod verifier;
mod webhook;

use config::Settings;
use dispatch::HttpWorkerTransport;
use realtime::LogBus;
use server::AppState;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vault::VaultCipher;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info")),
        )
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };
    let cipher = match VaultCipher::from_master_secret(&settings.vault_master_key) {
        Ok(cipher) => cipher,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };

    let mut connection = match db::open_connection(&settings.db_path) {
        Ok(connection) => connection,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };
    if let Err(message) = db::bootstrap_schema(&mut connection) {
        tracing::error!("{message}");
        std::process::exit(1);
    }
    drop(connection);

    let state = AppState {
        db_path: settings.db_path.clone(),
        transport: Arc::new(HttpWorkerTransport::new(settings.worker_url.clone())),
        cipher,
        bus: LogBus::new(),
        settings,
    };
    let bind_addr = state.settings.bind_addr.clone();
    let app = server::router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(bind_err) => {
            tracing::error!("Failed to bind {bind_addr}: {bind_err}");
            std::process::exit(1);
        }
    };
    tracing::info!("argus dashboard core listening on {bind_addr}");
    if let Err(serve_err) = axum::serve(listener, app).await {
        tracing::error!("server exited: {serve_err}");
        std::process::exit(1);
    }
}
