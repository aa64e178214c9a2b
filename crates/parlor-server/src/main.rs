mod config;

use std::sync::Arc;

use tracing::{info, warn};

use parlor_db::Database;
use parlor_gateway::Gateway;
use parlor_gateway::listener::Server;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor_server=debug,parlor_gateway=debug,parlor_db=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.key_generated {
        warn!("PARLOR_SHARED_KEY is unset, generated a key for this run");
        println!("PARLOR_SHARED_KEY={}", config.key.to_base64());
    }
    info!("Shared key fingerprint {}", config.key.fingerprint());

    let db = Arc::new(Database::open(&config.db_path)?);
    let gateway = Gateway::new(db, &config.key).with_history_limit(config.history_limit);

    let listener = config.bind().await?;
    info!("Parlor server listening on {}", listener.local_addr()?);

    Server::new(gateway)
        .with_shutdown_grace(config.shutdown_grace)
        .run(listener, shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
