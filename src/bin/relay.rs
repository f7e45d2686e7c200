//! Relay-Server
//!
//! Konfiguration über `RELAY_ADDR` und `RELAY_OUTBOX_CAPACITY`.

use anyhow::Context;
use peercall::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peercall::init_tracing();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    let server = RelayServer::bind(&config)
        .await
        .context("failed to start relay")?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down relay");
        })
        .await?;

    Ok(())
}
