//! Hudson server lifecycle
//!
//! Starts the liveness sweep and the HTTP API, and on a shutdown signal
//! closes every watch so open event streams let the server drain.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use bakerstreet::shutdown::shutdown_signal;
use bakerstreet_core::{Config, Registry};

pub struct HudsonServer {
    config: Config,
    registry: Arc<Registry>,
}

impl HudsonServer {
    pub const fn new(config: Config, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    pub async fn run(self) -> Result<()> {
        let sweeper = self.registry.start();

        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = bakerstreet_api::create_router(self.registry.clone());
        let registry = self.registry.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("Shutdown signal received, starting graceful shutdown...");
                registry.shutdown();
            })
            .await;

        // Covers the server failing before any signal arrived
        self.registry.shutdown();
        if let Err(e) = sweeper.await {
            error!("Liveness sweep task failed: {}", e);
        }

        served.map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;
        info!("Hudson stopped");
        Ok(())
    }
}
