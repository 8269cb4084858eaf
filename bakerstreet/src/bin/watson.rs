//! Registration agent: keeps one instance registered while it runs

use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use bakerstreet::identity::{generate_instance_id, parse_key_value};
use bakerstreet::shutdown::shutdown_signal;
use bakerstreet_api::models::RegisterBody;
use bakerstreet_api::{ClientError, RegistryClient};
use bakerstreet_core::{logging, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "watson")]
#[command(about = "Baker Street registration agent", long_about = None)]
struct Args {
    /// Registry daemon base URL
    #[arg(long, env = "BAKERSTREET_REGISTRY_URL", default_value = "http://localhost:5000")]
    registry: String,

    /// Service to register under
    #[arg(long, env = "WATSON_SERVICE")]
    service: String,

    /// Address clients should use, host:port or URI
    #[arg(long, env = "WATSON_ADDRESS")]
    address: String,

    /// Instance id (generated from the hostname if not provided)
    #[arg(long, env = "WATSON_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Heartbeat TTL in seconds
    #[arg(long, env = "WATSON_TTL", default_value = "30")]
    ttl: u64,

    /// Metadata tag, repeatable: --meta weight=5 --meta zone=eu
    #[arg(long = "meta", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,

    #[arg(long, env = "WATSON_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

struct Agent {
    client: RegistryClient,
    service: String,
    instance_id: String,
    body: RegisterBody,
}

impl Agent {
    async fn register(&self) -> Result<(), ClientError> {
        let registration = self.client.register(&self.service, &self.body).await?;
        info!(
            service = %self.service,
            instance_id = %registration.instance_id,
            version = registration.version,
            created = registration.created,
            "Registered with registry"
        );
        Ok(())
    }

    async fn heartbeat(&self) {
        match self.client.heartbeat(&self.service, &self.instance_id).await {
            Ok(response) => debug!(version = response.version, "Heartbeat accepted"),
            Err(e) if e.is_not_found() => {
                warn!(instance_id = %self.instance_id, "Registry forgot this instance, re-registering");
                if let Err(e) = self.register().await {
                    error!("Re-registration failed: {}", e);
                }
            }
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    async fn deregister(&self) {
        match self.client.deregister(&self.service, &self.instance_id).await {
            Ok(response) => info!(version = response.version, "Deregistered"),
            Err(e) if e.is_not_found() => debug!("Instance already gone from registry"),
            Err(e) => error!("Deregistration failed: {}", e),
        }
    }
}

/// Minimum spacing between heartbeats
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

/// Heartbeat often enough that two consecutive misses still fit in the TTL
fn heartbeat_period(ttl_secs: u64) -> Duration {
    Duration::from_millis(ttl_secs.saturating_mul(1000) / 3).max(MIN_HEARTBEAT_PERIOD)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(&LoggingConfig {
        level: args.log_level.clone(),
        ..LoggingConfig::default()
    })?;

    let instance_id = args.instance_id.unwrap_or_else(generate_instance_id);
    let agent = Agent {
        client: RegistryClient::new(&args.registry)?,
        service: args.service,
        instance_id: instance_id.clone(),
        body: RegisterBody {
            instance_id: Some(instance_id),
            address: args.address,
            metadata: args.metadata.into_iter().collect::<HashMap<_, _>>(),
            ttl_secs: Some(args.ttl),
        },
    };

    info!(registry = %agent.client.base_url(), service = %agent.service, "Watson starting");
    // Validation problems will not fix themselves; anything else is retried by the loop
    if let Err(e) = agent.register().await {
        match e {
            ClientError::Api { status: 400, .. } | ClientError::InvalidUrl(_) => return Err(e.into()),
            e => warn!("Initial registration failed, will retry: {}", e),
        }
    }

    let mut ticker = interval(heartbeat_period(args.ttl));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutting down, deregistering");
                agent.deregister().await;
                return Ok(());
            }
            _ = ticker.tick() => agent.heartbeat().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_period() {
        assert_eq!(heartbeat_period(30), Duration::from_secs(10));
        assert_eq!(heartbeat_period(10), Duration::from_millis(3333));
        assert_eq!(heartbeat_period(1), Duration::from_millis(333));
        assert_eq!(heartbeat_period(0), MIN_HEARTBEAT_PERIOD);

        // Several beats always land inside the smallest TTL the registry accepts
        for ttl in 1..=5 {
            assert!(heartbeat_period(ttl) * 2 < Duration::from_secs(ttl), "ttl={ttl}");
        }
    }

    #[test]
    fn test_args_parse_metadata() {
        let args = Args::try_parse_from([
            "watson", "--service", "checkout", "--address", "10.0.0.1:9000", "--meta", "weight=5", "--meta", "zone=eu",
        ])
        .unwrap();
        assert_eq!(args.metadata.len(), 2);
        assert_eq!(args.ttl, 30);
    }
}
