//! Query tool: resolve a service, follow its changes, or list what the
//! registry knows

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use bakerstreet::shutdown::shutdown_signal;
use bakerstreet_api::models::{ResolveQuery, ResolveResponse, WatchEvent};
use bakerstreet_api::RegistryClient;
use bakerstreet_core::discovery::ServiceEntry;
use bakerstreet_core::{logging, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "sherlock")]
#[command(about = "Baker Street discovery tool", long_about = None)]
struct Args {
    /// Registry daemon base URL
    #[arg(long, global = true, env = "BAKERSTREET_REGISTRY_URL", default_value = "http://localhost:5000")]
    registry: String,

    /// Print raw JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve live instances of a service
    Resolve {
        service: String,

        /// all, random, weighted or least_loaded
        #[arg(long, default_value = "all")]
        policy: String,

        #[arg(long)]
        count: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Metadata key for weighted / least_loaded
        #[arg(long)]
        key: Option<String>,
    },
    /// Print a service's live instances, then every change until Ctrl-C
    Watch { service: String },
    /// List services with at least one entry
    Services,
    /// Registry counters
    Stats,
}

fn entry_line(entry: &ServiceEntry) -> String {
    let mut tags: Vec<String> = entry.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect();
    tags.sort();
    format!(
        "{}\t{}\tttl={}s\tlast_heartbeat={}\t{}",
        entry.instance_id,
        entry.address,
        entry.ttl_secs,
        entry.last_heartbeat_at.to_rfc3339(),
        tags.join(",")
    )
}

fn print_resolution(resolution: &ResolveResponse) {
    if resolution.entries.is_empty() {
        println!("no live instances of {}", resolution.service_name);
        return;
    }

    for entry in &resolution.entries {
        println!("{}", entry_line(entry));
    }
}

fn watch_lines(event: &WatchEvent) -> Vec<String> {
    match event {
        WatchEvent::Snapshot(snapshot) => {
            let mut lines = vec![format!(
                "snapshot\t{}\tstore_version={}\tinstances={}",
                snapshot.service_name,
                snapshot.store_version,
                snapshot.entries.len()
            )];
            lines.extend(snapshot.entries.iter().map(entry_line));
            lines
        }
        WatchEvent::Change(change) => vec![format!(
            "{}\tversion={}\t{}",
            change.event_type(),
            change.version(),
            entry_line(&change.entry)
        )],
        WatchEvent::Dropped(notice) => vec![format!("dropped\tmissed={}\tresyncing", notice.missed)],
    }
}

async fn follow(client: &RegistryClient, service: &str, json: bool) -> Result<()> {
    let mut events = Box::pin(client.watch(service).await?);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => return Ok(()),
            event = events.next() => {
                let Some(event) = event else {
                    bail!("registry closed the watch stream");
                };
                let event = event?;
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    for line in watch_lines(&event) {
                        println!("{line}");
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Diagnostics only; results go to stdout
    logging::init_logging(&LoggingConfig {
        level: "warn".to_string(),
        ..LoggingConfig::default()
    })?;

    let client = RegistryClient::new(&args.registry)?;

    match args.command {
        Command::Resolve { service, policy, count, seed, key } => {
            let query = ResolveQuery {
                policy: Some(policy),
                count,
                seed,
                key,
            };
            let resolution = client.resolve(&service, &query).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&resolution)?);
            } else {
                print_resolution(&resolution);
            }
        }
        Command::Watch { service } => follow(&client, &service, args.json).await?,
        Command::Services => {
            let services = client.services().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&services)?);
            } else {
                for service in services {
                    println!("{service}");
                }
            }
        }
        Command::Stats => {
            let stats = client.stats().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "services={} entries={} watchers={} store_version={}",
                    stats.services, stats.entries, stats.subscribers, stats.store_version
                );
            }
        }
    }

    Ok(())
}
