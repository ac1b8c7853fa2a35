use std::path::PathBuf;

use abusescan::config::{LogFormat, LoggingConfig, ScannerConfig};
use abusescan::detect::ScanOutcome;
use abusescan::Scanner;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "abusescan",
    about = "Abuse-detection scanner for game-server hosting containers",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML). Falls back to $ABUSESCAN_CONFIG, then /etc/abusescan/abusescan.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scan loop + control API)
    Serve,

    /// Scan one container now and print the result
    Scan {
        /// Container id or name
        container: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List running container ids
    Containers,

    /// Fetch the full hash set from the hash authority
    SyncHashes,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ScannerConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(listen = %config.api.listen_address, "Starting abusescan daemon");
            abusescan::serve(config).await?;
        }
        Commands::Scan { container, json } => {
            let scanner = Scanner::build(&config, CancellationToken::new()).await?;
            let outcome = scanner.engine.scan_container(&container).await?;
            if json {
                let value = match &outcome {
                    ScanOutcome::Detected(d) => serde_json::json!({ "outcome": "detected", "detection": d }),
                    ScanOutcome::Clean { volume_id } => {
                        serde_json::json!({ "outcome": "clean", "volumeId": volume_id })
                    }
                    ScanOutcome::Skipped {
                        volume_id,
                        last_flagged_at,
                    } => serde_json::json!({
                        "outcome": "skipped",
                        "volumeId": volume_id,
                        "lastFlaggedAt": last_flagged_at
                    }),
                    ScanOutcome::Cancelled { volume_id } => {
                        serde_json::json!({ "outcome": "cancelled", "volumeId": volume_id })
                    }
                };
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_outcome(&outcome);
            }
        }
        Commands::Containers => {
            let scanner = Scanner::build(&config, CancellationToken::new()).await?;
            for id in scanner.runtime.list_running().await? {
                println!("{}", id);
            }
        }
        Commands::SyncHashes => {
            let scanner = Scanner::build(&config, CancellationToken::new()).await?;
            let count = scanner.intel.sync().await?;
            println!("Synced {} hashes.", count);
        }
    }

    Ok(())
}

fn print_outcome(outcome: &ScanOutcome) {
    match outcome {
        ScanOutcome::Clean { volume_id } => {
            println!("Volume {}: clean", volume_id);
        }
        ScanOutcome::Skipped {
            volume_id,
            last_flagged_at,
        } => {
            let when = last_flagged_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            println!("Volume {}: skipped (flagged at {})", volume_id, when);
        }
        ScanOutcome::Cancelled { volume_id } => {
            println!("Volume {}: scan cancelled", volume_id);
        }
        ScanOutcome::Detected(d) => {
            println!("\n=== abusescan Detection Report ===");
            println!("Detection:  {}", d.id);
            println!("Container:  {}", d.container_id);
            println!("Volume:     {} ({:.1} MB)", d.volume_id, d.volume_size);
            println!(
                "Metrics:    CPU {:.1}% | Mem {:.1} MB | Net {:.1} MB",
                d.metrics.cpu_percent, d.metrics.memory_mb, d.metrics.network_mb
            );
            println!("\nTypes:");
            for t in d.distinct_types() {
                println!(" - {}", t);
            }
            println!("\nEvidence:");
            for p in &d.processes {
                println!(" - process {} `{}` ({})", p.pid, p.command, p.pattern);
            }
            for f in &d.files {
                println!(" - file {}: {}", f.path, f.reason);
            }
            for c in &d.cache {
                println!(" - artifact {}: {}", c.path, c.reason);
            }
            for n in &d.npm {
                println!(" - dependency {} in {}", n.package, n.path);
            }
            for n in &d.network {
                println!(" - network: {} ({} bytes)", n.reason, n.bytes);
            }
            for c in &d.suspicious_content {
                println!(" - content {}: {}", c.path, c.matches.join(", "));
            }
            for h in &d.hash_matches {
                println!(" - known hash {}: {} ({})", h.path, h.detection_type, h.file_name);
            }
            println!("==================================\n");
        }
    }
}
