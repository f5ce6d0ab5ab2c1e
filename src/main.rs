//! Binary entrypoint for the smsgate CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `ports` - list serial ports visible to the OS
//! - `status [--port <path>]` - connect and print gateway status as JSON
//! - `send --phone <p> --body <b> [--port <path>]` - send one SMS and wait for the outcome
//! - `start [--port <path>] [--seed <json>]` - run the gateway, scheduler and dispatcher
//!
//! See the library crate docs for module-level details: `smsgate::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use smsgate::config::Config;
use smsgate::dispatch::EventDispatcher;
use smsgate::gateway::{GatewayEvent, Outcome, QueuedMessage, SmsGateway};
use smsgate::modem::transport::list_ports;
use smsgate::scheduler::{MessageScheduler, SchedulerEvent};
use smsgate::storage::MemoryStore;

#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "SMS campaign gateway for USB cellular modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// List available serial ports
    Ports,
    /// Connect to the modem and print its status
    Status {
        /// Modem serial port (overrides config)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Send a single SMS
    Send {
        /// Recipient phone number
        #[arg(long)]
        phone: String,
        /// Message text
        #[arg(long)]
        body: String,
        /// Modem serial port (overrides config)
        #[arg(short, long)]
        port: Option<String>,
        /// Seconds to wait for the send outcome
        #[arg(short, long, default_value_t = 60)]
        timeout: u64,
    },
    /// Run the gateway with the campaign scheduler
    Start {
        /// Modem serial port (overrides config)
        #[arg(short, long)]
        port: Option<String>,
        /// JSON file with contacts and campaigns to load into the in-memory store
        #[arg(long)]
        seed: Option<String>,
    },
}

async fn load_config(path: &str, port: Option<String>) -> Result<Config> {
    let mut config = Config::load(path).await?.with_env_overrides();
    if let Some(port) = port {
        config.gateway.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before a config file exists
    let pre_config = match cli.command {
        Commands::Init | Commands::Ports => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Ports => {
            let ports = list_ports();
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for (name, desc) in ports {
                println!("{:<24} {}", name, desc);
            }
        }
        Commands::Status { port } => {
            let config = load_config(&cli.config, port).await?;
            let (gateway, _events) = SmsGateway::new(config.gateway_config(), config.tuning());
            gateway.connect().await;
            let status = gateway.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!("{}", serde_json::to_string_pretty(&smsgate::metrics::snapshot())?);
            gateway.disconnect();
        }
        Commands::Send {
            phone,
            body,
            port,
            timeout,
        } => {
            let config = load_config(&cli.config, port).await?;
            let (gateway, mut events) = SmsGateway::new(config.gateway_config(), config.tuning());
            if let Err(e) = gateway.try_connect().await {
                return Err(anyhow!("Cannot reach modem: {}", e));
            }
            let msg = QueuedMessage::adhoc(phone, body);
            let id = msg.correlation_id.clone();
            gateway.queue_message(msg);

            let wait = async {
                while let Some(event) = events.recv().await {
                    if let GatewayEvent::MessageProcessed(outcome) = event {
                        if outcome.correlation_id.as_deref() == Some(id.as_str()) {
                            return Some(outcome);
                        }
                    }
                }
                None
            };
            let outcome = tokio::time::timeout(Duration::from_secs(timeout), wait)
                .await
                .map_err(|_| anyhow!("No outcome within {}s", timeout))?
                .ok_or_else(|| anyhow!("Gateway stopped before the message was processed"))?;
            gateway.disconnect();
            match outcome.outcome {
                Outcome::Failed => {
                    return Err(anyhow!(
                        "Send failed: {}",
                        outcome.error.unwrap_or_else(|| "unknown error".to_string())
                    ))
                }
                _ => println!(
                    "Sent to {} (reference {})",
                    outcome.phone,
                    outcome
                        .reference
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "n/a".to_string())
                ),
            }
        }
        Commands::Start { port, seed } => {
            let config = load_config(&cli.config, port).await?;
            info!("Starting smsgate v{}", env!("CARGO_PKG_VERSION"));

            let store = match seed {
                Some(path) => Arc::new(MemoryStore::from_seed_file(&path).await?),
                None => Arc::new(MemoryStore::new()),
            };
            let (gateway, events) = SmsGateway::new(config.gateway_config(), config.tuning());
            let dispatcher = EventDispatcher::new(store.clone()).spawn(events);

            if !gateway.connect().await {
                // Stays visible as a disconnected status; queued work waits for a connect
                warn!(
                    "Modem on {} not available (gateway continuing disconnected)",
                    gateway.config().port()
                );
            }

            let (scheduler, mut scheduler_events) = MessageScheduler::new(
                store.clone(),
                Arc::new(gateway.clone()),
                config.scheduler_settings(),
            );
            scheduler.start();
            let reporter = tokio::spawn(async move {
                while let Some(event) = scheduler_events.recv().await {
                    match event {
                        SchedulerEvent::Failed { message_id, error } => {
                            warn!("Campaign {} failed: {}", message_id, error)
                        }
                        other => info!("{:?}", other),
                    }
                }
            });

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            scheduler.stop();
            gateway.disconnect();
            reporter.abort();
            dispatcher.abort();
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
