//! CLI entry point for the netwatch daemon.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use netwatch_core::ChannelKind;
use netwatch_notify::Dispatcher;
use netwatch_store::{DeviceStore, FileStore};

use netwatch_scan::config::WatchConfig;
use netwatch_scan::scheduler::Watcher;
use netwatch_scan::vuln::RuleSet;

/// Time given to detached deliveries before a one-shot command exits.
const DELIVERY_GRACE: Duration = Duration::from_millis(500);

const PROGRESS_EVERY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "netwatch")]
#[command(about = "Watch a local network for new devices, departures, and port changes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Range to scan (CIDR, e.g. 192.168.1.0/24). Defaults to the local /24.
    #[arg(short, long, global = true)]
    range: Option<String>,

    /// Seconds between scan cycles.
    #[arg(short, long, global = true)]
    interval: Option<u64>,

    /// POST notifications to this URL.
    #[arg(long, global = true)]
    webhook_url: Option<String>,

    /// Directory for the device database.
    #[arg(long, global = true)]
    store_dir: Option<String>,

    /// Config file prefix (default: netwatch).
    #[arg(short, long, global = true, default_value = "netwatch")]
    config: String,

    #[arg(long, global = true)]
    no_notify_new_devices: bool,

    #[arg(long, global = true)]
    no_notify_disconnected: bool,

    #[arg(long, global = true)]
    no_notify_port_changes: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Scan on an interval until interrupted (default).
    Run,
    /// Run a single scan cycle and exit.
    Once,
    /// Probe every TCP port of one host and update its record.
    FullScan {
        #[arg(long)]
        ip: IpAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let mut config = WatchConfig::load(&cli.config)?;
    apply_overrides(&cli, &mut config);

    let store = Arc::new(FileStore::open(&config.store_dir)?);
    tracing::info!(store_dir = %config.store_dir, "Opened device store");

    if let Some(url) = config.notify.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        let mut notification_config = store.notification_config()?;
        notification_config.enable(ChannelKind::Webhook);
        notification_config.webhook_url = url.to_string();
        store.save_notification_config(&notification_config)?;
    }

    let dispatcher = Dispatcher::start(store.clone(), config.notify.dispatcher_settings());
    let rules = RuleSet::load(config.vuln_rules_path.as_deref().map(Path::new))?;
    tracing::info!(rules = rules.len(), "Vulnerability rules ready");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        }
    });

    let watcher = Watcher::new(config, store, dispatcher, Arc::new(rules), cancel)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => watcher.run().await,
        Command::Once => {
            watcher.run_cycle().await?;
            tokio::time::sleep(DELIVERY_GRACE).await;
        }
        Command::FullScan { ip } => {
            let watcher = Arc::new(watcher);
            let mut scan = watcher.spawn_full_port_scan(ip)?;
            let mut ticker = tokio::time::interval(PROGRESS_EVERY);
            ticker.tick().await;

            loop {
                tokio::select! {
                    joined = &mut scan => {
                        if let Err(e) = joined {
                            tracing::error!(ip = %ip, error = %e, "Full port scan task failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some(p) = watcher.sessions().get(ip) {
                            tracing::info!(
                                ip = %ip,
                                progress = p.progress,
                                open_ports = ?p.open_ports,
                                elapsed_secs = p.elapsed_secs(),
                                "Full port scan progress"
                            );
                        }
                    }
                }
            }

            if let Some(p) = watcher.sessions().get(ip) {
                tracing::info!(
                    ip = %ip,
                    status = ?p.status,
                    open_ports = ?p.open_ports,
                    elapsed_secs = p.elapsed_secs(),
                    "Full port scan finished"
                );
            }
            tokio::time::sleep(DELIVERY_GRACE).await;
        }
    }

    Ok(())
}

fn apply_overrides(cli: &Cli, config: &mut WatchConfig) {
    if let Some(range) = &cli.range {
        config.range = range.clone();
    }
    if let Some(interval) = cli.interval {
        config.interval_secs = interval;
    }
    if let Some(url) = &cli.webhook_url {
        config.notify.webhook_url = Some(url.clone());
    }
    if let Some(dir) = &cli.store_dir {
        config.store_dir = dir.clone();
    }
    if cli.no_notify_new_devices {
        config.notify.new_devices = false;
    }
    if cli.no_notify_disconnected {
        config.notify.disconnected = false;
    }
    if cli.no_notify_port_changes {
        config.notify.port_changes = false;
    }
}
