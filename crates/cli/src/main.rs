use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use herald_core::{DedupCache, Notifier};
use herald_kubehub::{KubeRecords, KubeResources, DEFAULT_SELECTOR};
use herald_notify::{LogNotifier, WebhookNotifier};
use herald_reconcile::{run_driver, DriverOptions, Reconciler, ReconcilerOptions};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod replay;

#[derive(Parser, Debug)]
#[command(name = "heraldctl", version, about = "Deployment lifecycle notifier")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Webhook URL notifications are POSTed to
    #[arg(long, env = "HERALD_ENDPOINT", global = true, default_value = "https://httpbin.org/post")]
    endpoint: String,

    /// Per-notification send timeout
    #[arg(long = "timeout-secs", env = "HERALD_TIMEOUT_SECS", global = true, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch labelled Deployments and send lifecycle notifications
    Run {
        /// Label selector for watched Deployments
        #[arg(long, env = "HERALD_SELECTOR", default_value = DEFAULT_SELECTOR)]
        selector: String,
        /// Concurrent reconciliations
        #[arg(long, env = "HERALD_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Pending identities kept before the oldest is evicted
        #[arg(long = "queue-cap", env = "HERALD_QUEUE_CAP", default_value_t = 2048)]
        queue_cap: usize,
        /// First retry delay after a failed reconciliation
        #[arg(long = "retry-base-ms", default_value_t = 1000)]
        retry_base_ms: u64,
        /// Retry delay ceiling
        #[arg(long = "retry-max-secs", default_value_t = 300)]
        retry_max_secs: u64,
    },
    /// Print the Notification CustomResourceDefinition
    Crd,
    /// Feed a JSON-lines event file through the reconciler against an in-memory cluster
    Replay {
        file: std::path::PathBuf,
        /// Send to the webhook instead of only logging
        #[arg(long = "send", action = ArgAction::SetTrue)]
        send: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("HERALD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HERALD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HERALD_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));

    match cli.command {
        Commands::Run { selector, workers, queue_cap, retry_base_ms, retry_max_secs } => {
            let ns = cli.namespace.clone();
            info!(selector = %selector, ns = ?ns, endpoint = %cli.endpoint, workers, "run invoked");
            let client = herald_kubehub::get_kube_client().await?;
            let notifier = WebhookNotifier::new(&cli.endpoint, timeout)?;
            let reconciler = Arc::new(Reconciler::new(
                Arc::new(KubeResources::new(client.clone())),
                Arc::new(KubeRecords::new(client.clone())),
                Arc::new(notifier),
                Arc::new(DedupCache::new()),
                ReconcilerOptions::default(),
            ));
            let opts = DriverOptions {
                queue_cap,
                workers,
                retry_base: Duration::from_millis(retry_base_ms),
                retry_max: Duration::from_secs(retry_max_secs),
                ..DriverOptions::default()
            };
            let (tx, rx) = mpsc::channel(queue_cap.max(1));
            let mut watcher_handle = tokio::spawn(async move {
                if let Err(e) = herald_kubehub::start_watcher(client, &selector, ns.as_deref(), tx).await {
                    error!(error = ?e, "watcher failed");
                }
            });
            let driver = tokio::spawn(run_driver(reconciler, rx, opts));

            tokio::select! {
                _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                _ = &mut watcher_handle => warn!("watcher ended; draining"),
            }
            // dropping the watcher's sender lets the driver finish in-flight work
            watcher_handle.abort();
            let stats = driver.await.context("driver task")?;
            info!(invocations = stats.invocations, failures = stats.failures, requeues = stats.requeues, dropped = stats.dropped, "stopped");
        }
        Commands::Crd => {
            let crd = herald_kubehub::notification_crd();
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&crd)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
            }
        }
        Commands::Replay { file, send } => {
            info!(file = %file.display(), send, "replay invoked");
            let input = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let events = replay::parse_events(&input)?;
            let sink: Arc<dyn Notifier> =
                if send { Arc::new(WebhookNotifier::new(&cli.endpoint, timeout)?) } else { Arc::new(LogNotifier) };
            let steps = replay::replay(events, sink).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<4} {:<30} {:<14} SENT", "#", "DEPLOYMENT", "OUTCOME");
                    for (i, s) in steps.iter().enumerate() {
                        let sent = if s.sent.is_empty() { "-".to_string() } else { s.sent.join(" | ") };
                        println!("{:<4} {:<30} {:<14} {}", i + 1, s.identity, s.outcome, sent);
                        if let Some(e) = &s.error {
                            println!("     error: {}", e);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&steps)?),
            }
        }
    }

    Ok(())
}
