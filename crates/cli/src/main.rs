use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tether_controller::{Controller, ControllerConfig, ControllerError, ReconcileError, Reconciler};
use tether_core::{ResourceKey, ResourceObject};
use tether_source::KubeSource;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether controller runtime CLI")]
struct Cli {
    /// Human-readable lines or one JSON document per record
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict `run` to one namespace; all namespaces when omitted
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the resource types this cluster serves
    Discover,
    /// Run a controller that logs every reconciled key
    Run {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector applied to list and watch
        #[arg(long = "selector")]
        selector: Option<String>,
        #[arg(long = "workers", env = "TETHER_WORKERS")]
        workers: Option<usize>,
        #[arg(long = "resync-secs", env = "TETHER_RESYNC_SECS")]
        resync_secs: Option<u64>,
        #[arg(long = "max-retries", env = "TETHER_MAX_RETRIES")]
        max_retries: Option<u32>,
        /// Fail if the initial listing has not landed in time
        #[arg(long = "sync-timeout-secs", env = "TETHER_SYNC_TIMEOUT_SECS")]
        sync_timeout_secs: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Serve Prometheus metrics when `TETHER_METRICS_ADDR` is set.
fn init_metrics() -> Result<()> {
    let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") else { return Ok(()) };
    let sock: SocketAddr = addr.parse().with_context(|| format!("TETHER_METRICS_ADDR {:?} is not host:port", addr))?;
    PrometheusBuilder::new().with_http_listener(sock).install().context("installing metrics exporter")?;
    info!(addr = %sock, "serving metrics");
    Ok(())
}

/// Prints each reconciled key; the object is absent once it has been deleted.
struct LogReconciler {
    output: Output,
}

#[async_trait::async_trait]
impl Reconciler for LogReconciler {
    async fn reconcile(&self, key: &ResourceKey, object: Option<Arc<ResourceObject>>) -> Result<(), ReconcileError> {
        match self.output {
            Output::Human => match &object {
                Some(o) => println!("reconcile {} (rv {})", key, o.resource_version.as_deref().unwrap_or("-")),
                None => println!("reconcile {} (deleted)", key),
            },
            Output::Json => {
                let line = serde_json::json!({
                    "key": key,
                    "exists": object.is_some(),
                    "resourceVersion": object.as_ref().and_then(|o| o.resource_version.clone()),
                });
                println!("{}", line);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    if let Err(e) = init_metrics() {
        warn!(error = %format!("{:#}", e), "metrics disabled");
    }
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let resources = tether_source::discover().await.context("discovery failed")?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Run { gvk, selector, workers, resync_secs, max_retries, sync_timeout_secs } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, selector = ?selector, "run invoked");

            let mut config = ControllerConfig::from_env();
            config.name = gvk.clone();
            if let Some(w) = workers { config.workers = w; }
            if let Some(s) = resync_secs { config.resync_period = Duration::from_secs(s); }
            if let Some(m) = max_retries { config.max_retries = m; }
            if let Some(t) = sync_timeout_secs { config.sync_timeout = Some(Duration::from_secs(t)); }

            let mut source = KubeSource::for_gvk(&gvk, ns).await?;
            if let Some(sel) = selector {
                source = source.with_label_selector(sel);
            }
            let controller = Controller::new(Arc::new(source), Arc::new(LogReconciler { output: cli.output }), config)?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    match signal::ctrl_c().await {
                        Ok(()) => info!("Ctrl-C received; shutting down"),
                        Err(e) => error!(error = %e, "failed to listen for Ctrl-C; shutting down"),
                    }
                    cancel.cancel();
                }
            });

            match controller.run(cancel).await {
                Ok(()) => {}
                Err(e @ ControllerError::SyncTimeout(_)) => {
                    error!(error = %e, "controller failed to sync");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
