use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use rekon_controller::{
    CancellationToken, Controller, ControllerConfig, Informer, ReconcileError, Reconciler,
};
use rekon_core::{DynObject, ObjectKey, Resource};
use rekon_kubehub::KubeSource;
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "rekon: level-triggered controller runtime")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects for a given group/version/kind key
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Run a controller that logs every reconcile until Ctrl-C
    Run {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Concurrent reconcile workers
        #[arg(long, env = "REKON_WORKERS")]
        workers: Option<usize>,
        /// Re-deliver every cached object at this interval (0 disables)
        #[arg(long = "resync-secs", env = "REKON_RESYNC_SECS")]
        resync_secs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Serialize)]
struct Row<'a> {
    kind: &'a str,
    namespace: Option<&'a str>,
    name: &'a str,
    age: String,
}

fn row(obj: &DynObject) -> Row<'_> {
    Row { kind: obj.kind().unwrap_or("-"), namespace: obj.namespace(), name: obj.name(), age: render_age(obj.creation_ts) }
}

fn render_age(creation_ts: i64) -> String {
    render_age_at(creation_ts, chrono::Utc::now().timestamp())
}

fn render_age_at(creation_ts: i64, now: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

/// Logs each reconcile; in JSON mode also prints one line per key.
struct LoggingReconciler {
    output: Output,
}

#[derive(Serialize)]
struct Reconciled<'a> {
    key: &'a str,
    present: bool,
    #[serde(rename = "resourceVersion")]
    resource_version: Option<&'a str>,
}

#[async_trait]
impl Reconciler<DynObject> for LoggingReconciler {
    async fn reconcile(&self, key: &ObjectKey, obj: Option<Arc<DynObject>>) -> Result<(), ReconcileError> {
        let rv = obj.as_deref().and_then(|o| o.resource_version());
        match &obj {
            Some(o) => info!(key = %key, rv = ?rv, kind = ?o.kind(), "reconcile: present"),
            None => info!(key = %key, "reconcile: gone"),
        }
        if self.output == Output::Json {
            let line = Reconciled { key: key.as_str(), present: obj.is_some(), resource_version: rv };
            let json = serde_json::to_string(&line).map_err(|e| ReconcileError::Other(Box::new(e)))?;
            println!("{}", json);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let resources = rekon_kubehub::discover().await?;
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
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let mut items = rekon_kubehub::list_once(&gvk, ns).await?;
            items.sort_by(|a, b| a.key().cmp(&b.key()));
            let rows: Vec<Row<'_>> = items.iter().map(row).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<20} {:<48} {:>8}", "KIND", "NAMESPACE", "NAME", "AGE");
                    for r in &rows {
                        println!("{:<24} {:<20} {:<48} {:>8}", r.kind, r.namespace.unwrap_or("-"), r.name, r.age);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Run { gvk, workers, resync_secs } => {
            let mut config = ControllerConfig::from_env();
            if let Some(n) = workers {
                config.workers = n.max(1);
            }
            if let Some(secs) = resync_secs {
                config.informer.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
            }
            info!(gvk = %gvk, ns = ?ns, workers = config.workers, resync = ?config.informer.resync_period, "run invoked");

            let source = KubeSource::connect(&gvk, ns).await.with_context(|| format!("connecting to {}", gvk))?;
            let informer = Informer::new(source, config.informer.clone());
            let controller = Controller::new(informer, LoggingReconciler { output: cli.output }, config);

            let cancel = CancellationToken::new();
            let mut task = tokio::spawn(controller.run(cancel.clone()));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received; shutting down");
                    cancel.cancel();
                    task.await.context("joining controller")??;
                }
                joined = &mut task => {
                    error!("controller exited unexpectedly");
                    joined.context("joining controller")??;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_render_in_largest_units() {
        let now = 1_000_000;
        assert_eq!(render_age_at(0, now), "-");
        assert_eq!(render_age_at(now - 42, now), "42s");
        assert_eq!(render_age_at(now - 5 * 60 - 3, now), "5m");
        assert_eq!(render_age_at(now - 2 * 3600 - 7 * 60, now), "2h7m");
        assert_eq!(render_age_at(now - 3 * 86_400 - 4 * 3600, now), "3d4h");
        // clock skew
        assert_eq!(render_age_at(now + 10, now), "0s");
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["rekonctl", "-o", "json", "--ns", "prod", "run", "apps/v1/Deployment", "--workers", "3"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.namespace.as_deref(), Some("prod"));
        match cli.command {
            Commands::Run { gvk, workers, .. } => {
                assert_eq!(gvk, "apps/v1/Deployment");
                assert_eq!(workers, Some(3));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
