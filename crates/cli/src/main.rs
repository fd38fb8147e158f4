use std::collections::BTreeMap;
use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use argus_core::{Envelope, IdentitySet, ResourceKind, SensorMessage};
use argus_persist::{DurableStore, SqliteStore};
use argus_pipeline::{fragments::standard_fragments, ClusterSyncState, Dispatcher, NullSink};
use argus_reconcile::{AuthoritativeSource, Coordinator, ReconcileConfig};
use clap::{Parser, Subcommand, ValueEnum};
use rustc_hash::FxHashMap;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "argusctl", version, about = "Argus central tooling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path (default: ARGUS_DB_PATH or ~/.argus/argus.db)
    #[arg(long = "db", global = true)]
    db: Option<String>,

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
    /// Replay an NDJSON capture of sensor envelopes through the pipeline
    Replay {
        /// File of newline-delimited Envelope JSON
        file: String,
    },
    /// List durable keys for a cluster and kind
    Keys {
        #[arg(long = "cluster")]
        cluster: String,
        /// Resource kind, e.g. "node" or "deployment"
        #[arg(long = "kind")]
        kind: ResourceKind,
    },
    /// Run one reconciliation pass from a captured authoritative-set file
    Reconcile {
        /// JSON file mapping kind to identity list, e.g. {"node": ["a","b"]}
        file: String,
        #[arg(long = "cluster")]
        cluster: String,
    },
}

fn init_tracing() {
    let env = std::env::var("ARGUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARGUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARGUS_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(db: Option<&str>) -> Result<Arc<dyn DurableStore>> {
    let store = match db {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

/// Serves a captured authoritative-set file as the reconciliation source.
struct FileSource {
    sets: FxHashMap<(String, ResourceKind), IdentitySet>,
}

#[async_trait::async_trait]
impl AuthoritativeSource for FileSource {
    async fn fetch(&self, cluster_id: &str, kind: ResourceKind) -> Result<IdentitySet> {
        self.sets
            .get(&(cluster_id.to_string(), kind))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("capture has no set for {cluster_id}/{kind}"))
    }
}

async fn replay(file: &str, store: Arc<dyn DurableStore>, output: Output) -> Result<()> {
    let f = std::fs::File::open(file).with_context(|| format!("opening {}", file))?;
    let dispatcher = Dispatcher::new(standard_fragments(&store))?;
    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    let mut sync_states: BTreeMap<String, ClusterSyncState> = BTreeMap::new();

    for (idx, line) in std::io::BufReader::new(f).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let env: Envelope = match serde_json::from_str(&line) {
            Ok(env) => env,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping unparsable line");
                skipped += 1;
                continue;
            }
        };
        // Reconcile responses are not routable; they parameterize the
        // healing pass run after the stream is drained.
        if let SensorMessage::ReconcileResponse { kind, ids } = &env.msg {
            sync_states.entry(env.cluster_id.clone()).or_default().insert(*kind, ids.clone());
            continue;
        }
        match dispatcher.dispatch(&env, &NullSink).await {
            Ok(()) => processed += 1,
            Err(e) => {
                failed += 1;
                error!(line = idx + 1, error = %e, "dispatch failed");
            }
        }
    }

    for (cluster, sync) in &sync_states {
        info!(cluster = %cluster, "healing from captured reconcile responses");
        dispatcher.reconcile_all(cluster, sync).await;
    }

    match output {
        Output::Human => {
            println!("processed {processed}, failed {failed}, skipped {skipped}");
        }
        Output::Json => println!(
            "{}",
            serde_json::json!({ "processed": processed, "failed": failed, "skipped": skipped })
        ),
    }
    Ok(())
}

fn keys(store: &dyn DurableStore, cluster: &str, kind: ResourceKind, output: Output) -> Result<()> {
    let keys = store.list_keys(cluster, kind)?;
    match output {
        Output::Human => {
            for key in &keys {
                println!("{key}");
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
    }
    Ok(())
}

async fn reconcile(
    file: &str,
    cluster: &str,
    store: Arc<dyn DurableStore>,
    output: Output,
) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let by_kind: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&raw).context("parsing authoritative-set capture")?;

    let mut sets = FxHashMap::default();
    let mut kinds = Vec::new();
    for (kind_str, ids) in by_kind {
        let kind: ResourceKind = kind_str
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("in {}", file))?;
        kinds.push(kind);
        sets.insert((cluster.to_string(), kind), ids.into_iter().collect::<IdentitySet>());
    }

    let dispatcher = Arc::new(Dispatcher::new(standard_fragments(&store))?);
    let mut config = ReconcileConfig::from_env();
    config.kinds = kinds;
    let coordinator = Coordinator::new(Arc::new(FileSource { sets }), dispatcher, config);
    coordinator.run_pass(cluster).await;

    match output {
        Output::Human => println!("reconciliation pass complete for {cluster}"),
        Output::Json => println!("{}", serde_json::json!({ "cluster": cluster, "done": true })),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let store = open_store(cli.db.as_deref())?;
    match cli.command {
        Commands::Replay { file } => replay(&file, store, cli.output).await,
        Commands::Keys { cluster, kind } => keys(store.as_ref(), &cluster, kind, cli.output),
        Commands::Reconcile { file, cluster } => {
            reconcile(&file, &cluster, store, cli.output).await
        }
    }
}
