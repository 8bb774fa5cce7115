//! FamStore storage node binary.
//!
//! Serves one radix tree engine on the location listed for `--node` in the
//! cluster file:
//!
//! ```bash
//! famstore-node --config cluster.json --node 0
//! famstore-node --config cluster.json --node 1 --heap-size 268435456
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use famstore_cluster::{ClusterConfig, NodeServer};
use famstore_core::{start_maintenance, EngineConfig, EngineMetrics, MemoryManager, PoolId, RadixTreeEngine};

/// FamStore storage node.
#[derive(Parser, Debug)]
#[command(name = "famstore-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster configuration file (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Index of this node in the configuration's node list.
    #[arg(long)]
    node: usize,

    /// Memory pool id for the engine.
    #[arg(long, default_value = "1")]
    pool: u8,

    /// Pool size in bytes.
    #[arg(long)]
    heap_size: Option<u64>,

    /// Address to bind; defaults to 0.0.0.0 on the configured port.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "storage node failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = ClusterConfig::load(&args.config)?;
    let location = cluster.nodes.get(args.node).ok_or_else(|| {
        format!("node index {} out of range: cluster has {} node(s)", args.node, cluster.nodes.len())
    })?;

    let mut config = EngineConfig::server().with_pool(PoolId(args.pool));
    if let Some(size) = args.heap_size {
        config.heap_size_bytes = size;
    }
    let cadence = config.maintenance_cadence;

    let mmgr = MemoryManager::new();
    let engine = Arc::new(RadixTreeEngine::open(&mmgr, config, None, Arc::new(EngineMetrics::new()))?);
    info!(node = args.node, %location, root = %engine.location(), "engine ready");
    let _maintenance = start_maintenance(Arc::clone(&engine), cadence)?;

    let bind = args.bind.unwrap_or_else(|| format!("0.0.0.0:{}", location.port));
    let server = NodeServer::bind(engine, bind.as_str())?;
    server.run()?;
    Ok(())
}
