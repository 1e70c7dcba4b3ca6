// holo-mesh node binary.
//
// Opens a fjall keyspace, binds the TCP transport, joins or bootstraps the
// cluster and serves until Ctrl-C.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_mesh::cluster::Address;
use holo_mesh::storage::FjallEngine;
use holo_mesh::transport::tcp::TcpTransport;
use holo_mesh::transport::Transport;
use holo_mesh::{ClusterConfig, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "holo-mesh")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Address to listen on and advertise to peers.
    #[arg(long)]
    listen: String,

    /// Address peers should use, if different from the bound one.
    #[arg(long)]
    advertise: Option<String>,

    /// Comma-separated seed peers. Empty bootstraps a new cluster.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[arg(long, env = "HOLO_MESH_GOSSIP_INTERVAL_MS", default_value_t = 1000)]
    gossip_interval_ms: u64,

    #[arg(long, env = "HOLO_MESH_KV_GOSSIP_INTERVAL_MS", default_value_t = 1000)]
    kv_gossip_interval_ms: u64,

    #[arg(long, env = "HOLO_MESH_RECOVERY_THRESHOLD", default_value_t = 5)]
    recovery_threshold: u32,

    #[arg(long, env = "HOLO_MESH_KV_MAX_BATCH_BYTES", default_value_t = 1 << 20)]
    kv_max_batch_bytes: usize,

    /// Give up joining after this many seconds. 0 retries forever.
    #[arg(long, env = "HOLO_MESH_JOIN_TIMEOUT_SECS", default_value_t = 0)]
    join_timeout_secs: u64,
}

impl NodeArgs {
    fn config(&self, address: Address) -> NodeConfig {
        let peers = self
            .peers
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(Address::from);
        let mut cfg = NodeConfig::new(address).with_peers(peers);
        cfg.cluster.gossip_interval = Duration::from_millis(self.gossip_interval_ms.max(1));
        cfg.cluster.join_timeout =
            (self.join_timeout_secs > 0).then(|| Duration::from_secs(self.join_timeout_secs));
        cfg.kv.gossip_interval = Duration::from_millis(self.kv_gossip_interval_ms.max(1));
        cfg.kv.recovery_threshold = self.recovery_threshold;
        cfg.kv.max_batch_bytes = self.kv_max_batch_bytes.max(1);
        cfg
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fjall=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let engine = Arc::new(FjallEngine::open(&args.data_dir).context("open keyspace")?);

    // Assignment requests wait for a responsible's full proposal loop.
    let defaults = ClusterConfig::default();
    let rpc_timeout =
        defaults.request_timeout + defaults.quorum_timeout * defaults.max_proposals as u32;
    let transport = Arc::new(TcpTransport::listen(&args.listen, rpc_timeout).await?);
    let address = match &args.advertise {
        Some(addr) => Address::from(addr.as_str()),
        None => transport.address().clone(),
    };
    let cfg = args.config(address);
    tracing::info!(listen = %transport.address(), peers = cfg.peers.len(), "starting node");

    let node = Node::open(cfg, engine.clone(), transport).await?;
    tracing::info!(id = node.id(), key = %node.cluster().key(), "node ready");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    node.close().await?;
    engine.persist()
}
