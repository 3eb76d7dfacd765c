use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatmesh::store::{EntityStore, FileStore, MemoryStore, PeerStore, SqliteStore};
use chatmesh::{Node, NodeConfig};

/// Run a chatmesh replication node.
#[derive(Debug, Parser)]
#[command(name = "chatmesh-node", author, about, version)]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Peer listener address
    #[arg(short, long, value_name = "HOST:PORT")]
    listen: Option<String>,

    /// Host announced to peers
    #[arg(long, value_name = "HOST")]
    advertise_host: Option<String>,

    /// Client listener address
    #[arg(long, value_name = "HOST:PORT")]
    client_listen: Option<String>,

    /// Peer to join at startup (repeatable)
    #[arg(short, long = "seed", value_name = "HOST:PORT")]
    seeds: Vec<String>,

    /// Name announced when joining
    #[arg(short, long)]
    name: Option<String>,

    /// SQLite database path
    #[arg(short, long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.advertise_host.is_some() {
            config.advertise_host = self.advertise_host;
        }
        if self.client_listen.is_some() {
            config.client_listen = self.client_listen;
        }
        if !self.seeds.is_empty() {
            config.seeds = self.seeds;
        }
        if self.name.is_some() {
            config.node_name = self.name;
        }
        if self.database.is_some() {
            config.database = self.database;
        }
        Ok(config)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn run<S>(config: NodeConfig, store: Arc<S>) -> anyhow::Result<()>
where
    S: EntityStore + FileStore + PeerStore + 'static,
{
    let node = Node::start(config, store).await.context("starting node")?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    node.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config = args.into_config()?;

    match config.database.clone() {
        Some(path) => {
            let store = SqliteStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
            run(config, Arc::new(store)).await
        }
        None => run(config, Arc::new(MemoryStore::new())).await,
    }
}
