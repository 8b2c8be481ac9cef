//! `snode` command line.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;
use tracing::info;

use sao_store::{LocalShardStore, StagingArea};

use crate::api::{run_api_server, AppState};
use crate::node::Node;
use crate::repo::{self, Repo};
use crate::server::run_server;
use crate::transport::multiaddr_to_host_port;

/// SAO storage node.
///
/// Runs the gateway coordinator and the storage provider in one process.
#[derive(Parser)]
#[command(name = "snode", version, about = "SAO storage node")]
pub struct Cli {
    /// repo directory for the sao storage node
    #[arg(long, global = true, env = repo::ENV_REPO_PATH)]
    pub repo: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a new repo
    Init(InitArgs),
    /// Wipe the durable index and staging area, keep keys and config
    Reset,
    /// Unbind the node address and leave the network
    Quit,
    /// Run the node
    Run,
}

#[derive(Args)]
pub struct InitArgs {
    /// node's account name or address
    #[arg(long)]
    pub creator: String,

    /// multiaddr this node publishes for peers
    #[arg(long, default_value = "/ip4/127.0.0.1/tcp/5153")]
    pub multiaddr: String,

    /// chain rpc endpoint ("mock" selects the in-memory backend)
    #[arg(long = "chain-address", default_value = "http://localhost:26657")]
    pub chain_address: String,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let path = repo::resolve_path(cli.repo.as_deref());
    let repo = Repo::new(&path);
    match cli.command {
        Command::Init(args) => {
            repo.init(&args.creator, &args.chain_address, &args.multiaddr)?;
            println!("repo initialized at {}", path.display());
            Ok(())
        }
        Command::Reset => {
            repo.open()?;
            repo.reset()?;
            println!("repo state cleared at {}", path.display());
            Ok(())
        }
        Command::Quit => {
            repo.open()?;
            let address = repo.node_address().unwrap_or_default();
            repo.clear_node_address()?;
            println!("node {} unbound; stop the running process to leave the network", address);
            Ok(())
        }
        Command::Run => cmd_run(repo).await,
    }
}

async fn cmd_run(repo: Repo) -> anyhow::Result<()> {
    repo.open()?;
    let cfg = repo.config().context("config.toml is malformed")?;
    let node_address = repo.node_address().context("keystore/metadata unreadable")?;
    let peer_key = repo.peer_key().context("peer key unreadable")?;
    info!(
        address = %node_address,
        peer = %hex::encode(peer_key.verifying_key().to_bytes()),
        "starting node"
    );

    let chain = sao_chain::build(&cfg.chain.remote);
    let store = Arc::new(LocalShardStore::new(repo.store_path())?);
    let staging = Arc::new(StagingArea::new(repo.staging_path())?);
    let ds = repo.datastore()?;

    let mut node = Node::new(node_address, cfg.clone(), chain, store, staging, ds);
    let shutdown = Arc::new(Notify::new());
    let mut handles = node.start(shutdown.clone())?;

    let listen: SocketAddr = multiaddr_to_host_port(&cfg.transport.listen_address)?
        .parse()
        .map_err(|e| anyhow!("transport listen address: {}", e))?;
    {
        let storage = node.storage.clone();
        let gateway = node.gateway.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_server(listen, storage, gateway, shutdown).await {
                tracing::error!("shard protocol server failed: {}", e);
            }
        }));
    }

    if cfg.api.enable {
        let addr: SocketAddr = cfg
            .api
            .listen_address
            .parse()
            .map_err(|e| anyhow!("api listen address: {}", e))?;
        let state = Arc::new(AppState {
            model: node.model.clone(),
            storage: node.storage.clone(),
            peer_address: cfg.transport.listen_address.clone(),
        });
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_api_server(addr, state, shutdown).await {
                tracing::error!("api server failed: {}", e);
            }
        }));
    }

    info!("node running, press ctrl-c to shut down");
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown requested");
    shutdown.notify_waiters();
    for handle in handles {
        let _ = handle.await;
    }
    info!("node stopped cleanly");
    Ok(())
}
