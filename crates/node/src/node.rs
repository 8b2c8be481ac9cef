//! Node wiring.
//!
//! A node plays both roles at once: the gateway coordinator and the
//! storage provider. The two halves never hold references to each other;
//! they are stitched together with channels — assignment notifications
//! flow gateway → storage, local completion notices flow storage →
//! gateway through the loopback protocol.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use sao_chain::ChainStore;
use sao_common::{config, Result};
use sao_proto::shard::{ShardAssignReq, ShardCompleteReq};
use sao_store::{ShardStore, StagingArea};

use crate::gateway::GatewayService;
use crate::index::Datastore;
use crate::model::ModelManager;
use crate::state::ShardInfo;
use crate::storage::{MigrateRequest, StorageService};
use crate::transport::{LocalProtocol, StreamProtocol};

pub struct Node {
    pub storage: Arc<StorageService>,
    pub gateway: Arc<GatewayService>,
    pub model: Arc<ModelManager>,
    task_rx: Option<mpsc::UnboundedReceiver<ShardInfo>>,
    migrate_rx: Option<mpsc::UnboundedReceiver<MigrateRequest>>,
    assign_rx: Option<mpsc::UnboundedReceiver<ShardAssignReq>>,
    complete_rx: Option<mpsc::UnboundedReceiver<ShardCompleteReq>>,
}

impl Node {
    pub fn new(
        node_address: String,
        cfg: config::Node,
        chain: Arc<dyn ChainStore>,
        store: Arc<dyn ShardStore>,
        staging: Arc<StagingArea>,
        ds: Datastore,
    ) -> Node {
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        let (assign_tx, assign_rx) = mpsc::unbounded_channel();

        let stream = Arc::new(StreamProtocol::new());
        let local = Arc::new(LocalProtocol::new(staging.clone(), complete_tx));

        let (storage, task_rx, migrate_rx) = StorageService::new(
            node_address.clone(),
            chain.clone(),
            store.clone(),
            ds.clone(),
            local,
            stream.clone(),
        );
        let gateway = GatewayService::new(
            node_address,
            chain,
            store,
            staging,
            ds,
            cfg.clone(),
            stream,
            assign_tx,
        );
        let model = ModelManager::new(cfg.cache, gateway.clone());

        Node {
            storage,
            gateway,
            model,
            task_rx: Some(task_rx),
            migrate_rx: Some(migrate_rx),
            assign_rx: Some(assign_rx),
            complete_rx: Some(complete_rx),
        }
    }

    /// Spawn every background loop: the shard and migrate workers
    /// (including restart replay), the gateway completion consumer and
    /// the local assignment pump.
    pub fn start(&mut self, shutdown: Arc<Notify>) -> Result<Vec<JoinHandle<()>>> {
        let task_rx = self.task_rx.take().expect("node already started");
        let migrate_rx = self.migrate_rx.take().expect("node already started");
        let assign_rx = self.assign_rx.take().expect("node already started");
        let complete_rx = self.complete_rx.take().expect("node already started");

        let mut handles = self.storage.clone().start(task_rx, migrate_rx, shutdown.clone())?;
        handles.push(self.gateway.clone().start(complete_rx, shutdown.clone()));
        handles.push(spawn_assign_pump(self.storage.clone(), assign_rx, shutdown));
        Ok(handles)
    }
}

fn spawn_assign_pump(
    storage: Arc<StorageService>,
    mut assign_rx: mpsc::UnboundedReceiver<ShardAssignReq>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                req = assign_rx.recv() => {
                    let req = match req {
                        Some(r) => r,
                        None => break,
                    };
                    let resp = storage.handle_shard_assign(req).await;
                    if resp.code != 0 {
                        warn!("local shard assign rejected: {}", resp.message);
                    }
                }
            }
        }
    })
}
