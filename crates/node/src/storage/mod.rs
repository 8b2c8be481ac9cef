//! Provider-side storage service.
//!
//! Owns the shard task queue and the migration queue, serves the
//! provider's half of the wire protocols, and exposes the operator
//! surfaces (`shard status/list/fix`, `migrate`, `migrate list`).

mod migrate;
mod worker;

pub use migrate::MigrateRequest;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use sao_chain::{ChainStore, ShardStatus, TxKind};
use sao_common::{did, Error, Result};
use sao_proto::shard::{
    next_response_id, AssignTxType, ShardAssignReq, ShardAssignResp, ShardLoadReq, ShardLoadResp,
    ShardMigrateReq, ShardMigrateResp,
};
use sao_store::ShardStore;

use crate::index::{self, Datastore};
use crate::state::{MigrateInfo, ShardInfo, ShardState};
use crate::transport::{FailResp, StorageProtocol};

pub struct StorageService {
    node_address: String,
    chain: Arc<dyn ChainStore>,
    store: Arc<dyn ShardStore>,
    ds: Datastore,
    task_tx: mpsc::UnboundedSender<ShardInfo>,
    migrate_tx: mpsc::UnboundedSender<MigrateRequest>,
    /// loopback protocol for shards whose gateway is this node
    local: Arc<dyn StorageProtocol>,
    stream: Arc<dyn StorageProtocol>,
}

impl StorageService {
    #[allow(clippy::type_complexity)]
    pub fn new(
        node_address: String,
        chain: Arc<dyn ChainStore>,
        store: Arc<dyn ShardStore>,
        ds: Datastore,
        local: Arc<dyn StorageProtocol>,
        stream: Arc<dyn StorageProtocol>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<ShardInfo>,
        mpsc::UnboundedReceiver<MigrateRequest>,
    ) {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (migrate_tx, migrate_rx) = mpsc::unbounded_channel();
        let svc = Arc::new(StorageService {
            node_address,
            chain,
            store,
            ds,
            task_tx,
            migrate_tx,
            local,
            stream,
        });
        (svc, task_rx, migrate_rx)
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    pub(crate) fn datastore(&self) -> &Datastore {
        &self.ds
    }

    /// Spawn the shard worker and the migrate worker. Restart replay runs
    /// first so pending records re-enter the queue before new traffic.
    pub fn start(
        self: Arc<Self>,
        task_rx: mpsc::UnboundedReceiver<ShardInfo>,
        migrate_rx: mpsc::UnboundedReceiver<MigrateRequest>,
        shutdown: Arc<Notify>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.replay_pending()?;
        let worker = worker::spawn_shard_worker(self.clone(), task_rx, shutdown.clone());
        let migrator = migrate::spawn_migrate_worker(self, migrate_rx, shutdown);
        Ok(vec![worker, migrator])
    }

    /// Re-enqueue every durable record that is neither complete nor
    /// terminated. A datastore failure here is fatal.
    fn replay_pending(&self) -> Result<usize> {
        let pending = index::pending_shards(&self.ds)?;
        let count = pending.len();
        if count > 0 {
            info!(count, "replaying pending shards");
        }
        for shard in pending {
            let _ = self.task_tx.send(shard);
        }
        Ok(count)
    }

    pub(crate) fn enqueue(&self, shard: ShardInfo) {
        let _ = self.task_tx.send(shard);
    }

    pub(crate) async fn resolve_protocol(
        &self,
        gateway: &str,
    ) -> Result<(Arc<dyn StorageProtocol>, String)> {
        if gateway == self.node_address {
            Ok((self.local.clone(), String::new()))
        } else {
            let peer = self.chain.get_node_peer(gateway).await?;
            Ok((self.stream.clone(), peer))
        }
    }

    // ── wire handlers ───────────────────────────────────────────────────

    /// Shard assignment notification. Verifies the referenced tx, loads
    /// the order, persists one `ShardInfo` per assigned cid and feeds the
    /// worker queue.
    pub async fn handle_shard_assign(&self, req: ShardAssignReq) -> ShardAssignResp {
        let fail = |err: Error| {
            error!("shard assign rejected: {}", err);
            ShardAssignResp::fail(err)
        };

        if req.assignee != self.node_address {
            return fail(Error::InvalidShardAssignee(format!(
                "assignee is {}, current node is {}",
                req.assignee, self.node_address
            )));
        }

        let tx = match self.chain.get_tx(&req.tx_hash, req.height).await {
            Ok(tx) => tx,
            Err(e) => return fail(e),
        };
        if tx.code != 0 {
            return fail(Error::InvalidTx(format!("tx {} failed with code {}", tx.hash, tx.code)));
        }
        let tx_matches = matches!(
            (&tx.kind, req.assign_tx_type),
            (Some(TxKind::Store { .. }), AssignTxType::MsgStore)
                | (Some(TxKind::Ready { .. }), AssignTxType::MsgReady)
        );
        if !tx_matches {
            return fail(Error::InvalidTx(format!(
                "tx {} does not carry a {:?} message",
                tx.hash, req.assign_tx_type
            )));
        }

        let order = match self.chain.get_order(req.order_id).await {
            Ok(order) => order,
            Err(e) => return fail(e),
        };

        let shard_cids: Vec<String> = order
            .shards
            .iter()
            .filter(|(provider, _)| provider.as_str() == self.node_address)
            .map(|(_, shard)| shard.cid.clone())
            .collect();
        if shard_cids.is_empty() {
            return fail(Error::InvalidProvider(format!(
                "order {} has no shard for provider {}",
                req.order_id, self.node_address
            )));
        }

        for cid in shard_cids {
            let shard = match index::get_shard(&self.ds, req.order_id, &cid) {
                Ok(Some(existing)) => existing,
                Ok(None) => {
                    let shard = ShardInfo {
                        order_id: req.order_id,
                        data_id: req.data_id.clone(),
                        cid: cid.clone(),
                        owner: order.owner.clone(),
                        gateway: order.provider.clone(),
                        order_operation: order.operation.to_string(),
                        shard_operation: order.operation.to_string(),
                        complete_hash: String::new(),
                        complete_height: 0,
                        size: 0,
                        tries: 0,
                        expire_height: order.expire,
                        state: ShardState::Validated,
                        last_err: String::new(),
                    };
                    if let Err(e) = index::save_shard(&self.ds, &shard) {
                        // best case is handling the shard again on retry
                        warn!(order_id = req.order_id, cid = %cid, "save shard failed: {}", e);
                    }
                    shard
                }
                Err(e) => return fail(e),
            };
            self.enqueue(shard);
        }
        ShardAssignResp { code: 0, message: String::new() }
    }

    /// Verified shard load: a gateway (or relay) fetching stored bytes.
    pub async fn handle_shard_load(&self, req: ShardLoadReq, remote_host: Option<&str>) -> ShardLoadResp {
        let fail = |err: Error| {
            error!("shard load rejected: {}", err);
            ShardLoadResp {
                order_id: req.order_id,
                cid: req.cid.clone(),
                request_id: req.request_id,
                response_id: next_response_id(),
                ..ShardLoadResp::fail(err)
            }
        };

        let proposal = match &req.proposal {
            Some(p) => p,
            None => {
                return fail(Error::InvalidParameters(
                    "load from a storage provider requires a query proposal".to_string(),
                ))
            }
        };

        // signature: the owner's sid document must verify the query
        if !proposal.is_public() {
            let doc = match self.chain.get_sid_document(&proposal.proposal.owner).await {
                Ok(doc) => doc,
                Err(e) => return fail(e),
            };
            let payload = match proposal.proposal.signing_bytes() {
                Ok(b) => b,
                Err(e) => return fail(e),
            };
            if let Err(e) = did::verify_jws(&payload, &proposal.jws_signature, &doc) {
                return fail(e);
            }
        }

        // peer: the caller must be the gateway the query was signed for,
        // or a relay that gateway vouched for
        if let Some(remote) = remote_host {
            let gateway_ok = proposal.proposal.gateway.contains(remote);
            if !gateway_ok {
                match &req.relay_proposal {
                    Some(relay)
                        if !relay.signature.is_empty() && relay.relay_peer_ids.contains(remote) =>
                    {
                        if let Err(e) = self.verify_relay(relay).await {
                            return fail(e);
                        }
                    }
                    _ => {
                        return fail(Error::InvalidParameters(format!(
                            "unexpected gateway peer {}, proposal names {}",
                            remote, proposal.proposal.gateway
                        )))
                    }
                }
            }
        }

        let last_height = match self.chain.get_last_height().await {
            Ok(h) => h,
            Err(e) => return fail(e),
        };
        if (proposal.proposal.last_valid_height as i64) < last_height {
            return fail(Error::InvalidParameters(format!(
                "invalid query, LastValidHeight:{} < now:{}",
                proposal.proposal.last_valid_height, last_height
            )));
        }

        match self.store.get(&req.cid) {
            Ok(Some(content)) => ShardLoadResp {
                order_id: req.order_id,
                cid: req.cid.clone(),
                content,
                request_id: req.request_id,
                response_id: next_response_id(),
                ..Default::default()
            },
            Ok(None) => fail(Error::DataMissing(format!("shard {} not in store", req.cid))),
            Err(e) => fail(e),
        }
    }

    async fn verify_relay(&self, relay: &sao_proto::proposal::RelayProposal) -> Result<()> {
        let account = self.chain.get_account(&relay.node_address).await?;
        let doc = sao_common::did::SidDocument {
            version_id: account.address.clone(),
            keys: vec![account.public_key.clone()],
        };
        // the relay proposal is signed raw by the gateway account key
        let payload = relay.signing_bytes()?;
        let sig: [u8; 64] = relay
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidParameters("relay signature must be 64 bytes".to_string()))?;
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};
        for key_hex in &doc.keys {
            let bytes = hex::decode(key_hex)
                .map_err(|e| Error::UnMarshalFailed(format!("relay key: {}", e)))?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::UnMarshalFailed("relay key must be 32 bytes".to_string()))?;
            let key = VerifyingKey::from_bytes(&arr)
                .map_err(|e| Error::UnMarshalFailed(format!("relay key: {}", e)))?;
            if key.verify(&payload, &Signature::from_bytes(&sig)).is_ok() {
                return Ok(());
            }
        }
        Err(Error::InvalidParameters(format!(
            "relay proposal signature does not match account {}",
            relay.node_address
        )))
    }

    /// Receiver half of a shard migration.
    pub async fn handle_shard_migrate(&self, req: ShardMigrateReq) -> ShardMigrateResp {
        let fail = |err: Error| {
            error!("shard migrate rejected: {}", err);
            ShardMigrateResp::fail(err)
        };

        let tx = match self.chain.get_tx(&req.tx_hash, req.tx_height).await {
            Ok(tx) => tx,
            Err(e) => return fail(e),
        };
        if tx.code != 0 {
            return fail(Error::InvalidTx(format!("tx {} failed with code {}", tx.hash, tx.code)));
        }
        let results = match &tx.kind {
            Some(TxKind::Migrate { result }) => result,
            _ => return fail(Error::InvalidTx(format!("tx {} is not a migrate tx", tx.hash))),
        };
        match results.get(&req.data_id) {
            Some(r) if r.starts_with("SUCCESS") => {}
            Some(r) => return fail(Error::InvalidTx(format!("migrate of {} failed: {}", req.data_id, r))),
            None => {
                return fail(Error::InvalidTx(format!(
                    "data id {} not in migrate tx {}",
                    req.data_id, req.tx_hash
                )))
            }
        }

        let order = match self.chain.get_order(req.order_id).await {
            Ok(order) => order,
            Err(e) => return fail(e),
        };
        let shard = match order.shards.get(&self.node_address) {
            Some(s) => s,
            None => {
                return fail(Error::InvalidProvider(format!(
                    "no shard assigned to provider {}",
                    self.node_address
                )))
            }
        };
        if shard.from != req.migrate_from {
            return fail(Error::InvalidProvider(format!(
                "unmatched migrate source: expected {}, actual {}",
                req.migrate_from, shard.from
            )));
        }
        if shard.cid != req.cid {
            return fail(Error::InvalidShardCid(format!(
                "unmatched cid: expected {}, actual {}",
                req.cid, shard.cid
            )));
        }
        if shard.status != ShardStatus::Waiting {
            return fail(Error::InvalidProvider(format!(
                "shard status should be Waiting, actual {:?}",
                shard.status
            )));
        }

        if let Err(e) = self.store.store(&req.cid, &req.content) {
            return fail(e);
        }
        let (hash, height) = match self
            .chain
            .complete_order(&self.node_address, order.id, &req.cid, req.content.len() as u64)
            .await
        {
            Ok(coords) => coords,
            Err(e) => return fail(e),
        };
        ShardMigrateResp { code: 0, message: String::new(), complete_hash: hash, complete_height: height }
    }

    // ── operator surfaces ───────────────────────────────────────────────

    pub fn shard_status(&self, order_id: u64, cid: &str) -> Result<ShardInfo> {
        index::get_shard(&self.ds, order_id, cid)?
            .ok_or_else(|| Error::DataMissing(format!("shard order={} cid={}", order_id, cid)))
    }

    pub fn shard_list(&self) -> Result<Vec<ShardInfo>> {
        let keys = index::get_shard_index(&self.ds)?;
        let mut shards = Vec::with_capacity(keys.all.len());
        for key in &keys.all {
            if let Some(shard) = index::get_shard(&self.ds, key.order_id, &key.cid)? {
                shards.push(shard);
            }
        }
        Ok(shards)
    }

    /// Operator reset for a terminated shard: rewind to the last state the
    /// local store still backs, clear the retry budget, re-enqueue.
    pub fn shard_fix(&self, order_id: u64, cid: &str) -> Result<()> {
        let mut shard = self.shard_status(order_id, cid)?;
        shard.tries = 0;
        if shard.state == ShardState::Terminate {
            shard.state = if self.store.is_exist(&shard.cid) {
                ShardState::Stored
            } else {
                ShardState::Validated
            };
        }
        index::save_shard(&self.ds, &shard)?;
        info!(order_id, cid, state = %shard.state, "shard fix re-enqueued");
        self.enqueue(shard);
        Ok(())
    }

    pub fn migrate_list(&self) -> Result<Vec<MigrateInfo>> {
        let keys = index::get_migrate_index(&self.ds)?;
        let mut migrations = Vec::with_capacity(keys.all.len());
        for key in &keys.all {
            if let Some(mi) = index::get_migrate(&self.ds, key.order_id, &key.cid)? {
                migrations.push(mi);
            }
        }
        Ok(migrations)
    }

    /// Initiator path: ask the chain to relocate the given data ids away
    /// from this provider, then queue the transfers the chain granted.
    pub async fn migrate(&self, data_ids: Vec<String>) -> Result<(String, HashMap<String, String>)> {
        migrate::initiate(self, data_ids).await
    }
}

/// Is the request a staged fetch (no proposal) or a verified load?
/// Staged fetches are served by the gateway half of the node.
pub fn is_staged_load(req: &ShardLoadReq) -> bool {
    req.proposal.is_none()
}
