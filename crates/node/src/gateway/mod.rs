//! Gateway order coordinator.
//!
//! Translates client proposals into chain orders: stages the content,
//! publishes `MsgStore`/`MsgReady`, notifies the assigned providers,
//! waits for the order-complete event and returns the resulting
//! metadata. Also serves the gateway halves of the wire protocols:
//! staged shard loads and shard completion notices.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use sao_chain::{ChainStore, OrderStatus, ShardStatus, BLOCKTIME};
use sao_common::{cid, config, Error, Result};
use sao_proto::model::{parse_commit, Model, ShardMeta, TYPE_FILE_PREFIX};
use sao_proto::proposal::{MetadataProposal, OrderStoreProposal};
use sao_proto::shard::{
    next_response_id, AssignTxType, ShardAssignReq, ShardCompleteReq, ShardCompleteResp,
    ShardLoadReq, ShardLoadResp,
};
use sao_store::{ShardStore, StagingArea};

use crate::index::{self, Datastore};
use crate::state::{OrderInfo, OrderShardInfo, OrderShardState, OrderState};
use crate::transport::{FailResp, StorageProtocol};

/// What `commit_model` hands back to the client.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub order_id: u64,
    pub data_id: String,
    pub commit: String,
    pub commits: Vec<String>,
    pub shards: HashMap<String, ShardMeta>,
    pub cid: String,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub cid: String,
    pub content: Vec<u8>,
}

pub struct GatewayService {
    node_address: String,
    chain: Arc<dyn ChainStore>,
    store: Arc<dyn ShardStore>,
    staging: Arc<StagingArea>,
    ds: Datastore,
    cfg: config::Node,
    stream: Arc<dyn StorageProtocol>,
    /// assignment notifications for this node's own provider half
    local_assign: mpsc::UnboundedSender<ShardAssignReq>,
}

impl GatewayService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_address: String,
        chain: Arc<dyn ChainStore>,
        store: Arc<dyn ShardStore>,
        staging: Arc<StagingArea>,
        ds: Datastore,
        cfg: config::Node,
        stream: Arc<dyn StorageProtocol>,
        local_assign: mpsc::UnboundedSender<ShardAssignReq>,
    ) -> Arc<Self> {
        Arc::new(GatewayService {
            node_address,
            chain,
            store,
            staging,
            ds,
            cfg,
            stream,
            local_assign,
        })
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    pub fn staging(&self) -> &Arc<StagingArea> {
        &self.staging
    }

    /// Consume locally-delivered shard completion notices.
    pub fn start(
        self: Arc<Self>,
        mut complete_rx: mpsc::UnboundedReceiver<ShardCompleteReq>,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        let gw = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    req = complete_rx.recv() => {
                        let req = match req {
                            Some(r) => r,
                            None => break,
                        };
                        let resp = gw.handle_shard_complete(req).await;
                        if resp.code != 0 {
                            warn!("local shard complete rejected: {}", resp.message);
                        }
                    }
                }
            }
        })
    }

    // ── commit ──────────────────────────────────────────────────────────

    /// Stage content, publish the order, notify providers and wait for
    /// completion. The staged copy is removed no matter how the wait
    /// ends.
    pub async fn commit_model(
        &self,
        client_proposal: &OrderStoreProposal,
        mut order_id: u64,
        content: &[u8],
    ) -> Result<CommitResult> {
        let proposal = &client_proposal.proposal;
        proposal.validate()?;
        self.staging.stage(&proposal.owner, &proposal.cid, content)?;

        let (tx_hash, tx_type) = if order_id == 0 {
            let (id, hash) = self.chain.store_order(&self.node_address, client_proposal).await?;
            order_id = id;
            info!(order_id, tx = %hash, "MsgStore succeeded");
            (hash, AssignTxType::MsgStore)
        } else {
            let hash = self.chain.order_ready(&self.node_address, order_id).await?;
            info!(order_id, tx = %hash, "MsgReady succeeded");
            (hash, AssignTxType::MsgReady)
        };
        let order_height = self.chain.get_last_height().await?;

        self.record_order(proposal, order_id, &tx_hash, tx_type, order_height).await?;
        self.notify_assignees(order_id, &proposal.data_id, &tx_hash, tx_type, order_height).await;

        let mut done = self.chain.subscribe_order_complete(order_id).await?;
        debug!(order_id, "subscribed order complete");

        let timeout = BLOCKTIME * proposal.timeout as u32;
        let timed_out = tokio::select! {
            event = done.recv() => event.is_none(),
            _ = sleep(timeout) => true,
        };

        // deferred teardown: unsubscribe and unstage on every path
        if let Err(e) = self.chain.unsubscribe_order_complete(order_id).await {
            error!(order_id, "unsubscribe order complete failed: {}", e);
        }
        self.staging.unstage(&proposal.owner, &proposal.cid)?;

        if timed_out {
            self.update_order_state(&proposal.data_id, OrderState::Expired);
            return Err(Error::ExpiredOrder(format!("process order {} timeout", order_id)));
        }

        let meta = self.chain.get_meta(&proposal.data_id).await?;
        debug!(order_id = meta.order_id, data_id = %meta.data_id, "order complete");
        self.update_order_state(&proposal.data_id, OrderState::Complete);

        Ok(CommitResult {
            order_id: meta.order_id,
            data_id: meta.data_id,
            commit: meta.commit,
            commits: meta.commits,
            shards: meta.shards,
            cid: proposal.cid.clone(),
        })
    }

    async fn record_order(
        &self,
        proposal: &sao_proto::proposal::OrderProposal,
        order_id: u64,
        tx_hash: &str,
        tx_type: AssignTxType,
        order_height: i64,
    ) -> Result<()> {
        let order = self.chain.get_order(order_id).await?;
        let mut shards = HashMap::new();
        let mut providers: Vec<&String> = order.shards.keys().collect();
        providers.sort();
        for (i, provider) in providers.into_iter().enumerate() {
            let shard = &order.shards[provider];
            shards.insert(
                provider.clone(),
                OrderShardInfo {
                    shard_id: i as u64,
                    peer: self.chain.get_node_peer(provider).await.unwrap_or_default(),
                    cid: shard.cid.clone(),
                    provider: provider.clone(),
                    state: OrderShardState::Assigned,
                    complete_hash: String::new(),
                },
            );
        }
        index::save_order(
            &self.ds,
            &OrderInfo {
                data_id: proposal.data_id.clone(),
                owner: proposal.owner.clone(),
                cid: proposal.cid.clone(),
                stage_path: format!("{}/{}", proposal.owner, proposal.cid),
                order_id,
                order_hash: tx_hash.to_string(),
                order_tx_type: tx_type,
                order_height,
                shards,
                expire_height: order.expire,
                state: OrderState::Ready,
                tries: 0,
                last_err: String::new(),
            },
        )
    }

    /// Tell every assigned provider about its shard. Failures are logged
    /// only: providers also recover assignments from the durable index
    /// and the chain, so a missed notification is not fatal.
    async fn notify_assignees(
        &self,
        order_id: u64,
        data_id: &str,
        tx_hash: &str,
        tx_type: AssignTxType,
        height: i64,
    ) {
        let order = match self.chain.get_order(order_id).await {
            Ok(o) => o,
            Err(e) => {
                error!(order_id, "order lookup for assignment notify failed: {}", e);
                return;
            }
        };
        for provider in order.shards.keys() {
            let req = ShardAssignReq {
                order_id,
                data_id: data_id.to_string(),
                assignee: provider.clone(),
                tx_hash: tx_hash.to_string(),
                height,
                assign_tx_type: tx_type,
            };
            if provider == &self.node_address {
                let _ = self.local_assign.send(req);
                continue;
            }
            let peer = match self.chain.get_node_peer(provider).await {
                Ok(p) => p,
                Err(e) => {
                    error!(provider = %provider, "peer lookup failed: {}", e);
                    continue;
                }
            };
            let resp = self.stream.request_shard_assign(req, &peer).await;
            if resp.code != 0 {
                error!(provider = %provider, order_id, "shard assign refused: {}", resp.message);
            } else {
                self.mark_shard(data_id, provider, OrderShardState::Notified, "");
            }
        }
    }

    fn mark_shard(&self, data_id: &str, provider: &str, state: OrderShardState, complete_hash: &str) {
        let mut order = match index::get_order(&self.ds, data_id) {
            Ok(Some(o)) => o,
            _ => return,
        };
        if let Some(shard) = order.shards.get_mut(provider) {
            shard.state = state;
            if !complete_hash.is_empty() {
                shard.complete_hash = complete_hash.to_string();
            }
        }
        if let Err(e) = index::save_order(&self.ds, &order) {
            warn!(data_id, "save order failed: {}", e);
        }
    }

    fn update_order_state(&self, data_id: &str, state: OrderState) {
        let mut order = match index::get_order(&self.ds, data_id) {
            Ok(Some(o)) => o,
            _ => return,
        };
        order.state = state;
        if let Err(e) = index::save_order(&self.ds, &order) {
            warn!(data_id, "save order failed: {}", e);
        }
    }

    // ── queries ─────────────────────────────────────────────────────────

    /// Resolve a keyword to metadata. `height == 0` means latest.
    pub async fn query_meta(&self, req: &MetadataProposal, height: i64) -> Result<Model> {
        let q = &req.proposal;
        let data_id = if cid::is_data_id(&q.keyword) {
            q.keyword.clone()
        } else {
            self.chain
                .query_data_id(&format!("{}-{}-{}", q.owner, q.keyword, q.group_id))
                .await?
        };
        let mut resolved = req.clone();
        resolved.proposal.keyword = data_id;
        let meta = self.chain.query_metadata(&resolved, height).await?;

        let last_commit = meta
            .commits
            .last()
            .ok_or_else(|| Error::InvalidCommitInfo("metadata has no commits".to_string()))?;
        let (commit_id, _) = parse_commit(last_commit)?;

        Ok(Model {
            data_id: meta.data_id,
            alias: meta.alias,
            group_id: meta.group_id,
            owner: meta.owner,
            order_id: meta.order_id,
            tags: meta.tags,
            cid: meta.cid,
            shards: meta.shards,
            commit_id,
            commits: meta.commits,
            content: Vec::new(),
            extend_info: meta.extend_info,
            version: String::new(),
        })
    }

    /// Assemble model content from its shards, local ones straight from
    /// the store and remote ones over the streaming protocol.
    pub async fn fetch_content(&self, req: &MetadataProposal, meta: &Model) -> Result<FetchResult> {
        let mut content_list: Vec<Option<Vec<u8>>> = vec![None; meta.shards.len()];
        for (provider, shard) in &meta.shards {
            let slot = shard.shard_id as usize;
            if slot >= content_list.len() || content_list[slot].is_some() {
                continue;
            }
            let shard_content = if provider == &self.node_address {
                self.store
                    .get(&shard.cid)?
                    .ok_or_else(|| Error::DataMissing(format!("local shard {} missing", shard.cid)))?
            } else {
                let resp = self
                    .stream
                    .request_shard_load(
                        ShardLoadReq {
                            order_id: meta.order_id,
                            owner: meta.owner.clone(),
                            cid: shard.cid.clone(),
                            proposal: Some(req.clone()),
                            relay_proposal: None,
                            request_id: next_response_id(),
                        },
                        &shard.peer,
                    )
                    .await;
                if resp.code != 0 {
                    return Err(Error::FailuresResponsed(resp.message));
                }
                resp.content
            };
            content_list[slot] = Some(shard_content);
        }

        let mut content = Vec::new();
        for piece in content_list.into_iter().flatten() {
            content.extend_from_slice(&piece);
        }

        let content_cid = cid::calculate_cid(&content);
        if content_cid != meta.cid {
            error!(expected = %meta.cid, actual = %content_cid, "content cid mismatch");
        }

        let is_file = meta.alias.starts_with(TYPE_FILE_PREFIX);
        if content.len() > self.cfg.cache.content_limit || is_file {
            // oversized content is mirrored out instead of inlined
            let dir = crate::repo::expand_home(&self.cfg.http_file_server.path);
            std::fs::create_dir_all(&dir).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
            let path: PathBuf = dir.join(&meta.data_id);
            std::fs::write(&path, &content).map_err(|e| Error::WriteFileFailed(e.to_string()))?;
            if self.cfg.ipfs.enable {
                self.store.store(&content_cid, &content)?;
            }
            if content.len() > self.cfg.cache.content_limit {
                content = Vec::new();
            }
        }

        Ok(FetchResult { cid: content_cid, content })
    }

    // ── renew ───────────────────────────────────────────────────────────

    /// Re-publish readiness for renewal orders and wait for each to
    /// settle. Per-model failures are collected, not short-circuited.
    pub async fn renew_models(&self, delay: i32, renew: HashMap<String, u64>) -> Result<()> {
        let mut failures = String::new();
        for (data_id, order_id) in renew {
            if let Some(failure) = self.renew_model(delay, &data_id, order_id).await {
                failures.push('\n');
                failures.push_str(&failure);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::FailuresResponsed(failures))
        }
    }

    async fn renew_model(&self, delay: i32, data_id: &str, order_id: u64) -> Option<String> {
        debug!(order_id, data_id, "sending OrderReady (renew)");
        let tx_hash = match self.chain.order_ready(&self.node_address, order_id).await {
            Ok(h) => h,
            Err(e) => return Some(format!("failed to renew model[{}]: {}.", data_id, e)),
        };
        info!(order_id, tx = %tx_hash, data_id, "OrderReady (renew) succeeded");
        let height = match self.chain.get_last_height().await {
            Ok(h) => h,
            Err(e) => return Some(format!("failed to renew model[{}]: {}.", data_id, e)),
        };
        self.notify_assignees(order_id, data_id, &tx_hash, AssignTxType::MsgReady, height).await;

        let mut done = match self.chain.subscribe_order_complete(order_id).await {
            Ok(rx) => rx,
            Err(e) => return Some(format!("failed to renew model[{}]: {}.", data_id, e)),
        };
        let timed_out = tokio::select! {
            event = done.recv() => event.is_none(),
            _ = sleep(BLOCKTIME * delay as u32) => true,
        };
        if let Err(e) = self.chain.unsubscribe_order_complete(order_id).await {
            error!(order_id, "unsubscribe order complete failed: {}", e);
        }
        if timed_out {
            return Some(format!("failed to renew model[{}]: process order {} timeout.", data_id, order_id));
        }
        None
    }

    // ── wire handlers ───────────────────────────────────────────────────

    /// A provider fetching staged bytes while storing a shard.
    pub fn handle_shard_load_staged(&self, req: ShardLoadReq) -> ShardLoadResp {
        match self.staging.get_staged(&req.owner, &req.cid) {
            Ok(content) => ShardLoadResp {
                order_id: req.order_id,
                cid: req.cid,
                content,
                request_id: req.request_id,
                response_id: next_response_id(),
                ..Default::default()
            },
            Err(e) => {
                error!("staged shard load failed: {}", e);
                ShardLoadResp {
                    order_id: req.order_id,
                    cid: req.cid,
                    request_id: req.request_id,
                    response_id: next_response_id(),
                    ..ShardLoadResp::fail(e)
                }
            }
        }
    }

    /// A provider reporting its on-chain shard completion.
    pub async fn handle_shard_complete(&self, req: ShardCompleteReq) -> ShardCompleteResp {
        let fail = |err: Error| {
            error!("shard complete rejected: {}", err);
            ShardCompleteResp::fail(err)
        };

        let tx = match self.chain.get_tx(&req.tx_hash, req.height).await {
            Ok(tx) => tx,
            Err(e) => return fail(e),
        };
        if tx.code != 0 {
            // the provider should resubmit the right tx hash
            return fail(Error::InvalidTx(format!("tx {} failed with code {}", tx.hash, tx.code)));
        }

        let order = match self.chain.get_order(req.order_id).await {
            Ok(o) => o,
            Err(e) => return fail(e),
        };

        for (provider, shard) in &order.shards {
            if req.cids.iter().any(|c| c == &shard.cid) && shard.status == ShardStatus::Completed {
                self.mark_shard(&order.data_id, provider, OrderShardState::Completed, &req.tx_hash);
            }
        }
        if order.status == OrderStatus::Completed {
            self.update_order_state(&order.data_id, OrderState::Complete);
        }
        ShardCompleteResp { code: 0, message: String::new() }
    }

    // ── chain passthroughs ──────────────────────────────────────────────

    pub async fn renew(
        &self,
        proposal: &sao_proto::proposal::OrderRenewProposal,
    ) -> Result<(String, HashMap<String, String>)> {
        self.chain.renew_order(&self.node_address, proposal).await
    }

    pub async fn terminate(&self, proposal: &sao_proto::proposal::OrderTerminateProposal) -> Result<String> {
        self.chain.terminate_order(&self.node_address, proposal).await
    }

    pub async fn update_permission(
        &self,
        proposal: &sao_proto::proposal::PermissionProposal,
    ) -> Result<String> {
        self.chain.update_permission(&self.node_address, proposal).await
    }

    pub async fn get_meta(&self, data_id: &str) -> Result<sao_chain::Metadata> {
        self.chain.get_meta(data_id).await
    }

    pub async fn get_order(&self, order_id: u64) -> Result<sao_chain::Order> {
        self.chain.get_order(order_id).await
    }

    pub async fn last_height(&self) -> Result<i64> {
        self.chain.get_last_height().await
    }

    // ── operator surfaces ───────────────────────────────────────────────

    pub fn order_status(&self, data_id: &str) -> Result<OrderInfo> {
        index::get_order(&self.ds, data_id)?
            .ok_or_else(|| Error::DataMissing(format!("order for {}", data_id)))
    }

    pub fn order_list(&self) -> Result<Vec<OrderInfo>> {
        let keys = index::get_order_index(&self.ds)?;
        let mut orders = Vec::with_capacity(keys.all.len());
        for key in &keys.all {
            if let Some(order) = index::get_order(&self.ds, &key.data_id)? {
                orders.push(order);
            }
        }
        Ok(orders)
    }
}
