//! Deterministic in-memory chain backend.
//!
//! Drives unit and integration tests and the `remote = "mock"` local
//! development mode. Semantics mirror the real chain module as far as
//! nodes observe it: order creation assigns `replica` shards round-robin
//! over the registered provider pool, completion of every shard finalises
//! the order's metadata and fires the order-complete subscription, and a
//! migration adds a `Waiting` shard entry for the chosen destination with
//! `from` set to the old provider.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use sao_common::did::SidDocument;
use sao_common::{cid::is_data_id, Error, Result};
use sao_proto::model::{format_commit, ShardMeta};
use sao_proto::proposal::{
    MetadataProposal, Operation, OrderProposal, OrderRenewProposal, OrderStoreProposal,
    OrderTerminateProposal, Permission, PermissionProposal,
};

use crate::messages::{
    AccountInfo, Metadata, Order, OrderCompleteResult, OrderShard, OrderStatus, ShardStatus,
    TxInfo, TxKind,
};
use crate::ChainStore;

#[derive(Default)]
struct MockState {
    height: i64,
    next_order_id: u64,
    tx_seq: u64,
    assign_cursor: usize,
    /// address → published peer multiaddr
    peers: HashMap<String, String>,
    /// shard assignment pool
    providers: Vec<String>,
    accounts: HashMap<String, AccountInfo>,
    sid_docs: HashMap<String, SidDocument>,
    did_bindings: HashMap<String, String>,
    orders: HashMap<u64, Order>,
    /// order id → the proposal that will become metadata on completion
    pending: HashMap<u64, OrderProposal>,
    meta: HashMap<String, Metadata>,
    /// data id → (height, snapshot) in ascending height order
    history: HashMap<String, Vec<(i64, Metadata)>>,
    /// owner-alias-group → data id
    keys: HashMap<String, String>,
    permissions: HashMap<String, Permission>,
    txs: HashMap<String, TxInfo>,
    subs: HashMap<u64, Vec<mpsc::Sender<OrderCompleteResult>>>,
}

pub struct MockChain {
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        MockChain { state: Mutex::new(MockState { height: 1, next_order_id: 1, ..Default::default() }) }
    }

    /// Register a storage provider: resolvable peer + member of the shard
    /// assignment pool.
    pub fn register_provider(&self, address: &str, peer: &str) {
        let mut st = self.state.lock();
        st.peers.insert(address.to_string(), peer.to_string());
        if !st.providers.iter().any(|p| p == address) {
            st.providers.push(address.to_string());
        }
    }

    /// Register a gateway (peer resolution only, never assigned shards).
    pub fn register_gateway(&self, address: &str, peer: &str) {
        self.state.lock().peers.insert(address.to_string(), peer.to_string());
    }

    pub fn register_account(&self, address: &str, public_key_hex: &str) {
        self.state.lock().accounts.insert(
            address.to_string(),
            AccountInfo { address: address.to_string(), public_key: public_key_hex.to_string() },
        );
    }

    pub fn register_sid_document(&self, doc: SidDocument) {
        self.state.lock().sid_docs.insert(doc.version_id.clone(), doc);
    }

    /// Move the chain head forward, e.g. to expire an order in tests.
    pub fn advance_height(&self, blocks: i64) {
        self.state.lock().height += blocks;
    }
}

fn tx_hash(seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"sao-mock-tx");
    hasher.update(seq.to_be_bytes());
    hex::encode_upper(hasher.finalize())
}

impl MockState {
    fn next_tx(&mut self) -> (String, i64) {
        self.tx_seq += 1;
        self.height += 1;
        (tx_hash(self.tx_seq), self.height)
    }

    fn record_tx(&mut self, hash: &str, height: i64, kind: Option<TxKind>) {
        self.txs.insert(hash.to_string(), TxInfo { hash: hash.to_string(), height, code: 0, kind });
    }

    fn assign_shards(&mut self, replica: i32, cid: &str) -> Result<HashMap<String, OrderShard>> {
        if self.providers.is_empty() {
            return Err(Error::InvalidProvider("no storage provider registered".to_string()));
        }
        let mut shards = HashMap::new();
        for i in 0..replica as usize {
            let provider = self.providers[(self.assign_cursor + i) % self.providers.len()].clone();
            shards.insert(
                provider,
                OrderShard { cid: cid.to_string(), status: ShardStatus::Waiting, from: String::new() },
            );
        }
        self.assign_cursor = (self.assign_cursor + replica as usize) % self.providers.len();
        Ok(shards)
    }

    fn shard_meta_view(&self, order: &Order) -> HashMap<String, ShardMeta> {
        let mut view = HashMap::new();
        // stable shard ids: provider order is sorted for determinism
        let mut providers: Vec<&String> = order.shards.keys().collect();
        providers.sort();
        for (i, provider) in providers.into_iter().enumerate() {
            let shard = &order.shards[provider];
            view.insert(
                provider.clone(),
                ShardMeta {
                    shard_id: i as u64,
                    peer: self.peers.get(provider).cloned().unwrap_or_default(),
                    cid: shard.cid.clone(),
                    provider: provider.clone(),
                },
            );
        }
        view
    }

    fn finalize_order(&mut self, order_id: u64, height: i64) {
        let order = match self.orders.get_mut(&order_id) {
            Some(o) => o,
            None => return,
        };
        if order.status == OrderStatus::Completed {
            return;
        }
        if order.shards.values().any(|s| s.status != ShardStatus::Completed) {
            return;
        }
        order.status = OrderStatus::Completed;
        let order = order.clone();

        let data_id = order.data_id.clone();
        if let Some(proposal) = self.pending.remove(&order_id) {
            let shards = self.shard_meta_view(&order);
            if proposal.operation == Operation::Renew {
                if let Some(meta) = self.meta.get_mut(&data_id) {
                    meta.order_id = order_id;
                }
            } else {
                if !self.meta.contains_key(&data_id) {
                    let alias = if proposal.alias.is_empty() {
                        proposal.cid.clone()
                    } else {
                        proposal.alias.clone()
                    };
                    self.keys.insert(
                        format!("{}-{}-{}", proposal.owner, alias, proposal.group_id),
                        data_id.clone(),
                    );
                    self.meta.insert(
                        data_id.clone(),
                        Metadata {
                            data_id: data_id.clone(),
                            alias,
                            group_id: proposal.group_id.clone(),
                            owner: proposal.owner.clone(),
                            tags: proposal.tags.clone(),
                            extend_info: proposal.extend_info.clone(),
                            ..Default::default()
                        },
                    );
                }
                let meta = self.meta.get_mut(&data_id).expect("inserted above");
                meta.order_id = order_id;
                meta.cid = proposal.cid.clone();
                meta.commit = proposal.commit_id.clone();
                meta.commits.push(format_commit(&proposal.commit_id, height));
                meta.shards = shards;
            }
            if let Some(meta) = self.meta.get(&data_id) {
                self.history.entry(data_id.clone()).or_default().push((height, meta.clone()));
            }
        }

        debug!(order_id, data_id = %data_id, "mock order complete");
        let result = OrderCompleteResult {
            order_id,
            data_id,
            result: format!("SUCCESS={}", order_id),
        };
        if let Some(senders) = self.subs.get(&order_id) {
            for tx in senders {
                let _ = tx.try_send(result.clone());
            }
        }
    }

    fn resolve_data_id(&self, owner: &str, keyword: &str, group: &str) -> Result<String> {
        if is_data_id(keyword) {
            return Ok(keyword.to_string());
        }
        self.keys
            .get(&format!("{}-{}-{}", owner, keyword, group))
            .cloned()
            .ok_or_else(|| Error::QueryMetadataFailed(format!("unknown keyword {}", keyword)))
    }

    fn check_read_permission(&self, meta: &Metadata, requester: &str) -> Result<()> {
        if requester == meta.owner {
            return Ok(());
        }
        match self.permissions.get(&meta.data_id) {
            None => Ok(()),
            Some(perm) => {
                if perm.readonly_dids.iter().any(|d| d == requester)
                    || perm.readwrite_dids.iter().any(|d| d == requester)
                {
                    Ok(())
                } else {
                    Err(Error::QueryMetadataFailed(format!(
                        "{} has no read permission on {}",
                        requester, meta.data_id
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl ChainStore for MockChain {
    async fn store_order(
        &self,
        _signer: &str,
        proposal: &OrderStoreProposal,
    ) -> Result<(u64, String)> {
        proposal.proposal.validate()?;
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();
        let p = &proposal.proposal;
        let shards = st.assign_shards(p.replica, &p.cid)?;
        let order_id = st.next_order_id;
        st.next_order_id += 1;
        let order = Order {
            id: order_id,
            owner: p.owner.clone(),
            provider: p.provider.clone(),
            data_id: p.data_id.clone(),
            cid: p.cid.clone(),
            duration: p.duration,
            replica: p.replica,
            timeout: p.timeout,
            operation: p.operation,
            expire: (height + p.duration as i64) as u64,
            status: OrderStatus::Pending,
            shards,
        };
        st.orders.insert(order_id, order);
        st.pending.insert(order_id, p.clone());
        st.record_tx(&hash, height, Some(TxKind::Store { order_id, proposal: Box::new(proposal.clone()) }));
        Ok((order_id, hash))
    }

    async fn order_ready(&self, _signer: &str, order_id: u64) -> Result<String> {
        let mut st = self.state.lock();
        if !st.orders.contains_key(&order_id) {
            return Err(Error::InvalidTx(format!("order {} not found", order_id)));
        }
        let (hash, height) = st.next_tx();
        st.record_tx(&hash, height, Some(TxKind::Ready { order_id }));
        Ok(hash)
    }

    async fn complete_order(
        &self,
        signer: &str,
        order_id: u64,
        cid: &str,
        _size: u64,
    ) -> Result<(String, i64)> {
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();

        let order = st
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::InvalidTx(format!("order {} not found", order_id)))?;
        if height as u64 > order.expire {
            return Err(Error::ExpiredOrder(format!(
                "order {}: latest={} expireAt={}",
                order_id, height, order.expire
            )));
        }
        let shard = order
            .shards
            .get_mut(signer)
            .ok_or_else(|| Error::InvalidProvider(format!("{} holds no shard of order {}", signer, order_id)))?;
        if shard.cid != cid {
            return Err(Error::InvalidShardCid(format!("expected {}, got {}", shard.cid, cid)));
        }
        shard.status = ShardStatus::Completed;

        st.record_tx(&hash, height, Some(TxKind::Complete { order_id, cid: cid.to_string() }));
        st.finalize_order(order_id, height);
        Ok((hash, height))
    }

    async fn renew_order(
        &self,
        signer: &str,
        proposal: &OrderRenewProposal,
    ) -> Result<(String, HashMap<String, String>)> {
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();
        let mut results = HashMap::new();
        for data_id in &proposal.proposal.data_ids {
            let meta = match st.meta.get(data_id) {
                Some(m) => m.clone(),
                None => {
                    results.insert(data_id.clone(), format!("FAILED: {} not found", data_id));
                    continue;
                }
            };
            let order_id = st.next_order_id;
            st.next_order_id += 1;
            let shards: HashMap<String, OrderShard> = meta
                .shards
                .values()
                .map(|s| {
                    (
                        s.provider.clone(),
                        OrderShard { cid: s.cid.clone(), status: ShardStatus::Waiting, from: String::new() },
                    )
                })
                .collect();
            let order = Order {
                id: order_id,
                owner: meta.owner.clone(),
                // the renewing gateway coordinates completion
                provider: signer.to_string(),
                data_id: data_id.clone(),
                cid: meta.cid.clone(),
                duration: proposal.proposal.duration,
                replica: shards.len() as i32,
                timeout: proposal.proposal.timeout,
                operation: Operation::Renew,
                expire: (height + proposal.proposal.duration as i64) as u64,
                status: OrderStatus::Pending,
                shards,
            };
            st.orders.insert(order_id, order);
            st.pending.insert(
                order_id,
                OrderProposal {
                    owner: meta.owner.clone(),
                    data_id: data_id.clone(),
                    cid: meta.cid.clone(),
                    operation: Operation::Renew,
                    ..Default::default()
                },
            );
            results.insert(data_id.clone(), format!("SUCCESS={}", order_id));
        }
        st.record_tx(&hash, height, None);
        Ok((hash, results))
    }

    async fn migrate_order(
        &self,
        signer: &str,
        data_ids: Vec<String>,
    ) -> Result<(String, HashMap<String, String>, i64)> {
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();
        let mut results = HashMap::new();
        for data_id in &data_ids {
            let order_id = match st.meta.get(data_id) {
                Some(m) => m.order_id,
                None => {
                    results.insert(data_id.clone(), format!("FAILED: {} not found", data_id));
                    continue;
                }
            };
            let destination = {
                let order = match st.orders.get(&order_id) {
                    Some(o) => o,
                    None => {
                        results.insert(data_id.clone(), format!("FAILED: order {} not found", order_id));
                        continue;
                    }
                };
                if !order.shards.contains_key(signer) {
                    results.insert(
                        data_id.clone(),
                        format!("FAILED: {} holds no shard of {}", signer, data_id),
                    );
                    continue;
                }
                match st
                    .providers
                    .iter()
                    .find(|p| p.as_str() != signer && !order.shards.contains_key(p.as_str()))
                {
                    Some(p) => p.clone(),
                    None => {
                        results.insert(data_id.clone(), "FAILED: no destination provider".to_string());
                        continue;
                    }
                }
            };
            let order = st.orders.get_mut(&order_id).expect("checked above");
            let cid = order.shards[signer].cid.clone();
            order.shards.insert(
                destination,
                OrderShard { cid, status: ShardStatus::Waiting, from: signer.to_string() },
            );
            results.insert(data_id.clone(), format!("SUCCESS={}", order_id));
        }
        st.record_tx(&hash, height, Some(TxKind::Migrate { result: results.clone() }));
        Ok((hash, results, height))
    }

    async fn terminate_order(
        &self,
        _signer: &str,
        proposal: &OrderTerminateProposal,
    ) -> Result<String> {
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();
        let data_id = proposal.proposal.data_id.clone();
        let order_id = st
            .meta
            .get(&data_id)
            .map(|m| m.order_id)
            .ok_or_else(|| Error::QueryMetadataFailed(format!("unknown data id {}", data_id)))?;
        if let Some(order) = st.orders.get_mut(&order_id) {
            order.status = OrderStatus::Terminated;
        }
        st.meta.remove(&data_id);
        st.record_tx(&hash, height, None);
        Ok(hash)
    }

    async fn update_permission(&self, _signer: &str, proposal: &PermissionProposal) -> Result<String> {
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();
        st.permissions
            .insert(proposal.proposal.data_id.clone(), proposal.proposal.clone());
        st.record_tx(&hash, height, None);
        Ok(hash)
    }

    async fn update_did_binding(&self, _signer: &str, did: &str, account_id: &str) -> Result<String> {
        let mut st = self.state.lock();
        let (hash, height) = st.next_tx();
        st.did_bindings.insert(did.to_string(), account_id.to_string());
        st.record_tx(&hash, height, None);
        Ok(hash)
    }

    async fn query_metadata(&self, proposal: &MetadataProposal, height: i64) -> Result<Metadata> {
        let st = self.state.lock();
        let q = &proposal.proposal;
        let data_id = st.resolve_data_id(&q.owner, &q.keyword, &q.group_id)?;
        let meta = st
            .meta
            .get(&data_id)
            .ok_or_else(|| Error::QueryMetadataFailed(format!("no metadata for {}", data_id)))?;
        if !proposal.is_public() {
            st.check_read_permission(meta, &q.owner)?;
        } else if st.permissions.contains_key(&data_id) {
            return Err(Error::QueryMetadataFailed(format!(
                "{} is not publicly readable",
                data_id
            )));
        }
        if height == 0 {
            return Ok(meta.clone());
        }
        let snapshots = st
            .history
            .get(&data_id)
            .ok_or_else(|| Error::QueryMetadataFailed(format!("no history for {}", data_id)))?;
        snapshots
            .iter()
            .rev()
            .find(|(h, _)| *h <= height)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| Error::QueryMetadataFailed(format!("no snapshot of {} at {}", data_id, height)))
    }

    async fn query_data_id(&self, key: &str) -> Result<String> {
        self.state
            .lock()
            .keys
            .get(key)
            .cloned()
            .ok_or_else(|| Error::QueryMetadataFailed(format!("unknown key {}", key)))
    }

    async fn get_order(&self, order_id: u64) -> Result<Order> {
        self.state
            .lock()
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| Error::InvalidTx(format!("order {} not found", order_id)))
    }

    async fn get_meta(&self, data_id: &str) -> Result<Metadata> {
        self.state
            .lock()
            .meta
            .get(data_id)
            .cloned()
            .ok_or_else(|| Error::QueryMetadataFailed(format!("no metadata for {}", data_id)))
    }

    async fn get_sid_document(&self, version_id: &str) -> Result<SidDocument> {
        self.state
            .lock()
            .sid_docs
            .get(version_id)
            .cloned()
            .ok_or_else(|| Error::GetSidDocumentFailed(version_id.to_string()))
    }

    async fn get_node_peer(&self, address: &str) -> Result<String> {
        self.state
            .lock()
            .peers
            .get(address)
            .cloned()
            .ok_or_else(|| Error::InvalidProvider(format!("no peer for {}", address)))
    }

    async fn get_account(&self, address: &str) -> Result<AccountInfo> {
        self.state
            .lock()
            .accounts
            .get(address)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(address.to_string()))
    }

    async fn get_tx(&self, hash: &str, _height: i64) -> Result<TxInfo> {
        self.state
            .lock()
            .txs
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::InvalidTx(format!("tx {} not found", hash)))
    }

    async fn get_last_height(&self) -> Result<i64> {
        Ok(self.state.lock().height)
    }

    async fn subscribe_order_complete(
        &self,
        order_id: u64,
    ) -> Result<mpsc::Receiver<OrderCompleteResult>> {
        let (tx, rx) = mpsc::channel(4);
        let mut st = self.state.lock();
        if let Some(order) = st.orders.get(&order_id) {
            if order.status == OrderStatus::Completed {
                let _ = tx.try_send(OrderCompleteResult {
                    order_id,
                    data_id: order.data_id.clone(),
                    result: format!("SUCCESS={}", order_id),
                });
            }
        }
        st.subs.entry(order_id).or_default().push(tx);
        Ok(rx)
    }

    async fn unsubscribe_order_complete(&self, order_id: u64) -> Result<()> {
        self.state.lock().subs.remove(&order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sao_common::cid::{calculate_cid, new_data_id};

    fn store_proposal(owner: &str, provider: &str, content: &[u8]) -> OrderStoreProposal {
        OrderStoreProposal {
            proposal: OrderProposal {
                owner: owner.to_string(),
                provider: provider.to_string(),
                duration: 365,
                replica: 1,
                timeout: 60,
                alias: "model".to_string(),
                data_id: new_data_id(),
                commit_id: new_data_id(),
                cid: calculate_cid(content),
                size: content.len() as u64,
                operation: Operation::Create,
                ..Default::default()
            },
            jws_signature: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_store_assigns_and_complete_finalizes() {
        let chain = MockChain::new();
        chain.register_provider("sao1prov", "/ip4/127.0.0.1/tcp/5153");
        chain.register_gateway("sao1gw", "/ip4/127.0.0.1/tcp/5253");

        let proposal = store_proposal("did:sao:alice", "sao1gw", b"hello");
        let (order_id, _) = chain.store_order("sao1gw", &proposal).await.expect("store");

        let order = chain.get_order(order_id).await.expect("get order");
        assert_eq!(order.shards.len(), 1);
        assert!(order.shards.contains_key("sao1prov"));
        assert_eq!(order.shards["sao1prov"].status, ShardStatus::Waiting);

        let mut rx = chain.subscribe_order_complete(order_id).await.expect("subscribe");
        let cid = proposal.proposal.cid.clone();
        chain.complete_order("sao1prov", order_id, &cid, 5).await.expect("complete");

        let done = rx.recv().await.expect("completion event");
        assert_eq!(done.order_id, order_id);

        let meta = chain.get_meta(&proposal.proposal.data_id).await.expect("meta");
        assert_eq!(meta.commits.len(), 1);
        assert_eq!(meta.cid, cid);
        chain.unsubscribe_order_complete(order_id).await.expect("unsub");
        chain.unsubscribe_order_complete(order_id).await.expect("unsub twice");
    }

    #[tokio::test]
    async fn test_complete_wrong_provider_rejected() {
        let chain = MockChain::new();
        chain.register_provider("sao1prov", "/p");
        let proposal = store_proposal("did:sao:alice", "sao1gw", b"x");
        let (order_id, _) = chain.store_order("sao1gw", &proposal).await.expect("store");
        let err = chain
            .complete_order("sao1other", order_id, &proposal.proposal.cid, 1)
            .await
            .expect_err("wrong provider");
        assert!(matches!(err, Error::InvalidProvider(_)));
    }

    #[tokio::test]
    async fn test_migrate_adds_waiting_entry() {
        let chain = MockChain::new();
        chain.register_provider("sao1a", "/a");
        let proposal = store_proposal("did:sao:alice", "sao1gw", b"content");
        let (order_id, _) = chain.store_order("sao1gw", &proposal).await.expect("store");
        chain
            .complete_order("sao1a", order_id, &proposal.proposal.cid, 7)
            .await
            .expect("complete");

        chain.register_provider("sao1b", "/b");
        let data_id = proposal.proposal.data_id.clone();
        let (_, results, _) =
            chain.migrate_order("sao1a", vec![data_id.clone()]).await.expect("migrate");
        assert!(results[&data_id].starts_with("SUCCESS"));

        let order = chain.get_order(order_id).await.expect("order");
        let entry = &order.shards["sao1b"];
        assert_eq!(entry.status, ShardStatus::Waiting);
        assert_eq!(entry.from, "sao1a");
    }

    #[tokio::test]
    async fn test_permission_gates_query() {
        let chain = MockChain::new();
        chain.register_provider("sao1prov", "/p");
        let proposal = store_proposal("did:sao:owner", "sao1gw", b"secret");
        let (order_id, _) = chain.store_order("sao1gw", &proposal).await.expect("store");
        chain
            .complete_order("sao1prov", order_id, &proposal.proposal.cid, 6)
            .await
            .expect("complete");

        let data_id = proposal.proposal.data_id.clone();
        chain
            .update_permission(
                "did:sao:owner",
                &PermissionProposal {
                    proposal: Permission {
                        owner: "did:sao:owner".into(),
                        data_id: data_id.clone(),
                        readonly_dids: vec!["did:sao:x".into()],
                        readwrite_dids: vec![],
                    },
                    jws_signature: Default::default(),
                },
            )
            .await
            .expect("permission");

        let mut query = MetadataProposal::default();
        query.proposal.keyword = data_id.clone();
        query.proposal.owner = "did:sao:y".into();
        assert!(matches!(
            chain.query_metadata(&query, 0).await,
            Err(Error::QueryMetadataFailed(_))
        ));

        query.proposal.owner = "did:sao:x".into();
        let meta = chain.query_metadata(&query, 0).await.expect("granted");
        assert_eq!(meta.data_id, data_id);
    }
}
