//! Chain adapter facade.
//!
//! [`ChainStore`] is the seam every node component talks through: typed
//! message submitters, typed queries and order-complete subscriptions.
//! Two backends implement it — [`CosmosChain`] speaks JSON over HTTP to a
//! remote endpoint, [`MockChain`] is a deterministic in-memory chain used
//! by tests and local development. Both share subscription semantics, so
//! callers cannot tell them apart.

pub mod cosmos;
pub mod messages;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sao_common::did::SidDocument;
use sao_common::Result;
use sao_proto::proposal::{
    MetadataProposal, OrderRenewProposal, OrderStoreProposal, OrderTerminateProposal,
    PermissionProposal,
};

pub use cosmos::CosmosChain;
pub use messages::{
    AccountInfo, Metadata, Order, OrderCompleteResult, OrderShard, OrderStatus, ShardStatus,
    TxInfo, TxKind,
};
pub use mock::MockChain;

/// Fixed block interval, used to convert durations and timeouts expressed
/// in blocks to wall-clock time.
pub const BLOCKTIME: Duration = Duration::from_secs(6);

/// Sentinel selecting the in-memory backend in `config.toml`.
pub const MOCK_REMOTE: &str = "mock";

#[async_trait]
pub trait ChainStore: Send + Sync {
    // ── tx submitters ───────────────────────────────────────────────────

    /// Submit `MsgStore`; returns `(order_id, tx_hash)`.
    async fn store_order(&self, signer: &str, proposal: &OrderStoreProposal)
        -> Result<(u64, String)>;

    /// Submit `MsgReady` for an order the client already published.
    async fn order_ready(&self, signer: &str, order_id: u64) -> Result<String>;

    /// Submit `MsgComplete`; returns `(tx_hash, height)`.
    async fn complete_order(&self, signer: &str, order_id: u64, cid: &str, size: u64)
        -> Result<(String, i64)>;

    /// Submit `MsgRenew`; returns `(tx_hash, data_id → result)`.
    async fn renew_order(&self, signer: &str, proposal: &OrderRenewProposal)
        -> Result<(String, HashMap<String, String>)>;

    /// Submit `MsgMigrate`; returns `(tx_hash, data_id → result, height)`.
    async fn migrate_order(&self, signer: &str, data_ids: Vec<String>)
        -> Result<(String, HashMap<String, String>, i64)>;

    /// Submit `MsgTerminate`.
    async fn terminate_order(&self, signer: &str, proposal: &OrderTerminateProposal)
        -> Result<String>;

    /// Submit `MsgUpdatePermission`.
    async fn update_permission(&self, signer: &str, proposal: &PermissionProposal)
        -> Result<String>;

    /// Bind a DID to a chain account.
    async fn update_did_binding(&self, signer: &str, did: &str, account_id: &str)
        -> Result<String>;

    // ── queries ─────────────────────────────────────────────────────────

    /// Permission-checked metadata query; `height == 0` means latest.
    async fn query_metadata(&self, proposal: &MetadataProposal, height: i64) -> Result<Metadata>;

    /// Resolve an `owner-keyword-group` key to a data id.
    async fn query_data_id(&self, key: &str) -> Result<String>;

    async fn get_order(&self, order_id: u64) -> Result<Order>;

    /// Unchecked metadata lookup by data id.
    async fn get_meta(&self, data_id: &str) -> Result<Metadata>;

    async fn get_sid_document(&self, version_id: &str) -> Result<SidDocument>;

    /// Resolve a node address to its published peer multiaddr.
    async fn get_node_peer(&self, address: &str) -> Result<String>;

    async fn get_account(&self, address: &str) -> Result<AccountInfo>;

    async fn get_tx(&self, hash: &str, height: i64) -> Result<TxInfo>;

    async fn get_last_height(&self) -> Result<i64>;

    // ── events ──────────────────────────────────────────────────────────

    /// Subscribe to completion of one order. The channel yields at most
    /// one result; cancel with [`ChainStore::unsubscribe_order_complete`].
    async fn subscribe_order_complete(&self, order_id: u64)
        -> Result<mpsc::Receiver<OrderCompleteResult>>;

    /// Idempotent: unsubscribing twice (or without a subscription) is ok.
    async fn unsubscribe_order_complete(&self, order_id: u64) -> Result<()>;
}

/// Pick a backend from the configured remote.
pub fn build(remote: &str) -> Arc<dyn ChainStore> {
    if remote == MOCK_REMOTE {
        Arc::new(MockChain::new())
    } else {
        Arc::new(CosmosChain::new(remote))
    }
}
