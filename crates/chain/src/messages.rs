//! Chain-side views of orders, metadata and transactions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use sao_proto::model::ShardMeta;
use sao_proto::proposal::{Operation, OrderStoreProposal};

/// Status of one shard inside an order, as the chain tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Waiting,
    Completed,
}

/// One provider's shard entry inside an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderShard {
    pub cid: String,
    pub status: ShardStatus,
    /// previous provider when this entry was created by a migration
    #[serde(default)]
    pub from: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Completed,
    Terminated,
}

/// A chain order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Order {
    pub id: u64,
    pub owner: String,
    pub provider: String,
    pub data_id: String,
    pub cid: String,
    pub duration: i32,
    pub replica: i32,
    pub timeout: i32,
    pub operation: Operation,
    /// height after which shard completion is no longer accepted
    pub expire: u64,
    pub status: OrderStatus,
    /// provider address → shard entry
    pub shards: HashMap<String, OrderShard>,
}

/// Model metadata as the chain reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    pub data_id: String,
    pub alias: String,
    pub group_id: String,
    pub owner: String,
    pub order_id: u64,
    pub tags: Vec<String>,
    pub cid: String,
    pub commit: String,
    pub commits: Vec<String>,
    pub extend_info: String,
    pub shards: HashMap<String, ShardMeta>,
}

/// Decoded body of a chain transaction, as far as nodes care.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxKind {
    Store { order_id: u64, proposal: Box<OrderStoreProposal> },
    Ready { order_id: u64 },
    Complete { order_id: u64, cid: String },
    Migrate { result: HashMap<String, String> },
}

/// A transaction looked up by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInfo {
    pub hash: String,
    pub height: i64,
    pub code: u32,
    pub kind: Option<TxKind>,
}

/// Delivered on the order-complete subscription channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompleteResult {
    pub order_id: u64,
    pub data_id: String,
    pub result: String,
}

/// Chain account info needed for relay verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    /// hex-encoded ed25519 verifying key
    pub public_key: String,
}
