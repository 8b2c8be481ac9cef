//! Shard protocol messages.
//!
//! Two families: assign/complete (gateway ↔ provider order coordination)
//! and load/migrate (shard bytes moving between peers). All messages ride
//! in JSON frames (see [`crate::frame`]); binary contents are base64
//! strings on the wire.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::proposal::{MetadataProposal, RelayProposal};

pub const SHARD_ASSIGN_PROTOCOL: &str = "/sao/shard/assign/1.0";
pub const SHARD_COMPLETE_PROTOCOL: &str = "/sao/shard/complete/1.0";
pub const SHARD_LOAD_PROTOCOL: &str = "/sao/store/shard/1.0";
pub const SHARD_MIGRATE_PROTOCOL: &str = "/sao/store/migrate/1.0";

/// Which chain message an assignment notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignTxType {
    MsgStore,
    MsgReady,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardAssignReq {
    pub order_id: u64,
    pub data_id: String,
    pub assignee: String,
    pub tx_hash: String,
    pub height: i64,
    pub assign_tx_type: AssignTxType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardAssignResp {
    pub code: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardCompleteReq {
    pub order_id: u64,
    pub data_id: String,
    pub cids: Vec<String>,
    pub tx_hash: String,
    pub height: i64,
    pub code: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardCompleteResp {
    pub code: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardLoadReq {
    pub order_id: u64,
    pub owner: String,
    pub cid: String,
    /// present when this is a verified model fetch; absent for the staged
    /// fetch a provider issues while storing a shard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<MetadataProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_proposal: Option<RelayProposal>,
    pub request_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardLoadResp {
    pub order_id: u64,
    pub cid: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub code: u64,
    pub message: String,
    pub request_id: i64,
    pub response_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardMigrateReq {
    pub migrate_from: String,
    pub order_id: u64,
    pub data_id: String,
    pub tx_hash: String,
    pub tx_height: i64,
    pub cid: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardMigrateResp {
    pub code: u64,
    pub message: String,
    pub complete_hash: String,
    pub complete_height: i64,
}

/// Response ids must increase monotonically even when several responses
/// land in the same millisecond.
pub fn next_response_id() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    LAST.fetch_max(now, Ordering::Relaxed);
    LAST.fetch_add(1, Ordering::Relaxed) + 1
}

/// Binary content as base64 strings inside JSON messages.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_resp_content_is_base64_on_wire() {
        let resp = ShardLoadResp {
            order_id: 3,
            cid: "c".into(),
            content: b"hello".to_vec(),
            request_id: 11,
            response_id: 12,
            ..Default::default()
        };
        let json = serde_json::to_string(&resp).expect("ser");
        assert!(json.contains("aGVsbG8="), "content must be base64: {}", json);
        let back: ShardLoadResp = serde_json::from_str(&json).expect("de");
        assert_eq!(back.content, b"hello");
        assert_eq!(back.request_id, 11);
    }

    #[test]
    fn test_assign_req_roundtrip() {
        let req = ShardAssignReq {
            order_id: 9,
            data_id: "d".into(),
            assignee: "sao1prov".into(),
            tx_hash: "AB".into(),
            height: 40,
            assign_tx_type: AssignTxType::MsgReady,
        };
        let json = serde_json::to_vec(&req).expect("ser");
        let back: ShardAssignReq = serde_json::from_slice(&json).expect("de");
        assert_eq!(back.assign_tx_type, AssignTxType::MsgReady);
        assert_eq!(back.order_id, 9);
        assert_eq!(serde_json::to_vec(&back).expect("ser2"), json);
    }

    #[test]
    fn test_response_ids_monotonic() {
        let a = next_response_id();
        let b = next_response_id();
        let c = next_response_id();
        assert!(a < b && b < c);
    }
}
