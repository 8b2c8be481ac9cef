//! Signed proposal envelopes submitted by clients.
//!
//! Every envelope pairs a domain proposal with a detached JWS over the
//! proposal's canonical JSON bytes. The owner value "all" marks an
//! unsigned public query.

use serde::{Deserialize, Serialize};

use sao_common::did::{JwsSignature, OWNER_ALL};
use sao_common::{Error, Result};

/// extend-info above this size is rejected with `InvalidParameters`.
pub const MAX_EXTEND_INFO: usize = 1024;

/// What an order does. Serialised as its integer tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Operation {
    Create,
    ForceUpdate,
    Renew,
}

impl From<Operation> for u32 {
    fn from(op: Operation) -> u32 {
        match op {
            Operation::Create => 1,
            Operation::ForceUpdate => 2,
            Operation::Renew => 3,
        }
    }
}

impl TryFrom<u32> for Operation {
    type Error = String;

    fn try_from(v: u32) -> std::result::Result<Self, String> {
        match v {
            1 => Ok(Operation::Create),
            2 => Ok(Operation::ForceUpdate),
            3 => Ok(Operation::Renew),
            other => Err(format!("invalid operation {}", other)),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// Terms of a storage order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderProposal {
    pub owner: String,
    /// gateway address coordinating this order
    pub provider: String,
    pub group_id: String,
    /// lease duration in blocks
    pub duration: i32,
    pub replica: i32,
    /// blocks to wait for completion
    pub timeout: i32,
    pub alias: String,
    pub data_id: String,
    pub commit_id: String,
    pub tags: Vec<String>,
    pub cid: String,
    pub rule: String,
    pub extend_info: String,
    pub size: u64,
    #[serde(default = "default_operation")]
    pub operation: Operation,
}

fn default_operation() -> Operation {
    Operation::Create
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Create
    }
}

impl OrderProposal {
    /// Boundary checks shared by gateway and chain submission.
    pub fn validate(&self) -> Result<()> {
        if self.duration <= 0 {
            return Err(Error::InvalidParameters("duration must be > 0".to_string()));
        }
        if self.replica <= 0 {
            return Err(Error::InvalidParameters("replica must be > 0".to_string()));
        }
        if self.timeout <= 0 {
            return Err(Error::InvalidParameters("timeout must be > 0".to_string()));
        }
        if self.extend_info.len() > MAX_EXTEND_INFO {
            return Err(Error::InvalidParameters(format!(
                "extend-info exceeds {} bytes",
                MAX_EXTEND_INFO
            )));
        }
        Ok(())
    }

    /// Canonical bytes the JWS signs.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MarshalFailed(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderStoreProposal {
    pub proposal: OrderProposal,
    pub jws_signature: JwsSignature,
}

/// Read query for model metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryProposal {
    pub owner: String,
    pub keyword: String,
    pub group_id: String,
    pub keyword_type: u32,
    pub last_valid_height: u64,
    pub gateway: String,
    pub commit_id: String,
    pub version: String,
}

impl QueryProposal {
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MarshalFailed(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataProposal {
    pub proposal: QueryProposal,
    pub jws_signature: JwsSignature,
}

impl MetadataProposal {
    /// Public queries carry the "all" owner and skip signature checks.
    pub fn is_public(&self) -> bool {
        self.proposal.owner == OWNER_ALL
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RenewProposal {
    pub owner: String,
    pub duration: i32,
    pub timeout: i32,
    pub data_ids: Vec<String>,
}

impl RenewProposal {
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MarshalFailed(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderRenewProposal {
    pub proposal: RenewProposal,
    pub jws_signature: JwsSignature,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TerminateProposal {
    pub owner: String,
    pub data_id: String,
}

impl TerminateProposal {
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MarshalFailed(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderTerminateProposal {
    pub proposal: TerminateProposal,
    pub jws_signature: JwsSignature,
}

/// Read/write grants on a model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Permission {
    pub owner: String,
    pub data_id: String,
    pub readonly_dids: Vec<String>,
    pub readwrite_dids: Vec<String>,
}

impl Permission {
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MarshalFailed(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PermissionProposal {
    pub proposal: Permission,
    pub jws_signature: JwsSignature,
}

/// A gateway may delegate shard loads to a relay it signed for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayProposal {
    pub node_address: String,
    pub relay_peer_ids: String,
    pub signature: Vec<u8>,
}

impl RelayProposal {
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = RelayProposal {
            node_address: self.node_address.clone(),
            relay_peer_ids: self.relay_peer_ids.clone(),
            signature: Vec::new(),
        };
        serde_json::to_vec(&unsigned).map_err(|e| Error::MarshalFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> OrderProposal {
        OrderProposal {
            owner: "did:sao:abc".into(),
            provider: "sao1gateway".into(),
            duration: 365,
            replica: 1,
            timeout: 60,
            alias: "m".into(),
            cid: "deadbeef".into(),
            size: 5,
            operation: Operation::Create,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_boundaries() {
        assert!(proposal().validate().is_ok());

        let mut p = proposal();
        p.duration = 0;
        assert!(matches!(p.validate(), Err(Error::InvalidParameters(_))));

        let mut p = proposal();
        p.replica = 0;
        assert!(p.validate().is_err());

        let mut p = proposal();
        p.timeout = -1;
        assert!(p.validate().is_err());

        let mut p = proposal();
        p.extend_info = "x".repeat(MAX_EXTEND_INFO + 1);
        assert!(p.validate().is_err());
        p.extend_info = "x".repeat(MAX_EXTEND_INFO);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_operation_wire_tags() {
        let json = serde_json::to_string(&Operation::ForceUpdate).expect("ser");
        assert_eq!(json, "2");
        let back: Operation = serde_json::from_str("3").expect("de");
        assert_eq!(back, Operation::Renew);
        assert!(serde_json::from_str::<Operation>("9").is_err());
    }

    #[test]
    fn test_marshal_identity() {
        let env = OrderStoreProposal { proposal: proposal(), jws_signature: Default::default() };
        let bytes = serde_json::to_vec(&env).expect("ser");
        let back: OrderStoreProposal = serde_json::from_slice(&bytes).expect("de");
        assert_eq!(back.proposal.owner, env.proposal.owner);
        assert_eq!(back.proposal.operation, env.proposal.operation);
        assert_eq!(serde_json::to_vec(&back).expect("ser2"), bytes);
    }

    #[test]
    fn test_public_query_sentinel() {
        let mut q = MetadataProposal::default();
        assert!(!q.is_public());
        q.proposal.owner = "all".into();
        assert!(q.is_public());
    }
}
