//! Flat error taxonomy shared by every crate in the workspace.
//!
//! Each variant is a distinct error kind; `code()` gives the stable wire
//! code carried in protocol responses (0 means success and is never a
//! variant here).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("invalid commit information: {0}")]
    InvalidCommitInfo(String),

    #[error("invalid tx: {0}")]
    InvalidTx(String),

    #[error("invalid shard assignee: {0}")]
    InvalidShardAssignee(String),

    #[error("invalid shard cid: {0}")]
    InvalidShardCid(String),

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error("create patch failed: {0}")]
    CreatePatchFailed(String),

    #[error("apply patch failed: {0}")]
    ApplyPatchFailed(String),

    #[error("create jws failed: {0}")]
    CreateJwsFailed(String),

    #[error("marshal failed: {0}")]
    MarshalFailed(String),

    #[error("unmarshal failed: {0}")]
    UnMarshalFailed(String),

    #[error("query metadata failed: {0}")]
    QueryMetadataFailed(String),

    #[error("query height failed: {0}")]
    QueryHeightFailed(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("tx {hash} process failed with code {code}")]
    TxProcessFailed { hash: String, code: u32 },

    #[error("store failed: {0}")]
    StoreFailed(String),

    #[error("data missing: {0}")]
    DataMissing(String),

    #[error("order expired: {0}")]
    ExpiredOrder(String),

    #[error("too many retries: {0}")]
    RetriesExceed(String),

    #[error("failure responded: {0}")]
    FailuresResponsed(String),

    #[error("get sid document failed: {0}")]
    GetSidDocumentFailed(String),

    #[error("create client failed: {0}")]
    CreateClientFailed(String),

    #[error("create directory failed: {0}")]
    CreateDirFailed(String),

    #[error("write file failed: {0}")]
    WriteFileFailed(String),
}

impl Error {
    /// Stable wire code for protocol responses. 0 is reserved for success.
    pub fn code(&self) -> u64 {
        match self {
            Error::InvalidParameters(_) => 100,
            Error::InvalidCid(_) => 101,
            Error::InvalidAlias(_) => 102,
            Error::InvalidCommitInfo(_) => 103,
            Error::InvalidTx(_) => 104,
            Error::InvalidShardAssignee(_) => 105,
            Error::InvalidShardCid(_) => 106,
            Error::InvalidProvider(_) => 107,
            Error::CreatePatchFailed(_) => 108,
            Error::ApplyPatchFailed(_) => 109,
            Error::CreateJwsFailed(_) => 110,
            Error::MarshalFailed(_) => 111,
            Error::UnMarshalFailed(_) => 112,
            Error::QueryMetadataFailed(_) => 113,
            Error::QueryHeightFailed(_) => 114,
            Error::AccountNotFound(_) => 115,
            Error::TxProcessFailed { .. } => 116,
            Error::StoreFailed(_) => 117,
            Error::DataMissing(_) => 118,
            Error::ExpiredOrder(_) => 119,
            Error::RetriesExceed(_) => 120,
            Error::FailuresResponsed(_) => 121,
            Error::GetSidDocumentFailed(_) => 122,
            Error::CreateClientFailed(_) => 123,
            Error::CreateDirFailed(_) => 124,
            Error::WriteFileFailed(_) => 125,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_distinct_and_nonzero() {
        let errs = vec![
            Error::InvalidParameters(String::new()),
            Error::InvalidCid(String::new()),
            Error::InvalidTx(String::new()),
            Error::TxProcessFailed { hash: "h".into(), code: 5 },
            Error::RetriesExceed(String::new()),
            Error::ExpiredOrder(String::new()),
            Error::DataMissing(String::new()),
            Error::FailuresResponsed(String::new()),
            Error::WriteFileFailed(String::new()),
        ];
        let mut codes: Vec<u64> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
        assert!(codes.iter().all(|c| *c != 0), "0 is reserved for success");
    }

    #[test]
    fn test_tx_process_failed_carries_coordinates() {
        let e = Error::TxProcessFailed { hash: "ABCD".into(), code: 13 };
        let msg = e.to_string();
        assert!(msg.contains("ABCD"));
        assert!(msg.contains("13"));
    }
}
