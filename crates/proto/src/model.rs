//! Data-model views handed back to clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use sao_common::{Error, Result};

/// Aliases with this prefix denote file models, which are always mirrored
/// to the file server instead of being inlined.
pub const TYPE_FILE_PREFIX: &str = "File";

/// Separator between commit id and height inside a commits entry.
pub const COMMIT_SEP: char = '\u{1a}';

/// One shard of a model as the chain reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardMeta {
    pub shard_id: u64,
    pub peer: String,
    pub cid: String,
    pub provider: String,
}

/// A versioned, owner-scoped content blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Model {
    pub data_id: String,
    pub alias: String,
    pub group_id: String,
    pub order_id: u64,
    pub owner: String,
    pub tags: Vec<String>,
    pub cid: String,
    pub shards: HashMap<String, ShardMeta>,
    pub commit_id: String,
    pub commits: Vec<String>,
    #[serde(default)]
    pub content: Vec<u8>,
    pub extend_info: String,
    pub version: String,
}

/// Build a commits entry.
pub fn format_commit(commit_id: &str, height: i64) -> String {
    format!("{}{}{}", commit_id, COMMIT_SEP, height)
}

/// Split a commits entry into `(commit_id, height)`.
pub fn parse_commit(entry: &str) -> Result<(String, i64)> {
    let mut parts = entry.splitn(2, COMMIT_SEP);
    let commit_id = parts.next().unwrap_or_default();
    let height = parts
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidCommitInfo(entry.to_string()))?;
    let height: i64 = height
        .parse()
        .map_err(|_| Error::InvalidCommitInfo(entry.to_string()))?;
    if commit_id.is_empty() {
        return Err(Error::InvalidCommitInfo(entry.to_string()));
    }
    Ok((commit_id.to_string(), height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_roundtrip() {
        let entry = format_commit("commit-1", 42);
        let (id, height) = parse_commit(&entry).expect("parse");
        assert_eq!(id, "commit-1");
        assert_eq!(height, 42);
    }

    #[test]
    fn test_commit_rejects_malformed() {
        assert!(parse_commit("no-separator").is_err());
        assert!(parse_commit(&format!("id{}", COMMIT_SEP)).is_err());
        assert!(parse_commit(&format!("id{}notanumber", COMMIT_SEP)).is_err());
        assert!(parse_commit(&format!("{}42", COMMIT_SEP)).is_err());
    }

    #[test]
    fn test_model_marshal_identity() {
        let mut model = Model {
            data_id: "d".into(),
            alias: "a".into(),
            commits: vec![format_commit("c0", 10)],
            content: b"body".to_vec(),
            ..Default::default()
        };
        model.shards.insert(
            "sao1prov".into(),
            ShardMeta { shard_id: 0, peer: "/ip4/127.0.0.1/tcp/5153".into(), cid: "x".into(), provider: "sao1prov".into() },
        );
        let bytes = serde_json::to_vec(&model).expect("ser");
        let back: Model = serde_json::from_slice(&bytes).expect("de");
        assert_eq!(back.data_id, model.data_id);
        assert_eq!(back.shards.len(), 1);
        assert_eq!(back.content, model.content);
    }
}
