//! Commit staging area.
//!
//! `commit_model` parks content at `<base>/<owner>/<cid>` until the order
//! is acknowledged on chain, then unstages it. Each `(owner, cid)` path is
//! owned by exactly one outstanding commit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use sao_common::{Error, Result};

#[derive(Debug, Clone)]
pub struct StagingArea {
    base: PathBuf,
}

impl StagingArea {
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        Ok(StagingArea { base })
    }

    fn shard_path(&self, owner: &str, cid: &str) -> PathBuf {
        self.base.join(owner).join(cid)
    }

    pub fn stage(&self, owner: &str, cid: &str, content: &[u8]) -> Result<()> {
        let dir = self.base.join(owner);
        fs::create_dir_all(&dir).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        let path = dir.join(cid);
        debug!(owner, cid, "staging shard");
        fs::write(&path, content).map_err(|e| Error::WriteFileFailed(e.to_string()))
    }

    pub fn get_staged(&self, owner: &str, cid: &str) -> Result<Vec<u8>> {
        fs::read(self.shard_path(owner, cid))
            .map_err(|e| Error::DataMissing(format!("staged shard {}/{}: {}", owner, cid, e)))
    }

    pub fn is_staged(&self, owner: &str, cid: &str) -> bool {
        self.shard_path(owner, cid).exists()
    }

    /// Remove the staged content. Removing something already gone is fine;
    /// unstage runs unconditionally after a commit settles.
    pub fn unstage(&self, owner: &str, cid: &str) -> Result<()> {
        let path = self.shard_path(owner, cid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::WriteFileFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_get_unstage() {
        let tmp = TempDir::new().expect("tmpdir");
        let staging = StagingArea::new(tmp.path()).expect("staging");

        staging.stage("owner1", "cid1", b"hello").expect("stage");
        assert!(staging.is_staged("owner1", "cid1"));
        assert_eq!(staging.get_staged("owner1", "cid1").expect("get"), b"hello");

        staging.unstage("owner1", "cid1").expect("unstage");
        assert!(!staging.is_staged("owner1", "cid1"));
        assert!(staging.get_staged("owner1", "cid1").is_err());
    }

    #[test]
    fn test_unstage_missing_is_ok() {
        let tmp = TempDir::new().expect("tmpdir");
        let staging = StagingArea::new(tmp.path()).expect("staging");
        staging.unstage("nobody", "nothing").expect("idempotent unstage");
    }

    #[test]
    fn test_owners_are_isolated() {
        let tmp = TempDir::new().expect("tmpdir");
        let staging = StagingArea::new(tmp.path()).expect("staging");
        staging.stage("a", "cid", b"from-a").expect("stage a");
        staging.stage("b", "cid", b"from-b").expect("stage b");
        assert_eq!(staging.get_staged("a", "cid").expect("a"), b"from-a");
        assert_eq!(staging.get_staged("b", "cid").expect("b"), b"from-b");
    }
}
