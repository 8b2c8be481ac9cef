//! Local filesystem backend.
//!
//! Objects live under `<base>/shards/<first2>/<cid>`. Writes go to a temp
//! file first and are renamed into place, so readers never observe a
//! partial object.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sao_common::{Error, Result};

#[derive(Debug)]
pub struct LocalShardStore {
    shards_dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl LocalShardStore {
    /// Create a store rooted at `base`, creating `<base>/shards` if missing.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let shards_dir = base.as_ref().join("shards");
        fs::create_dir_all(&shards_dir).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        Ok(LocalShardStore { shards_dir, tmp_seq: AtomicU64::new(0) })
    }

    fn object_path(&self, cid: &str) -> Result<PathBuf> {
        if cid.len() < 2 {
            return Err(Error::InvalidCid(cid.to_string()));
        }
        Ok(self.shards_dir.join(&cid[0..2]).join(cid))
    }

    fn atomic_write(&self, dest: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        }
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = dest.with_extension(format!("tmp.{}", seq));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| Error::WriteFileFailed(e.to_string()))?;
            f.write_all(data).map_err(|e| Error::WriteFileFailed(e.to_string()))?;
            f.sync_all().map_err(|e| Error::WriteFileFailed(e.to_string()))?;
        }
        fs::rename(&tmp, dest).map_err(|e| Error::WriteFileFailed(e.to_string()))?;
        Ok(())
    }
}

impl crate::store::ShardStore for LocalShardStore {
    fn store(&self, cid: &str, data: &[u8]) -> Result<u64> {
        let path = self.object_path(cid)?;
        if path.exists() {
            return Ok(0);
        }
        self.atomic_write(&path, data)?;
        Ok(data.len() as u64)
    }

    fn get(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(cid)?;
        if !path.exists() {
            return Ok(None);
        }
        let mut f = File::open(&path).map_err(|e| Error::StoreFailed(e.to_string()))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(|e| Error::StoreFailed(e.to_string()))?;
        Ok(Some(buf))
    }

    fn is_exist(&self, cid: &str) -> bool {
        self.object_path(cid).map(|p| p.exists()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ShardStore;
    use sao_common::cid::calculate_cid;
    use tempfile::TempDir;

    #[test]
    fn test_store_get_exist() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = LocalShardStore::new(tmp.path()).expect("new store");

        let data = b"shard bytes";
        let cid = calculate_cid(data);

        assert!(!store.is_exist(&cid));
        assert_eq!(store.store(&cid, data).expect("store"), data.len() as u64);
        assert!(store.is_exist(&cid));
        let got = store.get(&cid).expect("get").expect("exists");
        assert_eq!(got.as_slice(), data);
        assert!(store.get("ffffffffffff").expect("get missing").is_none());
    }

    #[test]
    fn test_store_idempotent() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = LocalShardStore::new(tmp.path()).expect("new store");
        let cid = calculate_cid(b"v1");

        store.store(&cid, b"v1").expect("first");
        // same cid again is a no-op, the existing copy wins
        assert_eq!(store.store(&cid, b"v2").expect("second"), 0);
        assert_eq!(store.get(&cid).expect("get").expect("exists"), b"v1");
    }

    #[test]
    fn test_short_cid_rejected() {
        let tmp = TempDir::new().expect("tmpdir");
        let store = LocalShardStore::new(tmp.path()).expect("new store");
        assert!(store.store("x", b"data").is_err());
        assert!(!store.is_exist("x"));
    }
}
