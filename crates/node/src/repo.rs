//! On-disk repo layout.
//!
//! ```text
//! <repo>/config.toml          node configuration
//! <repo>/keystore/libp2p.key  ed25519 peer identity, 0600
//! <repo>/keystore/<name>      chain accounts
//! <repo>/datastore/           durable index (lmdb)
//! <repo>/staging/<owner>/<cid> pending commit content
//! <repo>/store/               content-addressed shard store
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::info;

use sao_common::config;
use sao_common::{Error, Result};

use crate::index::Datastore;

pub const ENV_REPO_PATH: &str = "SAO_NODE_PATH";
pub const DEFAULT_REPO_PATH: &str = "~/.sao-storage-node";

const FS_CONFIG: &str = "config.toml";
const FS_KEYSTORE: &str = "keystore";
const FS_LIBP2P_KEY: &str = "libp2p.key";
const FS_DATASTORE: &str = "datastore";
const FS_STAGING: &str = "staging";
const FS_STORE: &str = "store";

const KEY_NODE_ADDRESS: &str = "node-address";

/// Expand a leading `~` using `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Resolve the repo path: explicit flag, then `SAO_NODE_PATH`, then the
/// default location.
pub fn resolve_path(flag: Option<&str>) -> PathBuf {
    let raw = flag
        .map(str::to_string)
        .or_else(|| env::var(ENV_REPO_PATH).ok())
        .unwrap_or_else(|| DEFAULT_REPO_PATH.to_string());
    expand_home(&raw)
}

pub struct Repo {
    path: PathBuf,
}

impl Repo {
    pub fn new(path: impl AsRef<Path>) -> Repo {
        Repo { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(FS_CONFIG)
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.path.join(FS_KEYSTORE)
    }

    pub fn datastore_path(&self) -> PathBuf {
        self.path.join(FS_DATASTORE)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.path.join(FS_STAGING)
    }

    pub fn store_path(&self) -> PathBuf {
        self.path.join(FS_STORE)
    }

    pub fn exists(&self) -> bool {
        self.keystore_path().exists()
    }

    /// Initialize a fresh repo. Refuses when one already exists.
    pub fn init(&self, creator: &str, chain_address: &str, multiaddr: &str) -> Result<()> {
        if self.exists() {
            return Err(Error::InvalidParameters(format!(
                "repo {} already exists",
                self.path.display()
            )));
        }
        info!(path = %self.path.display(), "initializing repo");
        fs::create_dir_all(&self.path).map_err(|e| Error::CreateDirFailed(e.to_string()))?;

        let mut cfg = config::Node::default();
        cfg.chain.remote = chain_address.to_string();
        cfg.transport.listen_address = multiaddr.to_string();
        fs::write(self.config_path(), config::to_toml(&cfg)?)
            .map_err(|e| Error::WriteFileFailed(e.to_string()))?;

        let keystore = self.keystore_path();
        fs::create_dir_all(&keystore).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&keystore, fs::Permissions::from_mode(0o700))
                .map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        }
        self.generate_peer_key()?;

        let ds = self.datastore()?;
        ds.put(KEY_NODE_ADDRESS, creator.as_bytes())?;
        fs::create_dir_all(self.staging_path()).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        fs::create_dir_all(self.store_path()).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        Ok(())
    }

    /// Open an existing repo; a missing keystore is a startup-fatal error.
    pub fn open(&self) -> Result<()> {
        if !self.exists() {
            return Err(Error::InvalidParameters(format!(
                "repo {} not initialized, run `snode init` first",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn config(&self) -> Result<config::Node> {
        config::load_from_file(self.config_path())
    }

    pub fn datastore(&self) -> Result<Datastore> {
        Datastore::open(self.datastore_path())
    }

    pub fn node_address(&self) -> Result<String> {
        let ds = self.datastore()?;
        let bytes = ds
            .get(KEY_NODE_ADDRESS)?
            .ok_or_else(|| Error::AccountNotFound("node address not set, re-run init".to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub fn set_node_address(&self, address: &str) -> Result<()> {
        self.datastore()?.put(KEY_NODE_ADDRESS, address.as_bytes())
    }

    /// Clear the node address binding; `snode quit` uses this.
    pub fn clear_node_address(&self) -> Result<()> {
        self.datastore()?.delete(KEY_NODE_ADDRESS)
    }

    fn generate_peer_key(&self) -> Result<SigningKey> {
        let key = SigningKey::generate(&mut OsRng);
        let path = self.keystore_path().join(FS_LIBP2P_KEY);
        fs::write(&path, hex::encode(key.to_bytes()))
            .map_err(|e| Error::WriteFileFailed(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::WriteFileFailed(e.to_string()))?;
        }
        Ok(key)
    }

    /// The node's peer identity key. A missing or corrupt key file is a
    /// startup-fatal condition.
    pub fn peer_key(&self) -> Result<SigningKey> {
        let path = self.keystore_path().join(FS_LIBP2P_KEY);
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::AccountNotFound(format!("{}: {}", path.display(), e)))?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| Error::UnMarshalFailed(format!("peer key: {}", e)))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::UnMarshalFailed("peer key must be 32 bytes".to_string()))?;
        Ok(SigningKey::from_bytes(&secret))
    }

    /// Wipe mutable node state (datastore + staging), keep keys and config.
    pub fn reset(&self) -> Result<()> {
        for dir in [self.datastore_path(), self.staging_path()] {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| Error::WriteFileFailed(e.to_string()))?;
            }
            fs::create_dir_all(&dir).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_open_roundtrip() {
        let tmp = TempDir::new().expect("tmpdir");
        let repo = Repo::new(tmp.path().join("repo"));
        assert!(repo.open().is_err(), "open before init must fail");

        repo.init("sao1creator", "mock", "/ip4/127.0.0.1/tcp/5153").expect("init");
        repo.open().expect("open");
        assert_eq!(repo.node_address().expect("address"), "sao1creator");
        assert_eq!(repo.config().expect("config").chain.remote, "mock");

        let key1 = repo.peer_key().expect("peer key");
        let key2 = repo.peer_key().expect("peer key again");
        assert_eq!(key1.to_bytes(), key2.to_bytes());
    }

    #[test]
    fn test_init_refuses_existing_repo() {
        let tmp = TempDir::new().expect("tmpdir");
        let repo = Repo::new(tmp.path().join("repo"));
        repo.init("sao1creator", "mock", "/ip4/127.0.0.1/tcp/5153").expect("init");
        let err = repo.init("sao1other", "mock", "/ip4/127.0.0.1/tcp/5153").expect_err("re-init");
        assert!(err.to_string().contains("exists"));
    }

    #[test]
    fn test_reset_clears_state_keeps_identity() {
        let tmp = TempDir::new().expect("tmpdir");
        let repo = Repo::new(tmp.path().join("repo"));
        repo.init("sao1creator", "mock", "/ip4/127.0.0.1/tcp/5153").expect("init");
        let key = repo.peer_key().expect("key").to_bytes();

        repo.reset().expect("reset");
        assert!(repo.node_address().is_err(), "datastore wiped");
        assert_eq!(repo.peer_key().expect("key survives").to_bytes(), key);
        assert!(repo.config().is_ok(), "config survives");
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/sao");
        assert_eq!(expand_home("~/.sao-storage-node"), PathBuf::from("/home/sao/.sao-storage-node"));
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
}
