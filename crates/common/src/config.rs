//! Node configuration loaded from `<repo>/config.toml`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub chain: Chain,
    pub transport: Transport,
    pub api: Api,
    pub cache: Cache,
    pub http_file_server: HttpFileServer,
    pub ipfs: Ipfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Chain {
    /// Chain RPC endpoint. The value "mock" selects the in-memory chain
    /// backend, useful for local development.
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Transport {
    /// Multiaddr this node publishes for peer streams.
    pub listen_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Api {
    pub enable: bool,
    /// host:port the gateway HTTP API binds to.
    pub listen_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub enable_cache: bool,
    pub cache_capacity: usize,
    /// Contents larger than this are never inlined in responses.
    pub content_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFileServer {
    pub enable: bool,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipfs {
    pub enable: bool,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            chain: Chain::default(),
            transport: Transport::default(),
            api: Api::default(),
            cache: Cache::default(),
            http_file_server: HttpFileServer::default(),
            ipfs: Ipfs::default(),
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Chain { remote: "http://localhost:26657".to_string() }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport { listen_address: "/ip4/127.0.0.1/tcp/5153".to_string() }
    }
}

impl Default for Api {
    fn default() -> Self {
        Api { enable: true, listen_address: "127.0.0.1:5151".to_string() }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            enable_cache: true,
            cache_capacity: 1000,
            content_limit: 2 * 1024 * 1024,
        }
    }
}

impl Default for HttpFileServer {
    fn default() -> Self {
        HttpFileServer { enable: false, path: "http-files".to_string() }
    }
}

impl Default for Ipfs {
    fn default() -> Self {
        Ipfs { enable: false }
    }
}

/// Load config from a TOML file. A malformed file is a fatal condition for
/// the caller, reported as `InvalidParameters`.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Node> {
    let s = fs::read_to_string(path.as_ref())
        .map_err(|e| Error::InvalidParameters(format!("read config: {}", e)))?;
    toml::from_str(&s).map_err(|e| Error::InvalidParameters(format!("parse config: {}", e)))
}

/// Serialize a config for writing the initial `config.toml`.
pub fn to_toml(cfg: &Node) -> Result<String> {
    toml::to_string_pretty(cfg).map_err(|e| Error::MarshalFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_roundtrip() {
        let def = Node::default();
        let s = to_toml(&def).expect("serialize");
        let back: Node = toml::from_str(&s).expect("parse");
        assert_eq!(back.chain.remote, def.chain.remote);
        assert_eq!(back.cache.content_limit, def.cache.content_limit);
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            tmp,
            r#"
            [chain]
            remote = "http://chain:26657"
            [cache]
            content_limit = 42
            "#
        )
        .expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.chain.remote, "http://chain:26657");
        assert_eq!(cfg.cache.content_limit, 42);
        // untouched sections fall back to defaults
        assert!(cfg.api.enable);
    }

    #[test]
    fn test_malformed_config_is_error() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        write!(tmp, "chain = !!!").expect("write");
        assert!(load_from_file(tmp.path()).is_err());
    }
}
