//! Client SDK.
//!
//! Builds signed proposals from a local account, talks to a gateway's
//! HTTP API and optionally publishes orders straight to the chain
//! (`client-publish` mode).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use sao_chain::ChainStore;
use sao_common::did::DidManager;
use sao_common::{cid, keystore, Error, Result};
use sao_proto::model::Model;
use sao_proto::proposal::{
    MetadataProposal, Operation, OrderProposal, OrderRenewProposal, OrderStoreProposal,
    OrderTerminateProposal, Permission, PermissionProposal, QueryProposal, RenewProposal,
    TerminateProposal,
};

/// Validity window (in blocks) stamped on signed queries.
const QUERY_VALIDITY_BLOCKS: u64 = 100;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// gateway HTTP API endpoint
    pub gateway: String,
    /// chain rpc endpoint, used only for client-publish
    pub chain_address: String,
    /// platform group id stamped on proposals
    pub platform: String,
    /// client repo holding the keystore
    pub repo: PathBuf,
    pub key_name: String,
}

pub struct SaoClient {
    http: reqwest::Client,
    cfg: ClientConfig,
    did: DidManager,
    address: String,
}

// mirror of the gateway API envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiEnvelope<T> {
    code: u64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateModelRequest {
    query: MetadataProposal,
    proposal: OrderStoreProposal,
    order_id: u64,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateModelRequest {
    query: MetadataProposal,
    proposal: OrderStoreProposal,
    order_id: u64,
    patch: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RenewModelRequest {
    proposal: OrderRenewProposal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    pub address: String,
    pub peer_address: String,
    pub latest_height: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelStatus {
    pub data_id: String,
    pub order_id: u64,
    pub state: String,
    pub expire_height: u64,
    pub latest_height: i64,
}

/// Knobs for a create or update order.
#[derive(Debug, Clone)]
pub struct OrderOptions {
    pub alias: String,
    pub duration: i32,
    pub replica: i32,
    pub timeout: i32,
    pub tags: Vec<String>,
    pub rule: String,
    pub extend_info: String,
    /// submit MsgStore from the client instead of the gateway
    pub client_publish: bool,
}

impl Default for OrderOptions {
    fn default() -> Self {
        OrderOptions {
            alias: String::new(),
            duration: 365,
            replica: 1,
            timeout: 60,
            tags: Vec::new(),
            rule: String::new(),
            extend_info: String::new(),
            client_publish: false,
        }
    }
}

impl SaoClient {
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        let account = keystore::load(cfg.repo.join("keystore"), &cfg.key_name)?;
        let did = DidManager::from_secret(&account.secret_bytes());
        Ok(SaoClient {
            http: reqwest::Client::new(),
            address: account.address,
            did,
            cfg,
        })
    }

    pub fn did(&self) -> &str {
        self.did.did()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.cfg.gateway.trim_end_matches('/'), path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::CreateClientFailed(format!("{}: {}", url, e)))?;
        decode_envelope(resp).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = format!("{}{}", self.cfg.gateway.trim_end_matches('/'), path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::CreateClientFailed(format!("{}: {}", url, e)))?;
        decode_envelope(resp).await
    }

    pub async fn node_status(&self) -> Result<NodeStatus> {
        self.get("/api/v1/status").await
    }

    // ── proposal builders ───────────────────────────────────────────────

    async fn build_query(
        &self,
        keyword: &str,
        version: &str,
        commit_id: &str,
        public: bool,
    ) -> Result<MetadataProposal> {
        let status = self.node_status().await?;
        let proposal = QueryProposal {
            owner: if public { sao_common::did::OWNER_ALL.to_string() } else { self.did.did().to_string() },
            keyword: keyword.to_string(),
            group_id: self.cfg.platform.clone(),
            keyword_type: 0,
            last_valid_height: status.latest_height as u64 + QUERY_VALIDITY_BLOCKS,
            gateway: status.peer_address,
            commit_id: commit_id.to_string(),
            version: version.to_string(),
        };
        let jws_signature = if public {
            Default::default()
        } else {
            self.did.create_jws(&proposal.signing_bytes()?)?
        };
        Ok(MetadataProposal { proposal, jws_signature })
    }

    async fn build_order(
        &self,
        data_id: &str,
        commit_id: &str,
        content_cid: &str,
        size: u64,
        operation: Operation,
        opts: &OrderOptions,
    ) -> Result<OrderStoreProposal> {
        let status = self.node_status().await?;
        let proposal = OrderProposal {
            owner: self.did.did().to_string(),
            provider: status.address,
            group_id: self.cfg.platform.clone(),
            duration: opts.duration,
            replica: opts.replica,
            timeout: opts.timeout,
            alias: opts.alias.clone(),
            data_id: data_id.to_string(),
            commit_id: commit_id.to_string(),
            tags: opts.tags.clone(),
            cid: content_cid.to_string(),
            rule: opts.rule.clone(),
            extend_info: opts.extend_info.clone(),
            size,
            operation,
        };
        proposal.validate()?;
        let jws_signature = self.did.create_jws(&proposal.signing_bytes()?)?;
        Ok(OrderStoreProposal { proposal, jws_signature })
    }

    async fn publish_if_requested(&self, proposal: &OrderStoreProposal, opts: &OrderOptions) -> Result<u64> {
        if !opts.client_publish {
            return Ok(0);
        }
        let chain = sao_chain::build(&self.cfg.chain_address);
        let (order_id, hash) = chain.store_order(&self.address, proposal).await?;
        tracing::info!(order_id, tx = %hash, "client published MsgStore");
        Ok(order_id)
    }

    // ── model operations ────────────────────────────────────────────────

    pub async fn create_model(&self, content: &[u8], opts: &OrderOptions) -> Result<Model> {
        let data_id = cid::new_data_id();
        let commit_id = cid::new_data_id();
        let content_cid = cid::calculate_cid(content);
        let proposal = self
            .build_order(&data_id, &commit_id, &content_cid, content.len() as u64, Operation::Create, opts)
            .await?;
        let query = self.build_query(&data_id, "", "", false).await?;
        let order_id = self.publish_if_requested(&proposal, opts).await?;
        self.post(
            "/api/v1/model/create",
            &CreateModelRequest { query, proposal, order_id, content: BASE64.encode(content) },
        )
        .await
    }

    pub async fn load_model(&self, keyword: &str, version: &str, commit_id: &str, public: bool) -> Result<Model> {
        let query = self.build_query(keyword, version, commit_id, public).await?;
        self.post("/api/v1/model/load", &query).await
    }

    /// Update via JSON-Patch. The target cid and size are computed from
    /// the current content plus the patch, so the caller only supplies
    /// the patch document.
    pub async fn update_model(&self, keyword: &str, patch: &[u8], opts: &OrderOptions) -> Result<Model> {
        let current = self.load_model(keyword, "", "", false).await?;
        let target = sao_proto::patch::apply_patch(&current.content, patch)?;
        let commit_id = cid::new_data_id();
        let mut opts = opts.clone();
        if opts.alias.is_empty() {
            opts.alias = current.alias.clone();
        }
        let proposal = self
            .build_order(
                &current.data_id,
                &commit_id,
                &cid::calculate_cid(&target),
                target.len() as u64,
                Operation::ForceUpdate,
                &opts,
            )
            .await?;
        let query = self.build_query(&current.data_id, "", "", false).await?;
        let order_id = self.publish_if_requested(&proposal, &opts).await?;
        self.post(
            "/api/v1/model/update",
            &UpdateModelRequest { query, proposal, order_id, patch: BASE64.encode(patch) },
        )
        .await
    }

    pub async fn delete_model(&self, data_id: &str) -> Result<Model> {
        let proposal = TerminateProposal { owner: self.did.did().to_string(), data_id: data_id.to_string() };
        let jws_signature = self.did.create_jws(&proposal.signing_bytes()?)?;
        self.post("/api/v1/model/delete", &OrderTerminateProposal { proposal, jws_signature }).await
    }

    pub async fn show_commits(&self, keyword: &str) -> Result<Model> {
        let query = self.build_query(keyword, "", "", false).await?;
        self.post("/api/v1/model/commits", &query).await
    }

    pub async fn renew_models(
        &self,
        data_ids: Vec<String>,
        duration: i32,
        timeout: i32,
    ) -> Result<HashMap<String, String>> {
        let proposal = RenewProposal { owner: self.did.did().to_string(), duration, timeout, data_ids };
        let jws_signature = self.did.create_jws(&proposal.signing_bytes()?)?;
        self.post(
            "/api/v1/model/renew",
            &RenewModelRequest { proposal: OrderRenewProposal { proposal, jws_signature } },
        )
        .await
    }

    pub async fn update_permission(
        &self,
        data_id: &str,
        readonly_dids: Vec<String>,
        readwrite_dids: Vec<String>,
    ) -> Result<String> {
        let proposal = Permission {
            owner: self.did.did().to_string(),
            data_id: data_id.to_string(),
            readonly_dids,
            readwrite_dids,
        };
        let jws_signature = self.did.create_jws(&proposal.signing_bytes()?)?;
        self.post("/api/v1/model/update-permission", &PermissionProposal { proposal, jws_signature })
            .await
    }

    pub async fn model_status(&self, data_id: &str) -> Result<ModelStatus> {
        self.get(&format!("/api/v1/model/{}/status", data_id)).await
    }

    pub async fn model_meta(&self, data_id: &str) -> Result<sao_chain::Metadata> {
        self.get(&format!("/api/v1/model/{}/meta", data_id)).await
    }

    pub async fn order_info(&self, order_id: u64) -> Result<sao_chain::Order> {
        self.get(&format!("/api/v1/order/{}", order_id)).await
    }
}

async fn decode_envelope<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R> {
    let envelope: ApiEnvelope<R> = resp
        .json()
        .await
        .map_err(|e| Error::UnMarshalFailed(format!("api response: {}", e)))?;
    if envelope.code != 0 {
        return Err(Error::FailuresResponsed(format!(
            "gateway refused (code {}): {}",
            envelope.code, envelope.message
        )));
    }
    envelope
        .data
        .ok_or_else(|| Error::UnMarshalFailed("api response missing data".to_string()))
}

/// Resolve the client repo path (`~/.sao-cli` by default).
pub fn default_repo(flag: Option<&str>) -> PathBuf {
    let raw = flag.map(str::to_string).unwrap_or_else(|| "~/.sao-cli".to_string());
    if let Some(rest) = raw.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sao_common::keystore;
    use tempfile::TempDir;

    #[test]
    fn test_client_loads_account() {
        let tmp = TempDir::new().expect("tmpdir");
        let keystore_dir = tmp.path().join("keystore");
        let account = keystore::create(&keystore_dir, "alice").expect("create");

        let client = SaoClient::new(ClientConfig {
            gateway: "http://127.0.0.1:5151".into(),
            chain_address: "mock".into(),
            platform: "app".into(),
            repo: tmp.path().to_path_buf(),
            key_name: "alice".into(),
        })
        .expect("client");
        assert_eq!(client.address(), account.address);
        assert!(client.did().starts_with("did:sao:"));
    }

    #[test]
    fn test_missing_account_is_error() {
        let tmp = TempDir::new().expect("tmpdir");
        let result = SaoClient::new(ClientConfig {
            gateway: String::new(),
            chain_address: String::new(),
            platform: String::new(),
            repo: tmp.path().to_path_buf(),
            key_name: "ghost".into(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_default_repo_expands_home() {
        std::env::set_var("HOME", "/home/sao");
        assert_eq!(default_repo(None), PathBuf::from("/home/sao/.sao-cli"));
        assert_eq!(default_repo(Some("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
