//! Data-model manager.
//!
//! An explicitly constructed handle (one per process, passed to whoever
//! needs it) that layers caching, schema validation and the JSON-Patch
//! update flow on top of the gateway coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use sao_common::{cid, config, Error, Result};
use sao_proto::model::Model;
use sao_proto::patch::apply_patch;
use sao_proto::proposal::{
    MetadataProposal, OrderStoreProposal, OrderTerminateProposal, QueryProposal,
};

use crate::gateway::GatewayService;

const PROPERTY_CONTEXT: &str = "@context";

/// Small per-account LRU keyed by data id.
struct LruCache {
    capacity: usize,
    map: HashMap<String, Model>,
    order: VecDeque<String>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        LruCache { capacity: capacity.max(1), map: HashMap::new(), order: VecDeque::new() }
    }

    fn get(&mut self, key: &str) -> Option<Model> {
        if let Some(model) = self.map.get(key) {
            let model = model.clone();
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
            Some(model)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, model: Model) {
        if !self.map.contains_key(&key) && self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.retain(|k| k != &key);
        self.order.push_back(key.clone());
        self.map.insert(key, model);
    }

    fn evict(&mut self, key: &str) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }
}

pub struct ModelManager {
    cfg: config::Cache,
    caches: RwLock<HashMap<String, LruCache>>,
    gateway: Arc<GatewayService>,
}

impl ModelManager {
    pub fn new(cfg: config::Cache, gateway: Arc<GatewayService>) -> Arc<Self> {
        Arc::new(ModelManager { cfg, caches: RwLock::new(HashMap::new()), gateway })
    }

    pub fn gateway(&self) -> &Arc<GatewayService> {
        &self.gateway
    }

    // ── load ────────────────────────────────────────────────────────────

    pub async fn load(&self, req: &MetadataProposal) -> Result<Model> {
        let mut meta = self.gateway.query_meta(req, 0).await?;
        let mut version = format!("v{}", meta.commits.len().saturating_sub(1));

        if !req.proposal.version.is_empty() {
            let index = parse_version(&req.proposal.version)?;
            if meta.commits.len() <= index {
                return Err(Error::InvalidParameters(format!(
                    "invalid version: {}",
                    req.proposal.version
                )));
            }
            let (_, height) = sao_proto::model::parse_commit(&meta.commits[index])?;
            meta = self.gateway.query_meta(req, height).await?;
            version = format!("v{}", index);
        }

        if !req.proposal.commit_id.is_empty() {
            let mut found = false;
            for (i, commit) in meta.commits.clone().iter().enumerate() {
                let (commit_id, height) = sao_proto::model::parse_commit(commit)?;
                if commit_id == req.proposal.commit_id {
                    meta = self.gateway.query_meta(req, height).await?;
                    version = format!("v{}", i);
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(Error::InvalidCommitInfo(format!(
                    "invalid commit id: {}",
                    req.proposal.commit_id
                )));
            }
        }

        if let Some(mut cached) = self.load_cached(&req.proposal.owner, &meta.data_id) {
            if cached.commit_id == meta.commit_id && !cached.content.is_empty() {
                cached.version = version;
                return Ok(cached);
            }
        }

        let mut model = meta.clone();
        let fetched = self.gateway.fetch_content(req, &meta).await?;
        model.cid = fetched.cid;
        model.content = fetched.content;
        model.version = version;

        self.cache_model(&req.proposal.owner, &model);
        Ok(model)
    }

    // ── create ──────────────────────────────────────────────────────────

    pub async fn create(
        &self,
        req: &MetadataProposal,
        client_proposal: &OrderStoreProposal,
        order_id: u64,
        content: Vec<u8>,
    ) -> Result<Model> {
        let mut proposal = client_proposal.proposal.clone();
        if proposal.alias.is_empty() {
            proposal.alias = proposal.cid.clone();
        }

        if let Ok(existing) = self.gateway.query_meta(req, 0).await {
            return Err(Error::InvalidAlias(format!(
                "the model already exists, alias: {}, dataId: {}",
                existing.alias, existing.data_id
            )));
        }

        self.validate_model(&proposal.owner, &proposal.alias, &content, &proposal.rule).await?;

        let result = self.gateway.commit_model(client_proposal, order_id, &content).await?;

        Ok(Model {
            data_id: result.data_id,
            alias: proposal.alias,
            group_id: proposal.group_id,
            order_id: result.order_id,
            owner: proposal.owner,
            tags: proposal.tags,
            cid: result.cid,
            shards: result.shards,
            commit_id: result.commit,
            commits: result.commits,
            content,
            extend_info: proposal.extend_info,
            version: "v0".to_string(),
        })
    }

    // ── update ──────────────────────────────────────────────────────────

    pub async fn update(
        &self,
        req: &MetadataProposal,
        client_proposal: &OrderStoreProposal,
        order_id: u64,
        patch: Vec<u8>,
    ) -> Result<Model> {
        let proposal = &client_proposal.proposal;
        let meta = self.gateway.query_meta(req, 0).await?;

        let origin = match self.load_cached(&proposal.owner, &meta.data_id) {
            Some(cached) if cached.commit_id == meta.commit_id && !cached.content.is_empty() => {
                debug!(data_id = %meta.data_id, "updating from cached model");
                cached.content
            }
            _ => self.gateway.fetch_content(req, &meta).await?.content,
        };

        let new_content = apply_patch(&origin, &patch)?;
        if new_content == origin {
            return Err(Error::InvalidParameters("no content updated".to_string()));
        }
        if new_content.len() as u64 != proposal.size {
            return Err(Error::InvalidParameters(format!(
                "given size({}) doesn't match target content size({})",
                proposal.size,
                new_content.len()
            )));
        }
        let new_cid = cid::calculate_cid(&new_content);
        if new_cid != proposal.cid {
            return Err(Error::InvalidCid(format!(
                "cid mismatch, expected {}, but got {}",
                proposal.cid, new_cid
            )));
        }

        self.validate_model(&proposal.owner, &meta.alias, &new_content, &proposal.rule).await?;

        let result = self.gateway.commit_model(client_proposal, order_id, &new_content).await?;

        let model = Model {
            data_id: meta.data_id,
            alias: meta.alias,
            group_id: proposal.group_id.clone(),
            order_id: result.order_id,
            owner: proposal.owner.clone(),
            tags: proposal.tags.clone(),
            cid: result.cid,
            shards: result.shards,
            commit_id: result.commit,
            commits: result.commits.clone(),
            content: new_content,
            extend_info: proposal.extend_info.clone(),
            version: format!("v{}", result.commits.len().saturating_sub(1)),
        };
        self.cache_model(&proposal.owner, &model);
        Ok(model)
    }

    // ── delete / commits ────────────────────────────────────────────────

    pub async fn delete(&self, req: &OrderTerminateProposal) -> Result<Model> {
        self.gateway.terminate(req).await?;
        let owner = &req.proposal.owner;
        let data_id = &req.proposal.data_id;
        let alias = self
            .load_cached(owner, data_id)
            .map(|m| m.alias)
            .unwrap_or_default();
        if let Some(cache) = self.caches.write().get_mut(owner) {
            cache.evict(data_id);
        }
        Ok(Model { data_id: data_id.clone(), alias, ..Default::default() })
    }

    pub async fn show_commits(&self, req: &MetadataProposal) -> Result<Model> {
        let meta = self.gateway.query_meta(req, 0).await?;
        Ok(Model {
            data_id: meta.data_id,
            alias: meta.alias,
            commits: meta.commits,
            ..Default::default()
        })
    }

    // ── schema validation ───────────────────────────────────────────────

    /// Contents carrying an `@context` are validated against the schema it
    /// names: a data id pointing at a stored schema model, or an inline
    /// schema. Contents without a context pass as-is.
    async fn validate_model(
        &self,
        _account: &str,
        alias: &str,
        content: &[u8],
        rule: &str,
    ) -> Result<()> {
        let value: serde_json::Value = serde_json::from_slice(content)
            .map_err(|e| Error::UnMarshalFailed(format!("model content: {}", e)))?;
        let context = match value.get(PROPERTY_CONTEXT) {
            Some(c) => c.clone(),
            None => return Ok(()),
        };
        if !rule.is_empty() {
            debug!(alias, rule, "validation rule attached");
        }

        let schemas: Vec<serde_json::Value> = match context {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for schema_ref in schemas {
            let schema = self.resolve_schema(schema_ref).await?;
            let compiled = jsonschema::JSONSchema::compile(&schema)
                .map_err(|e| Error::InvalidParameters(format!("invalid schema for {}: {}", alias, e)))?;
            let validation_result = compiled.validate(&value);
            if let Err(errors) = validation_result {
                let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(Error::InvalidParameters(format!(
                    "model {} fails schema validation: {}",
                    alias,
                    detail.join("; ")
                )));
            };
        }
        Ok(())
    }

    async fn resolve_schema(&self, schema_ref: serde_json::Value) -> Result<serde_json::Value> {
        match schema_ref {
            serde_json::Value::Object(_) => Ok(schema_ref),
            serde_json::Value::String(s) if cid::is_data_id(&s) => {
                // schema models are public reads
                let req = MetadataProposal {
                    proposal: QueryProposal {
                        owner: sao_common::did::OWNER_ALL.to_string(),
                        keyword: s,
                        ..Default::default()
                    },
                    jws_signature: Default::default(),
                };
                let meta = self.gateway.query_meta(&req, 0).await?;
                let fetched = self.gateway.fetch_content(&req, &meta).await?;
                serde_json::from_slice(&fetched.content)
                    .map_err(|e| Error::UnMarshalFailed(format!("schema model: {}", e)))
            }
            serde_json::Value::String(s) => serde_json::from_str(&s)
                .map_err(|e| Error::InvalidParameters(format!("invalid schema: {}", e))),
            other => Err(Error::InvalidParameters(format!("invalid schema: {}", other))),
        }
    }

    // ── cache plumbing ──────────────────────────────────────────────────

    fn load_cached(&self, account: &str, data_id: &str) -> Option<Model> {
        if !self.cfg.enable_cache {
            return None;
        }
        let mut caches = self.caches.write();
        caches.get_mut(account).and_then(|c| c.get(data_id))
    }

    fn cache_model(&self, account: &str, model: &Model) {
        if !self.cfg.enable_cache {
            return;
        }
        let mut model = model.clone();
        if model.content.len() > self.cfg.content_limit {
            // oversized contents go through the file channel instead
            model.content = Vec::new();
        }
        let mut caches = self.caches.write();
        let cache = caches
            .entry(account.to_string())
            .or_insert_with(|| LruCache::new(self.cfg.cache_capacity));
        cache.put(model.data_id.clone(), model);
    }
}

fn parse_version(version: &str) -> Result<usize> {
    let digits = version
        .strip_prefix('v')
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| Error::InvalidParameters(format!("invalid version: {}", version)))?;
    digits
        .parse()
        .map_err(|_| Error::InvalidParameters(format!("invalid version: {}", version)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("v0").expect("v0"), 0);
        assert_eq!(parse_version("v12").expect("v12"), 12);
        assert!(parse_version("12").is_err());
        assert!(parse_version("v").is_err());
        assert!(parse_version("v1a").is_err());
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let mut cache = LruCache::new(2);
        cache.put("a".into(), Model { data_id: "a".into(), ..Default::default() });
        cache.put("b".into(), Model { data_id: "b".into(), ..Default::default() });
        // touch a so b becomes the eviction candidate
        assert!(cache.get("a").is_some());
        cache.put("c".into(), Model { data_id: "c".into(), ..Default::default() });
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_lru_evict_explicit() {
        let mut cache = LruCache::new(4);
        cache.put("a".into(), Model::default());
        cache.evict("a");
        assert!(cache.get("a").is_none());
    }
}
