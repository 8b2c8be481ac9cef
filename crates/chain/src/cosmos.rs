//! HTTP chain backend.
//!
//! Talks JSON to a chain daemon's REST facade. Broadcasts post a typed
//! message envelope and surface `(hash, code)` failures as
//! `TxProcessFailed`; queries hit `/sao/...` paths and wrap non-zero
//! codes into the typed taxonomy. The order-complete subscription polls
//! order status once per block interval, which keeps semantics identical
//! to the mock backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sao_common::did::SidDocument;
use sao_common::{Error, Result};
use sao_proto::proposal::{
    MetadataProposal, OrderRenewProposal, OrderStoreProposal, OrderTerminateProposal,
    PermissionProposal,
};

use crate::messages::{AccountInfo, Metadata, Order, OrderCompleteResult, OrderStatus, TxInfo};
use crate::{ChainStore, BLOCKTIME};

pub struct CosmosChain {
    remote: String,
    http: reqwest::Client,
    pollers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

#[derive(Debug, Serialize)]
struct TxEnvelope<'a, T: Serialize> {
    signer: &'a str,
    #[serde(rename = "type")]
    msg_type: &'a str,
    body: T,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    hash: String,
    code: u32,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    order_id: u64,
    #[serde(default)]
    result: HashMap<String, String>,
}

impl CosmosChain {
    pub fn new(remote: &str) -> Self {
        CosmosChain {
            remote: remote.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    async fn broadcast<T: Serialize>(&self, signer: &str, msg_type: &str, body: T) -> Result<TxResponse> {
        let url = format!("{}/sao/tx", self.remote);
        let resp = self
            .http
            .post(&url)
            .json(&TxEnvelope { signer, msg_type, body })
            .send()
            .await
            .map_err(|e| Error::CreateClientFailed(format!("{}: {}", url, e)))?;
        let tx: TxResponse = resp
            .json()
            .await
            .map_err(|e| Error::UnMarshalFailed(format!("tx response: {}", e)))?;
        if tx.code != 0 {
            return Err(Error::TxProcessFailed { hash: tx.hash, code: tx.code });
        }
        debug!(msg_type, hash = %tx.hash, height = tx.height, "broadcast ok");
        Ok(tx)
    }

    async fn query<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.remote, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::CreateClientFailed(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::QueryMetadataFailed(format!("{}: http {}", url, resp.status())));
        }
        resp.json().await.map_err(|e| Error::UnMarshalFailed(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl ChainStore for CosmosChain {
    async fn store_order(&self, signer: &str, proposal: &OrderStoreProposal) -> Result<(u64, String)> {
        proposal.proposal.validate()?;
        let tx = self.broadcast(signer, "MsgStore", proposal).await?;
        Ok((tx.order_id, tx.hash))
    }

    async fn order_ready(&self, signer: &str, order_id: u64) -> Result<String> {
        let tx = self
            .broadcast(signer, "MsgReady", serde_json::json!({ "OrderId": order_id }))
            .await?;
        Ok(tx.hash)
    }

    async fn complete_order(&self, signer: &str, order_id: u64, cid: &str, size: u64) -> Result<(String, i64)> {
        let tx = self
            .broadcast(
                signer,
                "MsgComplete",
                serde_json::json!({ "OrderId": order_id, "Cid": cid, "Size": size }),
            )
            .await?;
        Ok((tx.hash, tx.height))
    }

    async fn renew_order(
        &self,
        signer: &str,
        proposal: &OrderRenewProposal,
    ) -> Result<(String, HashMap<String, String>)> {
        let tx = self.broadcast(signer, "MsgRenew", proposal).await?;
        Ok((tx.hash, tx.result))
    }

    async fn migrate_order(
        &self,
        signer: &str,
        data_ids: Vec<String>,
    ) -> Result<(String, HashMap<String, String>, i64)> {
        let tx = self
            .broadcast(signer, "MsgMigrate", serde_json::json!({ "DataIds": data_ids }))
            .await?;
        Ok((tx.hash, tx.result, tx.height))
    }

    async fn terminate_order(&self, signer: &str, proposal: &OrderTerminateProposal) -> Result<String> {
        let tx = self.broadcast(signer, "MsgTerminate", proposal).await?;
        Ok(tx.hash)
    }

    async fn update_permission(&self, signer: &str, proposal: &PermissionProposal) -> Result<String> {
        let tx = self.broadcast(signer, "MsgUpdatePermission", proposal).await?;
        Ok(tx.hash)
    }

    async fn update_did_binding(&self, signer: &str, did: &str, account_id: &str) -> Result<String> {
        let tx = self
            .broadcast(
                signer,
                "MsgUpdateDidBinding",
                serde_json::json!({ "Did": did, "AccountId": account_id }),
            )
            .await?;
        Ok(tx.hash)
    }

    async fn query_metadata(&self, proposal: &MetadataProposal, height: i64) -> Result<Metadata> {
        let url = format!("{}/sao/metadata?height={}", self.remote, height);
        let resp = self
            .http
            .post(&url)
            .json(proposal)
            .send()
            .await
            .map_err(|e| Error::CreateClientFailed(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::QueryMetadataFailed(format!(
                "{}: http {}",
                proposal.proposal.keyword,
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| Error::UnMarshalFailed(format!("metadata: {}", e)))
    }

    async fn query_data_id(&self, key: &str) -> Result<String> {
        self.query(&format!("/sao/data-id/{}", key)).await
    }

    async fn get_order(&self, order_id: u64) -> Result<Order> {
        self.query(&format!("/sao/order/{}", order_id)).await
    }

    async fn get_meta(&self, data_id: &str) -> Result<Metadata> {
        self.query(&format!("/sao/model/{}", data_id)).await
    }

    async fn get_sid_document(&self, version_id: &str) -> Result<SidDocument> {
        self.query::<SidDocument>(&format!("/sao/did/{}", version_id))
            .await
            .map_err(|e| Error::GetSidDocumentFailed(e.to_string()))
    }

    async fn get_node_peer(&self, address: &str) -> Result<String> {
        self.query(&format!("/sao/node/{}/peer", address)).await
    }

    async fn get_account(&self, address: &str) -> Result<AccountInfo> {
        self.query::<AccountInfo>(&format!("/sao/account/{}", address))
            .await
            .map_err(|e| Error::AccountNotFound(e.to_string()))
    }

    async fn get_tx(&self, hash: &str, height: i64) -> Result<TxInfo> {
        self.query(&format!("/sao/tx/{}?height={}", hash, height)).await
    }

    async fn get_last_height(&self) -> Result<i64> {
        self.query::<i64>("/sao/height")
            .await
            .map_err(|e| Error::QueryHeightFailed(e.to_string()))
    }

    async fn subscribe_order_complete(&self, order_id: u64) -> Result<mpsc::Receiver<OrderCompleteResult>> {
        let (tx, rx) = mpsc::channel(4);
        let remote = self.remote.clone();
        let http = self.http.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(BLOCKTIME).await;
                let url = format!("{}/sao/order/{}", remote, order_id);
                let order: Order = match http.get(&url).send().await {
                    Ok(resp) => match resp.json().await {
                        Ok(o) => o,
                        Err(e) => {
                            warn!(order_id, "order poll decode failed: {}", e);
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!(order_id, "order poll failed: {}", e);
                        continue;
                    }
                };
                if order.status == OrderStatus::Completed {
                    let _ = tx
                        .send(OrderCompleteResult {
                            order_id,
                            data_id: order.data_id,
                            result: format!("SUCCESS={}", order_id),
                        })
                        .await;
                    return;
                }
            }
        });
        self.pollers.lock().insert(order_id, handle);
        Ok(rx)
    }

    async fn unsubscribe_order_complete(&self, order_id: u64) -> Result<()> {
        if let Some(handle) = self.pollers.lock().remove(&order_id) {
            handle.abort();
        }
        Ok(())
    }
}
