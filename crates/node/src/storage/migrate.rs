//! Shard migration engine, initiator side.
//!
//! `initiate` submits `MsgMigrate` and, for every data id the chain
//! granted, records a `MigrateInfo{TxSent}` and queues a transfer. The
//! migrate worker ships the bytes to the destination provider, verifies
//! the destination's completion tx and the resulting chain shard entry,
//! then marks the record `Complete`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use sao_chain::{ChainStore, ShardStatus};
use sao_common::{Error, Result};
use sao_proto::shard::ShardMigrateReq;
use sao_store::ShardStore;

use crate::index;
use crate::state::{MigrateInfo, MigrateState};
use crate::transport::StorageProtocol;

use super::StorageService;

/// One queued shard transfer.
#[derive(Debug, Clone)]
pub struct MigrateRequest {
    pub from_provider: String,
    pub order_id: u64,
    pub data_id: String,
    pub cid: String,
    pub to_provider: String,
    pub migrate_tx_hash: String,
    pub migrate_height: i64,
}

pub(super) fn spawn_migrate_worker(
    svc: Arc<StorageService>,
    mut migrate_rx: mpsc::UnboundedReceiver<MigrateRequest>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("migrate worker started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("migrate worker draining");
                    migrate_rx.close();
                }
                req = migrate_rx.recv() => {
                    let req = match req {
                        Some(r) => r,
                        None => break,
                    };
                    if let Err(e) = process_migrate(&svc, req).await {
                        error!("migrate processing failed: {}", e);
                    }
                }
            }
        }
        info!("migrate worker stopped");
    })
}

pub(super) async fn initiate(
    svc: &StorageService,
    data_ids: Vec<String>,
) -> Result<(String, HashMap<String, String>)> {
    let (hash, results, height) = svc.chain.migrate_order(&svc.node_address, data_ids).await?;

    for (data_id, result) in &results {
        if !result.starts_with("SUCCESS") {
            continue;
        }
        let meta = match svc.chain.get_meta(data_id).await {
            Ok(m) => m,
            Err(e) => {
                error!(data_id = %data_id, "migrate granted but meta lookup failed: {}", e);
                continue;
            }
        };
        let order = match svc.chain.get_order(meta.order_id).await {
            Ok(o) => o,
            Err(e) => {
                error!(order_id = meta.order_id, "migrate granted but order lookup failed: {}", e);
                continue;
            }
        };
        let cid = match order.shards.get(&svc.node_address) {
            Some(s) => s.cid.clone(),
            None => {
                warn!(data_id = %data_id, "no local shard entry for migrating provider");
                continue;
            }
        };

        // the chain added a Waiting entry naming us as the source
        let destination = order.shards.iter().find(|(node, shard)| {
            shard.cid == cid
                && node.as_str() != svc.node_address
                && shard.status == ShardStatus::Waiting
                && shard.from == svc.node_address
        });
        let (to_provider, _) = match destination {
            Some(found) => found,
            None => {
                warn!(data_id = %data_id, "no waiting destination shard entry on chain");
                continue;
            }
        };

        let migrate_info = MigrateInfo {
            data_id: data_id.clone(),
            order_id: order.id,
            cid: cid.clone(),
            from_provider: svc.node_address.clone(),
            to_provider: to_provider.clone(),
            migrate_tx_hash: hash.clone(),
            migrate_tx_height: height,
            complete_tx_hash: String::new(),
            complete_tx_height: 0,
            state: MigrateState::TxSent,
        };
        if let Err(e) = index::save_migrate(svc.datastore(), &migrate_info) {
            error!("save migrate failed: {}", e);
        }

        let _ = svc.migrate_tx.send(MigrateRequest {
            from_provider: svc.node_address.clone(),
            order_id: order.id,
            data_id: data_id.clone(),
            cid,
            to_provider: to_provider.clone(),
            migrate_tx_hash: hash.clone(),
            migrate_height: height,
        });
    }
    Ok((hash, results))
}

pub(super) async fn process_migrate(svc: &StorageService, req: MigrateRequest) -> Result<()> {
    let content = svc
        .store
        .get(&req.cid)?
        .ok_or_else(|| Error::DataMissing(format!("shard {} not in local store", req.cid)))?;

    let peer = svc.chain.get_node_peer(&req.to_provider).await?;
    let resp = svc
        .stream
        .request_shard_migrate(
            ShardMigrateReq {
                migrate_from: req.from_provider.clone(),
                order_id: req.order_id,
                data_id: req.data_id.clone(),
                tx_hash: req.migrate_tx_hash.clone(),
                tx_height: req.migrate_height,
                cid: req.cid.clone(),
                content,
            },
            &peer,
        )
        .await;
    if resp.code != 0 {
        return Err(Error::FailuresResponsed(resp.message));
    }

    // the destination's completion must be a real, successful tx
    let tx = svc.chain.get_tx(&resp.complete_hash, resp.complete_height).await?;
    if tx.code != 0 {
        return Err(Error::InvalidTx(format!(
            "complete tx {} failed: code={}",
            tx.hash, tx.code
        )));
    }

    // and the chain must show the handover: new entry from us, completed
    let order = svc.chain.get_order(req.order_id).await?;
    let shard = order.shards.get(&req.to_provider).ok_or_else(|| {
        Error::InvalidProvider(format!("no shard assigned to new provider {}", req.to_provider))
    })?;
    if shard.from != req.from_provider {
        return Err(Error::InvalidProvider(format!(
            "shard migrated from {}, expected {}",
            shard.from, req.from_provider
        )));
    }
    if shard.status != ShardStatus::Completed {
        return Err(Error::InvalidProvider(format!(
            "shard status should be Completed, actual {:?}",
            shard.status
        )));
    }
    info!(data_id = %req.data_id, to = %req.to_provider, "migrate response validated");

    match index::get_migrate(svc.datastore(), req.order_id, &req.cid) {
        Ok(Some(mut migrate_info)) => {
            migrate_info.state = MigrateState::Complete;
            migrate_info.complete_tx_hash = resp.complete_hash;
            migrate_info.complete_tx_height = resp.complete_height;
            if let Err(e) = index::save_migrate(svc.datastore(), &migrate_info) {
                error!("save migrate failed: {}", e);
            }
        }
        Ok(None) => warn!(order_id = req.order_id, cid = %req.cid, "migrate record missing"),
        Err(e) => error!("get migrate failed: {}", e),
    }
    Ok(())
}
