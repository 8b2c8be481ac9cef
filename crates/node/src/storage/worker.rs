//! The shard worker state machine.
//!
//! One logical worker consumes `ShardInfo` tasks from the unbounded queue
//! and drives each to `Complete` or `Terminate`. Steps within one shard
//! are strictly sequential; failed tasks are persisted with `last_err`
//! and re-enqueued until the retry budget runs out.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sao_chain::ChainStore;
use sao_common::{cid::calculate_cid, Error, Result};
use sao_proto::shard::{next_response_id, ShardCompleteReq, ShardLoadReq};
use sao_store::ShardStore;

use crate::index;
use crate::state::{ShardInfo, ShardState, MAX_RETRIES};
use crate::transport::StorageProtocol;

use super::StorageService;

pub(super) fn spawn_shard_worker(
    svc: Arc<StorageService>,
    mut task_rx: mpsc::UnboundedReceiver<ShardInfo>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("shard worker started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    // close the queue and drain what is already in it
                    info!("shard worker draining");
                    task_rx.close();
                }
                task = task_rx.recv() => {
                    let mut task = match task {
                        Some(t) => t,
                        None => break,
                    };
                    if let Err(e) = process(&svc, &mut task).await {
                        warn!(
                            order_id = task.order_id,
                            cid = %task.cid,
                            tries = task.tries,
                            "shard processing failed: {}", e
                        );
                        if task.state != ShardState::Terminate {
                            svc.enqueue(task);
                        }
                    }
                }
            }
        }
        info!("shard worker stopped");
    })
}

/// Advance one shard task. The durable record is updated at every state
/// transition and on every failure, so a crash at any point resumes from
/// the last persisted step.
pub(super) async fn process(svc: &StorageService, task: &mut ShardInfo) -> Result<()> {
    info!(
        order_id = task.order_id,
        gateway = %task.gateway,
        cid = %task.cid,
        state = %task.state,
        "processing shard"
    );

    if task.state == ShardState::Terminate {
        return Ok(());
    }

    task.tries += 1;
    if task.tries >= MAX_RETRIES {
        task.state = ShardState::Terminate;
        // keep last_err: it names the failure that exhausted the budget
        persist(svc, task);
        return Err(Error::RetriesExceed(format!(
            "order {} shard {} gave up after {} tries",
            task.order_id, task.data_id, task.tries
        )));
    }

    if task.expire_height > 0 {
        let latest = svc.chain.get_last_height().await?;
        if latest > task.expire_height as i64 {
            task.state = ShardState::Terminate;
            let err = Error::ExpiredOrder(format!(
                "order expired: latest={} expireAt={}",
                latest, task.expire_height
            ));
            record_error(svc, task, &err);
            return Err(err);
        }
    }

    let (protocol, peer) = match svc.resolve_protocol(&task.gateway).await {
        Ok(resolved) => resolved,
        Err(e) => {
            record_error(svc, task, &e);
            return Err(e);
        }
    };

    if task.state < ShardState::Stored {
        if !task.is_renew() {
            let resp = protocol
                .request_shard_load(
                    ShardLoadReq {
                        order_id: task.order_id,
                        owner: task.owner.clone(),
                        cid: task.cid.clone(),
                        request_id: next_response_id(),
                        ..Default::default()
                    },
                    &peer,
                )
                .await;
            if resp.code != 0 {
                let err = Error::FailuresResponsed(resp.message);
                record_error(svc, task, &err);
                return Err(err);
            }
            let got_cid = calculate_cid(&resp.content);
            if got_cid != task.cid {
                let err = Error::InvalidCid(format!(
                    "ipfs cid {} != task cid {}",
                    got_cid, task.cid
                ));
                record_error(svc, task, &err);
                return Err(err);
            }
            if let Err(e) = svc.store.store(&task.cid, &resp.content) {
                let err = Error::StoreFailed(e.to_string());
                record_error(svc, task, &err);
                return Err(err);
            }
            task.size = resp.content.len() as u64;
        } else if !svc.store.is_exist(&task.cid) {
            let err = Error::DataMissing(format!("shard with cid {} not found", task.cid));
            record_error(svc, task, &err);
            return Err(err);
        }
        task.state = ShardState::Stored;
        persist(svc, task);
    }

    if task.state < ShardState::TxSent {
        let (tx_hash, height) = match svc
            .chain
            .complete_order(&svc.node_address, task.order_id, &task.cid, task.size)
            .await
        {
            Ok(coords) => coords,
            Err(e) => {
                record_error(svc, task, &e);
                return Err(e);
            }
        };
        info!(
            order_id = task.order_id,
            cid = %task.cid,
            tx = %tx_hash,
            "complete order succeeded"
        );
        task.state = ShardState::Complete;
        task.complete_hash = tx_hash;
        task.complete_height = height;
        persist(svc, task);
    }

    // notify the gateway; the on-chain completion is authoritative, so a
    // refused notification never rolls the state back
    let resp = protocol
        .request_shard_complete(
            ShardCompleteReq {
                order_id: task.order_id,
                data_id: task.data_id.clone(),
                cids: vec![task.cid.clone()],
                tx_hash: task.complete_hash.clone(),
                height: task.complete_height,
                code: 0,
                message: String::new(),
            },
            &peer,
        )
        .await;
    if resp.code != 0 {
        record_error(svc, task, &Error::FailuresResponsed(resp.message));
    }
    if task.state < ShardState::Complete {
        task.state = ShardState::Complete;
        persist(svc, task);
    }
    Ok(())
}

fn persist(svc: &StorageService, task: &ShardInfo) {
    if let Err(e) = index::save_shard(&svc.ds, task) {
        warn!(order_id = task.order_id, cid = %task.cid, "save shard failed: {}", e);
    }
}

fn record_error(svc: &StorageService, task: &mut ShardInfo, err: &Error) {
    task.last_err = err.to_string();
    persist(svc, task);
}
