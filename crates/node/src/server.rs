//! TCP listener serving the shard protocols.
//!
//! Every accepted connection carries exactly one framed request. The
//! envelope's protocol id picks the handler; the response frame is
//! written back and the connection dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use sao_common::{Error, Result};
use sao_proto::frame::{read_frame, write_frame, Envelope};
use sao_proto::shard::{
    SHARD_ASSIGN_PROTOCOL, SHARD_COMPLETE_PROTOCOL, SHARD_LOAD_PROTOCOL, SHARD_MIGRATE_PROTOCOL,
};

use crate::gateway::GatewayService;
use crate::storage::{is_staged_load, StorageService};

pub async fn run_server(
    listen: SocketAddr,
    storage: Arc<StorageService>,
    gateway: Arc<GatewayService>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("bind {}: {}", listen, e)))?;
    serve(listener, storage, gateway, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    storage: Arc<StorageService>,
    gateway: Arc<GatewayService>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let listen = listener
        .local_addr()
        .map_err(|e| Error::CreateClientFailed(e.to_string()))?;
    info!(%listen, "shard protocol listener started");

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("shard protocol listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let storage = storage.clone();
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    handle_stream(stream, peer, storage, gateway).await;
                });
            }
        }
    }
}

async fn handle_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    storage: Arc<StorageService>,
    gateway: Arc<GatewayService>,
) {
    let request = match read_frame(&mut stream).await {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(%peer, "bad request frame: {}", e);
            return;
        }
    };
    debug!(%peer, protocol = %request.protocol, "incoming stream");
    let remote_host = peer.ip().to_string();

    let response = dispatch(&request, &remote_host, &storage, &gateway).await;
    let envelope = match response {
        Ok(envelope) => envelope,
        Err(e) => {
            let body = serde_json::json!({ "Code": e.code(), "Message": e.to_string() });
            match Envelope::new(&request.protocol, &body) {
                Ok(envelope) => envelope,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = write_frame(&mut stream, &envelope).await {
        error!(%peer, "write response failed: {}", e);
    }
    // one round trip per stream; dropping the socket closes it
}

async fn dispatch(
    request: &Envelope,
    remote_host: &str,
    storage: &Arc<StorageService>,
    gateway: &Arc<GatewayService>,
) -> Result<Envelope> {
    match request.protocol.as_str() {
        SHARD_ASSIGN_PROTOCOL => {
            let req = request.decode()?;
            Envelope::new(SHARD_ASSIGN_PROTOCOL, &storage.handle_shard_assign(req).await)
        }
        SHARD_COMPLETE_PROTOCOL => {
            let req = request.decode()?;
            Envelope::new(SHARD_COMPLETE_PROTOCOL, &gateway.handle_shard_complete(req).await)
        }
        SHARD_LOAD_PROTOCOL => {
            let req = request.decode()?;
            let resp = if is_staged_load(&req) {
                gateway.handle_shard_load_staged(req)
            } else {
                storage.handle_shard_load(req, Some(remote_host)).await
            };
            Envelope::new(SHARD_LOAD_PROTOCOL, &resp)
        }
        SHARD_MIGRATE_PROTOCOL => {
            let req = request.decode()?;
            Envelope::new(SHARD_MIGRATE_PROTOCOL, &storage.handle_shard_migrate(req).await)
        }
        other => Err(Error::InvalidParameters(format!("unknown protocol {}", other))),
    }
}
