//! Peer transport for the shard protocols.
//!
//! [`StreamProtocol`] dials the peer's published multiaddr and performs
//! exactly one framed request/response round trip per connection.
//! [`LocalProtocol`] is the loopback used when a shard's gateway is this
//! very node: loads come straight from the staging area and completion
//! notices go over an in-process channel instead of a socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use sao_common::{Error, Result};
use sao_proto::frame::{read_frame, write_frame, Envelope};
use sao_proto::shard::{
    next_response_id, ShardAssignReq, ShardAssignResp, ShardCompleteReq, ShardCompleteResp,
    ShardLoadReq, ShardLoadResp, ShardMigrateReq, ShardMigrateResp, SHARD_ASSIGN_PROTOCOL,
    SHARD_COMPLETE_PROTOCOL, SHARD_LOAD_PROTOCOL, SHARD_MIGRATE_PROTOCOL,
};
use sao_store::StagingArea;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Turn a published multiaddr (`/ip4/<host>/tcp/<port>`, `/dns4/...`) or a
/// plain `host:port` into a dialable endpoint.
pub fn multiaddr_to_host_port(addr: &str) -> Result<String> {
    if !addr.starts_with('/') {
        return Ok(addr.to_string());
    }
    let parts: Vec<&str> = addr.split('/').filter(|p| !p.is_empty()).collect();
    let mut host = None;
    let mut port = None;
    let mut i = 0;
    while i + 1 < parts.len() {
        match parts[i] {
            "ip4" | "ip6" | "dns4" | "dns6" | "dns" => host = Some(parts[i + 1]),
            "tcp" => port = Some(parts[i + 1]),
            _ => {}
        }
        i += 2;
    }
    match (host, port) {
        (Some(h), Some(p)) => Ok(format!("{}:{}", h, p)),
        _ => Err(Error::InvalidParameters(format!("unusable multiaddr {}", addr))),
    }
}

/// The host part of a multiaddr, used for peer identity checks.
pub fn multiaddr_host(addr: &str) -> Option<String> {
    multiaddr_to_host_port(addr)
        .ok()
        .and_then(|hp| hp.rsplit_once(':').map(|(h, _)| h.to_string()))
}

#[async_trait]
pub trait StorageProtocol: Send + Sync {
    async fn request_shard_assign(&self, req: ShardAssignReq, peer: &str) -> ShardAssignResp;
    async fn request_shard_load(&self, req: ShardLoadReq, peer: &str) -> ShardLoadResp;
    async fn request_shard_complete(&self, req: ShardCompleteReq, peer: &str) -> ShardCompleteResp;
    async fn request_shard_migrate(&self, req: ShardMigrateReq, peer: &str) -> ShardMigrateResp;
}

// ── streaming protocol ──────────────────────────────────────────────────

#[derive(Default)]
pub struct StreamProtocol;

impl StreamProtocol {
    pub fn new() -> Self {
        StreamProtocol
    }

    async fn round_trip(&self, protocol: &str, req: &Envelope, peer: &str) -> Result<Envelope> {
        let endpoint = multiaddr_to_host_port(peer)?;
        debug!(protocol, peer = %endpoint, "opening stream");
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| Error::CreateClientFailed(format!("connect to {} timed out", endpoint)))?
            .map_err(|e| Error::CreateClientFailed(format!("connect to {}: {}", endpoint, e)))?;
        write_frame(&mut stream, req).await?;
        let resp = read_frame(&mut stream).await?;
        // one round trip per stream; dropping the socket closes it
        Ok(resp)
    }
}

macro_rules! stream_request {
    ($self:ident, $proto:expr, $req:expr, $peer:expr, $resp_ty:ty) => {{
        let envelope = match Envelope::new($proto, &$req) {
            Ok(e) => e,
            Err(e) => {
                return <$resp_ty>::fail(e);
            }
        };
        match $self.round_trip($proto, &envelope, $peer).await {
            Ok(resp) => match resp.decode::<$resp_ty>() {
                Ok(r) => r,
                Err(e) => <$resp_ty>::fail(e),
            },
            Err(e) => <$resp_ty>::fail(e),
        }
    }};
}

/// Build a failure response carrying the taxonomy code.
pub trait FailResp: Sized {
    fn fail(err: Error) -> Self;
}

impl FailResp for ShardAssignResp {
    fn fail(err: Error) -> Self {
        ShardAssignResp { code: err.code(), message: err.to_string() }
    }
}

impl FailResp for ShardCompleteResp {
    fn fail(err: Error) -> Self {
        ShardCompleteResp { code: err.code(), message: err.to_string() }
    }
}

impl FailResp for ShardLoadResp {
    fn fail(err: Error) -> Self {
        ShardLoadResp { code: err.code(), message: err.to_string(), ..Default::default() }
    }
}

impl FailResp for ShardMigrateResp {
    fn fail(err: Error) -> Self {
        ShardMigrateResp { code: err.code(), message: err.to_string(), ..Default::default() }
    }
}

#[async_trait]
impl StorageProtocol for StreamProtocol {
    async fn request_shard_assign(&self, req: ShardAssignReq, peer: &str) -> ShardAssignResp {
        stream_request!(self, SHARD_ASSIGN_PROTOCOL, req, peer, ShardAssignResp)
    }

    async fn request_shard_load(&self, req: ShardLoadReq, peer: &str) -> ShardLoadResp {
        stream_request!(self, SHARD_LOAD_PROTOCOL, req, peer, ShardLoadResp)
    }

    async fn request_shard_complete(&self, req: ShardCompleteReq, peer: &str) -> ShardCompleteResp {
        stream_request!(self, SHARD_COMPLETE_PROTOCOL, req, peer, ShardCompleteResp)
    }

    async fn request_shard_migrate(&self, req: ShardMigrateReq, peer: &str) -> ShardMigrateResp {
        stream_request!(self, SHARD_MIGRATE_PROTOCOL, req, peer, ShardMigrateResp)
    }
}

// ── local loopback ──────────────────────────────────────────────────────

pub struct LocalProtocol {
    staging: Arc<StagingArea>,
    complete_tx: mpsc::UnboundedSender<ShardCompleteReq>,
}

impl LocalProtocol {
    pub fn new(staging: Arc<StagingArea>, complete_tx: mpsc::UnboundedSender<ShardCompleteReq>) -> Self {
        LocalProtocol { staging, complete_tx }
    }
}

#[async_trait]
impl StorageProtocol for LocalProtocol {
    async fn request_shard_assign(&self, _req: ShardAssignReq, _peer: &str) -> ShardAssignResp {
        ShardAssignResp::fail(Error::InvalidParameters(
            "shard assign has no local loopback".to_string(),
        ))
    }

    async fn request_shard_load(&self, req: ShardLoadReq, _peer: &str) -> ShardLoadResp {
        match self.staging.get_staged(&req.owner, &req.cid) {
            Ok(content) => ShardLoadResp {
                order_id: req.order_id,
                cid: req.cid,
                content,
                request_id: req.request_id,
                response_id: next_response_id(),
                ..Default::default()
            },
            Err(e) => ShardLoadResp {
                request_id: req.request_id,
                response_id: next_response_id(),
                ..ShardLoadResp::fail(e)
            },
        }
    }

    async fn request_shard_complete(&self, req: ShardCompleteReq, _peer: &str) -> ShardCompleteResp {
        match self.complete_tx.send(req) {
            Ok(()) => ShardCompleteResp { code: 0, message: String::new() },
            Err(e) => ShardCompleteResp::fail(Error::FailuresResponsed(e.to_string())),
        }
    }

    async fn request_shard_migrate(&self, _req: ShardMigrateReq, _peer: &str) -> ShardMigrateResp {
        ShardMigrateResp::fail(Error::InvalidParameters(
            "shard migrate has no local loopback".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiaddr_parsing() {
        assert_eq!(
            multiaddr_to_host_port("/ip4/127.0.0.1/tcp/5153").expect("parse"),
            "127.0.0.1:5153"
        );
        assert_eq!(
            multiaddr_to_host_port("/dns4/gateway.sao/tcp/4001").expect("parse"),
            "gateway.sao:4001"
        );
        assert_eq!(multiaddr_to_host_port("10.0.0.2:9000").expect("plain"), "10.0.0.2:9000");
        assert!(multiaddr_to_host_port("/ip4/127.0.0.1").is_err());
        assert_eq!(multiaddr_host("/ip4/10.1.1.1/tcp/2").expect("host"), "10.1.1.1");
    }

    #[tokio::test]
    async fn test_local_load_serves_staged_bytes() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let staging = Arc::new(StagingArea::new(tmp.path()).expect("staging"));
        staging.stage("did:sao:o", "cid1", b"staged").expect("stage");
        let (tx, _rx) = mpsc::unbounded_channel();
        let local = LocalProtocol::new(staging, tx);

        let resp = local
            .request_shard_load(
                ShardLoadReq {
                    order_id: 1,
                    owner: "did:sao:o".into(),
                    cid: "cid1".into(),
                    request_id: 77,
                    ..Default::default()
                },
                "",
            )
            .await;
        assert_eq!(resp.code, 0, "{}", resp.message);
        assert_eq!(resp.content, b"staged");
        assert_eq!(resp.request_id, 77);
        assert!(resp.response_id > 0);
    }

    #[tokio::test]
    async fn test_local_load_missing_is_data_missing() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let staging = Arc::new(StagingArea::new(tmp.path()).expect("staging"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let local = LocalProtocol::new(staging, tx);

        let resp = local
            .request_shard_load(
                ShardLoadReq { owner: "o".into(), cid: "c".into(), ..Default::default() },
                "",
            )
            .await;
        assert_ne!(resp.code, 0);
    }

    #[tokio::test]
    async fn test_local_complete_forwards_on_channel() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let staging = Arc::new(StagingArea::new(tmp.path()).expect("staging"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = LocalProtocol::new(staging, tx);

        let resp = local
            .request_shard_complete(
                ShardCompleteReq {
                    order_id: 4,
                    data_id: "d".into(),
                    cids: vec!["c".into()],
                    tx_hash: "H".into(),
                    height: 10,
                    code: 0,
                    message: String::new(),
                },
                "",
            )
            .await;
        assert_eq!(resp.code, 0);
        let forwarded = rx.recv().await.expect("forwarded");
        assert_eq!(forwarded.order_id, 4);
    }
}
