//! Length-prefixed JSON frames over a bidirectional byte stream.
//!
//! Wire format per frame:
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────────────────┐
//! │ 4 bytes  │ 4 bytes (BE)  │ JSON payload (Envelope)      │
//! │ magic    │ payload len   │ { Protocol, Payload }        │
//! └──────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! The magic bytes allow early rejection of non-SAO connections. Every
//! read carries a 10-second deadline; a stream is used for exactly one
//! request/response round trip and closed afterwards.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use sao_common::{Error, Result};

pub const FRAME_MAGIC: [u8; 4] = [0x53, 0x41, 0x4f, 0x01]; // "SAO" + version

/// Stream read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Shard contents ride inside frames; cap well above the largest shard.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

/// One frame on the wire: the protocol id plus the message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub protocol: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(protocol: &str, payload: &T) -> Result<Self> {
        Ok(Envelope {
            protocol: protocol.to_string(),
            payload: serde_json::to_value(payload)
                .map_err(|e| Error::MarshalFailed(e.to_string()))?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::UnMarshalFailed(e.to_string()))
    }
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, envelope: &Envelope) -> Result<()> {
    let payload =
        serde_json::to_vec(envelope).map_err(|e| Error::MarshalFailed(e.to_string()))?;
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::MarshalFailed(format!(
            "frame payload too large: {} bytes (max {})",
            payload.len(),
            MAX_FRAME_PAYLOAD
        )));
    }
    let len = (payload.len() as u32).to_be_bytes();
    w.write_all(&FRAME_MAGIC)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("write magic: {}", e)))?;
    w.write_all(&len)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("write length: {}", e)))?;
    w.write_all(&payload)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("write payload: {}", e)))?;
    w.flush()
        .await
        .map_err(|e| Error::CreateClientFailed(format!("flush: {}", e)))?;
    Ok(())
}

/// Read one frame, honouring the 10-second stream deadline.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Envelope> {
    timeout(READ_TIMEOUT, read_frame_inner(r))
        .await
        .map_err(|_| Error::CreateClientFailed("stream read deadline exceeded".to_string()))?
}

async fn read_frame_inner<R: AsyncRead + Unpin>(r: &mut R) -> Result<Envelope> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("read magic: {}", e)))?;
    if magic != FRAME_MAGIC {
        return Err(Error::UnMarshalFailed(format!(
            "invalid magic bytes {:02x?}, not a sao peer",
            magic
        )));
    }

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("read length: {}", e)))?;
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len == 0 {
        return Err(Error::UnMarshalFailed("empty frame payload".to_string()));
    }
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(Error::UnMarshalFailed(format!(
            "frame payload too large: {} bytes (max {})",
            payload_len, MAX_FRAME_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("read payload: {}", e)))?;
    serde_json::from_slice(&payload).map_err(|e| Error::UnMarshalFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Ping { seq: 7, note: "hello".into() };
        let env = Envelope::new("/sao/test/1.0", &msg).expect("envelope");

        write_frame(&mut a, &env).await.expect("write");
        let got = read_frame(&mut b).await.expect("read");
        assert_eq!(got.protocol, "/sao/test/1.0");
        let decoded: Ping = got.decode().expect("decode");
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        a.write_all(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 4]).await.unwrap();
        a.write_all(b"null").await.unwrap();
        let err = read_frame(&mut b).await.expect_err("must fail");
        assert!(err.to_string().contains("magic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        // nothing is ever written: once the paused clock auto-advances
        // past the deadline, the read must fail instead of hanging
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame(&mut b).await.expect_err("deadline");
        assert!(err.to_string().contains("deadline"));
    }
}
