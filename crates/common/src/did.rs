//! DID identities and detached JWS envelopes.
//!
//! A proposal is signed as a JWS with a detached payload: the envelope
//! carries the base64url protected header and signature, the payload bytes
//! travel separately inside the proposal itself. Verification resolves the
//! owner's sid document (the chain is the resolver) and checks the
//! signature against any key listed there.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const DID_PREFIX: &str = "did:sao:";

/// The public-query sentinel. Proposals owned by "all" skip signature
/// verification entirely.
pub const OWNER_ALL: &str = "all";

/// Detached JWS over a proposal byte string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JwsSignature {
    pub protected: String,
    pub signature: String,
}

/// Key document the chain resolves a DID to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SidDocument {
    pub version_id: String,
    /// hex-encoded ed25519 verifying keys
    pub keys: Vec<String>,
}

/// Holds one ed25519 signing key and the DID derived from it.
pub struct DidManager {
    key: SigningKey,
    did: String,
}

impl std::fmt::Debug for DidManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DidManager")
            .field("did", &self.did)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl DidManager {
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let did = did_for_key(&key.verifying_key());
        DidManager { key, did }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(secret);
        let did = did_for_key(&key.verifying_key());
        DidManager { key, did }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Sid document for this key, resolvable without the chain.
    pub fn sid_document(&self) -> SidDocument {
        SidDocument {
            version_id: self.did.clone(),
            keys: vec![self.verifying_key_hex()],
        }
    }

    /// Sign `payload` as a detached JWS.
    pub fn create_jws(&self, payload: &[u8]) -> Result<JwsSignature> {
        let header = serde_json::json!({ "alg": "EdDSA", "kid": self.did });
        let header_bytes = serde_json::to_vec(&header)
            .map_err(|e| Error::CreateJwsFailed(e.to_string()))?;
        let protected = URL_SAFE_NO_PAD.encode(header_bytes);
        let input = signing_input(&protected, payload);
        let sig = self.key.sign(input.as_bytes());
        Ok(JwsSignature {
            protected,
            signature: URL_SAFE_NO_PAD.encode(sig.to_bytes()),
        })
    }
}

/// Derive the DID string for a verifying key.
pub fn did_for_key(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    format!("{}{}", DID_PREFIX, hex::encode(&digest[..20]))
}

fn signing_input(protected: &str, payload: &[u8]) -> String {
    format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(payload))
}

/// Verify a detached JWS against the keys in a sid document.
pub fn verify_jws(payload: &[u8], jws: &JwsSignature, doc: &SidDocument) -> Result<()> {
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(&jws.signature)
        .map_err(|e| Error::CreateJwsFailed(format!("decode signature: {}", e)))?;
    let sig_arr: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::CreateJwsFailed("signature must be 64 bytes".to_string()))?;
    let sig = Signature::from_bytes(&sig_arr);
    let input = signing_input(&jws.protected, payload);

    for key_hex in &doc.keys {
        let key_bytes = match hex::decode(key_hex) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let key_arr: [u8; 32] = match key_bytes.as_slice().try_into() {
            Ok(a) => a,
            Err(_) => continue,
        };
        if let Ok(key) = VerifyingKey::from_bytes(&key_arr) {
            if key.verify(input.as_bytes(), &sig).is_ok() {
                return Ok(());
            }
        }
    }
    Err(Error::CreateJwsFailed(format!(
        "no key in sid document {} verifies the signature",
        doc.version_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jws_roundtrip() {
        let dm = DidManager::generate();
        let payload = b"proposal bytes";
        let jws = dm.create_jws(payload).expect("sign");
        verify_jws(payload, &jws, &dm.sid_document()).expect("verify");
    }

    #[test]
    fn test_jws_rejects_tampered_payload() {
        let dm = DidManager::generate();
        let jws = dm.create_jws(b"original").expect("sign");
        assert!(verify_jws(b"tampered", &jws, &dm.sid_document()).is_err());
    }

    #[test]
    fn test_jws_rejects_wrong_key() {
        let signer = DidManager::generate();
        let other = DidManager::generate();
        let jws = signer.create_jws(b"payload").expect("sign");
        assert!(verify_jws(b"payload", &jws, &other.sid_document()).is_err());
    }

    #[test]
    fn test_did_deterministic_for_key() {
        let dm = DidManager::generate();
        let again = DidManager::from_secret(&dm.secret_bytes());
        assert_eq!(dm.did(), again.did());
        assert!(dm.did().starts_with(DID_PREFIX));
    }
}
