//! JSON-Patch helpers for data-model updates.
//!
//! Patch semantics come from the `json-patch` crate; these wrappers only
//! add canonicalisation: values pass through `serde_json::Value`, whose
//! maps are key-sorted, so byte-wise comparison of re-serialised content
//! is meaningful.

use sao_common::{Error, Result};

/// Canonical JSON bytes for a content blob.
pub fn canonicalize(content: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value =
        serde_json::from_slice(content).map_err(|e| Error::UnMarshalFailed(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| Error::MarshalFailed(e.to_string()))
}

/// Diff two content blobs into a JSON-Patch document.
pub fn generate_patch(origin: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    let origin: serde_json::Value =
        serde_json::from_slice(origin).map_err(|e| Error::CreatePatchFailed(e.to_string()))?;
    let target: serde_json::Value =
        serde_json::from_slice(target).map_err(|e| Error::CreatePatchFailed(e.to_string()))?;
    let patch = json_patch::diff(&origin, &target);
    serde_json::to_vec(&patch).map_err(|e| Error::CreatePatchFailed(e.to_string()))
}

/// Apply a JSON-Patch document, returning canonical target bytes.
pub fn apply_patch(origin: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    let mut doc: serde_json::Value =
        serde_json::from_slice(origin).map_err(|e| Error::ApplyPatchFailed(e.to_string()))?;
    let patch: json_patch::Patch =
        serde_json::from_slice(patch).map_err(|e| Error::ApplyPatchFailed(e.to_string()))?;
    json_patch::patch(&mut doc, &patch).map_err(|e| Error::ApplyPatchFailed(e.to_string()))?;
    serde_json::to_vec(&doc).map_err(|e| Error::ApplyPatchFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_roundtrip_law() {
        let origin = br#"{"name":"m","count":1}"#;
        let target = br#"{"name":"m","count":2,"extra":true}"#;
        let patch = generate_patch(origin, target).expect("generate");
        let result = apply_patch(origin, &patch).expect("apply");
        assert_eq!(result, canonicalize(target).expect("canonical target"));
    }

    #[test]
    fn test_empty_patch_is_identity() {
        let origin = br#"{"a":[1,2,3]}"#;
        let patch = generate_patch(origin, origin).expect("generate");
        let result = apply_patch(origin, &patch).expect("apply");
        assert_eq!(result, canonicalize(origin).expect("canonical"));
    }

    #[test]
    fn test_patch_rejects_non_json() {
        assert!(generate_patch(b"not json", b"{}").is_err());
        assert!(apply_patch(b"{}", b"also not json").is_err());
    }
}
