//! Storage backend seam.

use sao_common::Result;

/// Content-addressed byte store. `is_exist` must stay O(1); swapping the
/// filesystem backend for an object store behind this trait is fine.
pub trait ShardStore: Send + Sync {
    /// Persist `data` under `cid`, returning the number of bytes written.
    /// Storing an existing cid is a no-op (the existing copy is
    /// authoritative).
    fn store(&self, cid: &str, data: &[u8]) -> Result<u64>;

    /// Fetch the bytes for `cid`, `None` if absent.
    fn get(&self, cid: &str) -> Result<Option<Vec<u8>>>;

    fn is_exist(&self, cid: &str) -> bool;
}
