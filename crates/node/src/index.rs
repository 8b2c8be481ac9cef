//! Durable order/shard/migration index.
//!
//! A single lmdb environment per repo with one named database. Records
//! are CBOR under the namespaces `order-<dataId>`,
//! `order-<orderId>-shard-<cid>` and `migrate-<orderId>-shard-<cid>`;
//! three index keys (`order-index`, `shard-index`, `migrate-index`) hold
//! the full key lists so startup can enumerate durable entries. Writes
//! are ordered record-first: the index is appended only when the record
//! did not previously exist, so a key lands in its index exactly once.
//! Index entries are never pruned.

use std::path::Path;
use std::sync::Arc;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;

use sao_common::{Error, Result};

use crate::state::{
    MigrateIndex, MigrateInfo, MigrateKey, OrderIndex, OrderInfo, OrderKey, ShardIndex,
    ShardInfo, ShardKey,
};

pub const ORDER_INDEX_KEY: &str = "order-index";
pub const SHARD_INDEX_KEY: &str = "shard-index";
pub const MIGRATE_INDEX_KEY: &str = "migrate-index";

pub fn order_key(data_id: &str) -> String {
    format!("order-{}", data_id)
}

pub fn shard_key(order_id: u64, cid: &str) -> String {
    format!("order-{}-shard-{}", order_id, cid)
}

pub fn migrate_key(order_id: u64, cid: &str) -> String {
    format!("migrate-{}-shard-{}", order_id, cid)
}

#[derive(Clone)]
pub struct Datastore {
    env: Arc<Environment>,
    db: Database,
}

impl Datastore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| Error::CreateDirFailed(e.to_string()))?;
        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(1_000_000_000)
            .open(path)
            .map_err(|e| Error::StoreFailed(format!("open datastore: {}", e)))?;
        let db = env
            .create_db(Some("state"), DatabaseFlags::empty())
            .map_err(|e| Error::StoreFailed(format!("create db: {}", e)))?;
        Ok(Datastore { env: Arc::new(env), db })
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        let txn = self
            .env
            .begin_ro_txn()
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        match txn.get(self.db, &key.as_bytes()) {
            Ok(_) => Ok(true),
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(Error::StoreFailed(e.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self
            .env
            .begin_ro_txn()
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        match txn.get(self.db, &key.as_bytes()) {
            Ok(v) => Ok(Some(v.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(Error::StoreFailed(e.to_string())),
        }
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut txn = self
            .env
            .begin_rw_txn()
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        txn.put(self.db, &key.as_bytes(), &value, WriteFlags::empty())
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        txn.commit().map_err(|e| Error::StoreFailed(e.to_string()))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut txn = self
            .env
            .begin_rw_txn()
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        match txn.del(self.db, &key.as_bytes(), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(Error::StoreFailed(e.to_string())),
        }
        txn.commit().map_err(|e| Error::StoreFailed(e.to_string()))
    }

    /// All keys currently in the store; used by repo reset diagnostics.
    pub fn keys(&self) -> Result<Vec<String>> {
        let txn = self
            .env
            .begin_ro_txn()
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        let mut cursor = txn
            .open_ro_cursor(self.db)
            .map_err(|e| Error::StoreFailed(e.to_string()))?;
        let mut keys = Vec::new();
        for (key, _) in cursor.iter() {
            keys.push(String::from_utf8_lossy(key).to_string());
        }
        Ok(keys)
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => serde_cbor::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::UnMarshalFailed(format!("{}: {}", key, e))),
        }
    }

    fn put_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes =
            serde_cbor::to_vec(value).map_err(|e| Error::MarshalFailed(format!("{}: {}", key, e)))?;
        self.put(key, &bytes)
    }
}

// ── orders ──────────────────────────────────────────────────────────────

pub fn save_order(ds: &Datastore, order: &OrderInfo) -> Result<()> {
    let key = order_key(&order.data_id);
    let exists = ds.has(&key)?;
    ds.put_typed(&key, order)?;
    if !exists {
        let mut index: OrderIndex = ds.get_typed(ORDER_INDEX_KEY)?.unwrap_or_default();
        index.all.push(OrderKey { data_id: order.data_id.clone() });
        ds.put_typed(ORDER_INDEX_KEY, &index)?;
    }
    Ok(())
}

pub fn get_order(ds: &Datastore, data_id: &str) -> Result<Option<OrderInfo>> {
    ds.get_typed(&order_key(data_id))
}

pub fn get_order_index(ds: &Datastore) -> Result<OrderIndex> {
    Ok(ds.get_typed(ORDER_INDEX_KEY)?.unwrap_or_default())
}

// ── shards ──────────────────────────────────────────────────────────────

pub fn save_shard(ds: &Datastore, shard: &ShardInfo) -> Result<()> {
    let key = shard_key(shard.order_id, &shard.cid);
    let exists = ds.has(&key)?;
    ds.put_typed(&key, shard)?;
    if !exists {
        let mut index: ShardIndex = ds.get_typed(SHARD_INDEX_KEY)?.unwrap_or_default();
        index.all.push(ShardKey { order_id: shard.order_id, cid: shard.cid.clone() });
        ds.put_typed(SHARD_INDEX_KEY, &index)?;
    }
    Ok(())
}

pub fn get_shard(ds: &Datastore, order_id: u64, cid: &str) -> Result<Option<ShardInfo>> {
    ds.get_typed(&shard_key(order_id, cid))
}

pub fn get_shard_index(ds: &Datastore) -> Result<ShardIndex> {
    Ok(ds.get_typed(SHARD_INDEX_KEY)?.unwrap_or_default())
}

/// Records to replay after a restart: exactly those whose persisted state
/// is neither `Complete` nor `Terminate`.
pub fn pending_shards(ds: &Datastore) -> Result<Vec<ShardInfo>> {
    let index = get_shard_index(ds)?;
    let mut pending = Vec::new();
    for key in &index.all {
        if let Some(shard) = get_shard(ds, key.order_id, &key.cid)? {
            if !shard.state.is_terminal() {
                pending.push(shard);
            }
        }
    }
    Ok(pending)
}

// ── migrations ──────────────────────────────────────────────────────────

pub fn save_migrate(ds: &Datastore, migrate: &MigrateInfo) -> Result<()> {
    let key = migrate_key(migrate.order_id, &migrate.cid);
    let exists = ds.has(&key)?;
    ds.put_typed(&key, migrate)?;
    if !exists {
        let mut index: MigrateIndex = ds.get_typed(MIGRATE_INDEX_KEY)?.unwrap_or_default();
        index.all.push(MigrateKey {
            data_id: migrate.data_id.clone(),
            from_provider: migrate.from_provider.clone(),
            order_id: migrate.order_id,
            cid: migrate.cid.clone(),
        });
        ds.put_typed(MIGRATE_INDEX_KEY, &index)?;
    }
    Ok(())
}

pub fn get_migrate(ds: &Datastore, order_id: u64, cid: &str) -> Result<Option<MigrateInfo>> {
    ds.get_typed(&migrate_key(order_id, cid))
}

pub fn get_migrate_index(ds: &Datastore) -> Result<MigrateIndex> {
    Ok(ds.get_typed(MIGRATE_INDEX_KEY)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ShardState;
    use tempfile::TempDir;

    fn shard(order_id: u64, cid: &str, state: ShardState) -> ShardInfo {
        ShardInfo {
            order_id,
            data_id: format!("data-{}", order_id),
            cid: cid.to_string(),
            owner: "did:sao:o".into(),
            gateway: "sao1gw".into(),
            order_operation: "1".into(),
            shard_operation: "1".into(),
            complete_hash: String::new(),
            complete_height: 0,
            size: 0,
            tries: 0,
            expire_height: 0,
            state,
            last_err: String::new(),
        }
    }

    #[test]
    fn test_kv_roundtrip() {
        let tmp = TempDir::new().expect("tmpdir");
        let ds = Datastore::open(tmp.path()).expect("open");
        assert!(!ds.has("k").expect("has"));
        ds.put("k", b"v").expect("put");
        assert!(ds.has("k").expect("has"));
        assert_eq!(ds.get("k").expect("get").expect("some"), b"v");
        ds.delete("k").expect("delete");
        assert!(ds.get("k").expect("get").is_none());
        ds.delete("k").expect("delete missing is ok");
    }

    #[test]
    fn test_index_appended_exactly_once() {
        let tmp = TempDir::new().expect("tmpdir");
        let ds = Datastore::open(tmp.path()).expect("open");

        let mut s = shard(1, "cid-a", ShardState::Validated);
        save_shard(&ds, &s).expect("save");
        s.state = ShardState::Stored;
        save_shard(&ds, &s).expect("save again");
        s.state = ShardState::Complete;
        save_shard(&ds, &s).expect("save third");

        let index = get_shard_index(&ds).expect("index");
        assert_eq!(index.all.len(), 1, "repeated saves must not duplicate the key");
        assert_eq!(
            get_shard(&ds, 1, "cid-a").expect("get").expect("some").state,
            ShardState::Complete
        );
    }

    #[test]
    fn test_pending_excludes_terminal_states() {
        let tmp = TempDir::new().expect("tmpdir");
        let ds = Datastore::open(tmp.path()).expect("open");

        save_shard(&ds, &shard(1, "aa", ShardState::Validated)).expect("save");
        save_shard(&ds, &shard(2, "bb", ShardState::Stored)).expect("save");
        save_shard(&ds, &shard(3, "cc", ShardState::Complete)).expect("save");
        save_shard(&ds, &shard(4, "dd", ShardState::Terminate)).expect("save");

        let pending = pending_shards(&ds).expect("pending");
        let ids: Vec<u64> = pending.iter().map(|s| s.order_id).collect();
        assert_eq!(ids, vec![1, 2]);

        // terminal records stay visible for audit
        let index = get_shard_index(&ds).expect("index");
        assert_eq!(index.all.len(), 4);
    }

    #[test]
    fn test_order_and_migrate_roundtrip() {
        let tmp = TempDir::new().expect("tmpdir");
        let ds = Datastore::open(tmp.path()).expect("open");

        let order = OrderInfo {
            data_id: "d1".into(),
            owner: "did:sao:o".into(),
            cid: "cc".into(),
            stage_path: String::new(),
            order_id: 5,
            order_hash: "H".into(),
            order_tx_type: sao_proto::shard::AssignTxType::MsgStore,
            order_height: 9,
            shards: Default::default(),
            expire_height: 100,
            state: crate::state::OrderState::Ready,
            tries: 0,
            last_err: String::new(),
        };
        save_order(&ds, &order).expect("save order");
        let got = get_order(&ds, "d1").expect("get").expect("some");
        assert_eq!(got.order_id, 5);
        assert_eq!(get_order_index(&ds).expect("idx").all.len(), 1);

        let mi = MigrateInfo {
            data_id: "d1".into(),
            order_id: 5,
            cid: "cc".into(),
            from_provider: "sao1a".into(),
            to_provider: "sao1b".into(),
            migrate_tx_hash: "MH".into(),
            migrate_tx_height: 11,
            complete_tx_hash: String::new(),
            complete_tx_height: 0,
            state: crate::state::MigrateState::TxSent,
        };
        save_migrate(&ds, &mi).expect("save migrate");
        save_migrate(&ds, &mi).expect("save migrate again");
        assert_eq!(get_migrate_index(&ds).expect("idx").all.len(), 1);
        let got = get_migrate(&ds, 5, "cc").expect("get").expect("some");
        assert_eq!(got.to_provider, "sao1b");
    }
}
