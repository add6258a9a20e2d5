use rocksdb::{Options, DB, ColumnFamilyDescriptor, WriteBatch, WriteOptions};
use serde::{Serialize, de::DeserializeOwned};
use anyhow::{Result, Context};
use std::sync::Arc;

// bincode for compact binary values; zstd on the larger wallet records.
// `get` accepts both encodings so callers never need to know which was used.

pub const CF_NAMES: [&str; 6] = [
    "default",
    "descriptor", // descriptor id -> DescriptorRecord
    "wallet_tx",  // txid -> WalletTx (zstd)
    "cursor",     // b"cursor" -> ChainCursor
    "block",      // big-endian height -> Block (node block store)
    "chain_meta", // b"tip" -> u64
];

pub struct Store {
    pub db: DB,
    path: String,
}

impl Store {
    /// Perform database health check
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> Result<Self> {
        let db_path = base_path.to_string();

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path).ok();
        std::fs::create_dir_all(&wal_dir).ok();
        db_opts.set_wal_dir(&wal_dir);

        // Block application relies on WAL-backed atomic batches, not periodic fsync
        db_opts.set_use_fsync(false);
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_max_open_files(256);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, &db_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let store = Store { db, path: db_path };
        store.health_check().with_context(|| "Database health check failed during initialization")?;
        tracing::debug!(path = %store.path, "database opened");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn encode<T: Serialize>(cf: &str, key: &[u8], value: &T, compress: bool) -> Result<Vec<u8>> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        if compress {
            zstd::encode_all(&data[..], 3)
                .with_context(|| format!("Failed to compress value for key '{key:?}' in CF '{cf}'"))
        } else {
            Ok(data)
        }
    }

    fn decode<T: DeserializeOwned>(cf: &str, key: &[u8], value: &[u8]) -> Result<T> {
        // First attempt: assume data is compressed
        if let Ok(decompressed) = zstd::decode_all(value) {
            if let Ok(deser) = bincode::deserialize(&decompressed) {
                return Ok(deser);
            }
        }
        bincode::deserialize(value).map_err(|_| {
            anyhow::anyhow!("Failed to deserialize value for key '{:?}' in CF '{}'", key, cf)
        })
    }

    fn handle(&self, cf: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = Self::encode(cf, key, value, false)?;
        let handle = self.handle(cf)?;
        self.db
            .put_cf_opt(handle, key, &data, &WriteOptions::default())
            .with_context(|| format!("Failed to PUT to database for key '{key:?}' in CF '{cf}'"))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(value) => Self::decode(cf, key, &value).map(Some),
            None => Ok(None),
        }
    }

    /// Decodes every value in `cf`, failing on the first undecodable entry.
    pub fn iterate<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Vec<u8>, T)>> {
        let handle = self.handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            out.push((key.to_vec(), Self::decode(cf, &key, &value)?));
        }
        Ok(out)
    }

    /// Queues a write into `batch`; nothing is visible until `write_batch`.
    pub fn batch_put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &T,
        compress: bool,
    ) -> Result<()> {
        let data = Self::encode(cf, key, value, compress)?;
        batch.put_cf(self.handle(cf)?, key, data);
        Ok(())
    }

    pub fn batch_delete(&self, batch: &mut WriteBatch, cf: &str, key: &[u8]) -> Result<()> {
        batch.delete_cf(self.handle(cf)?, key);
        Ok(())
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    /// Force flush all memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        if let Err(e) = self.db.flush_wal(true) {
            tracing::warn!("WAL flush failed (non-critical): {e}");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }

    pub fn count(&self, cf: &str) -> Result<u64> {
        let handle = self.handle(cf)?;
        Ok(self.db.iterator_cf(handle, rocksdb::IteratorMode::Start).count() as u64)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            descriptor_count: self.count("descriptor")?,
            wallet_tx_count: self.count("wallet_tx")?,
            block_count: self.count("block")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub descriptor_count: u64,
    pub wallet_tx_count: u64,
    pub block_count: u64,
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    Store::open(&cfg.path).map(Arc::new).map_err(|e| {
        tracing::error!("wallet database failed to open at '{}': {e:#}", cfg.path);
        tracing::error!("if a previous process crashed, check for a stale lock: {}/LOCK", cfg.path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn compressed_and_plain_values_read_back() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().to_str().unwrap()).unwrap();
        let mut batch = WriteBatch::default();
        store.batch_put(&mut batch, "wallet_tx", b"a", &vec![7u64; 64], true).unwrap();
        store.batch_put(&mut batch, "cursor", b"b", &42u64, false).unwrap();
        // nothing visible before commit
        assert!(store.get::<u64>("cursor", b"b").unwrap().is_none());
        store.write_batch(batch).unwrap();
        assert_eq!(store.get::<Vec<u64>>("wallet_tx", b"a").unwrap(), Some(vec![7u64; 64]));
        assert_eq!(store.get::<u64>("cursor", b"b").unwrap(), Some(42));
        assert_eq!(store.count("wallet_tx").unwrap(), 1);
    }

    #[test]
    fn undecodable_values_are_errors() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().to_str().unwrap()).unwrap();
        let cf = store.db.cf_handle("descriptor").unwrap();
        store.db.put_cf(cf, b"x", [0xffu8]).unwrap();
        assert!(store.get::<(u64, u64)>("descriptor", b"x").is_err());
        assert!(store.iterate::<(u64, u64)>("descriptor").is_err());
        assert!(store.get::<u64>("no_such_cf", b"x").is_err());
    }
}
