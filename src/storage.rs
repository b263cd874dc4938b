//! RocksDB storage layer for snapshots and payment records

use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct OptimizedStorage {
    db: Arc<DB>,
}

impl OptimizedStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rocksdb::Error> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(16 * 1024 * 1024); // snapshots are small but frequent
        opts.set_max_write_buffer_number(2);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Remove every file under `path` before opening (testing only!)
    pub fn destroy<P: AsRef<Path>>(path: P) -> Result<(), rocksdb::Error> {
        DB::destroy(&Options::default(), path)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        self.db.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), rocksdb::Error> {
        self.db.put(key, value)
    }

    /// All key/value pairs whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, rocksdb::Error> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = OptimizedStorage::new(dir.path()).expect("open");

        storage.put(b"registry:snapshot", b"{}").expect("put");
        assert_eq!(storage.get(b"registry:snapshot").expect("get"), Some(b"{}".to_vec()));

        storage.put(b"registry:snapshot", b"{\"v\":2}").expect("overwrite");
        assert_eq!(storage.get(b"registry:snapshot").expect("get"), Some(b"{\"v\":2}".to_vec()));
        assert_eq!(storage.get(b"payment:missing").expect("get"), None);
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = OptimizedStorage::new(dir.path()).expect("open");

        storage.put(b"payment:b", b"2").expect("put");
        storage.put(b"payment:a", b"1").expect("put");
        storage.put(b"registry:snapshot", b"3").expect("put");

        let payments = storage.scan_prefix(b"payment:").expect("scan");
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].0, b"payment:a".to_vec());
    }
}
