//! The off-chain blob store boundary (C7): a trait any external document
//! store implements, plus a `MemoryOffchainStore` reference implementation
//! and the process-wide registry of configured stores.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use crate::crypto::hash;
use crate::error::{Error, Result};

/// A datastore connection descriptor (§6 "Configuration"): `connect_str` is
/// a URL-encoded key/value map; `username`/`password`/`database`/`host`
/// are the only options this layer interprets, everything else in
/// `connect_str` is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreConfig {
    pub id: String,
    pub kind: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub host: Option<String>,
}

impl DatastoreConfig {
    /// Parses `connect_str` as `key=value` pairs separated by `&`, with
    /// percent-decoding of both halves.
    pub fn parse(id: impl Into<String>, kind: impl Into<String>, connect_str: &str) -> Result<Self> {
        let mut cfg = DatastoreConfig {
            id: id.into(),
            kind: kind.into(),
            username: None,
            password: None,
            database: None,
            host: None,
        };
        if connect_str.is_empty() {
            return Ok(cfg);
        }
        for pair in connect_str.split('&') {
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidInput(format!("malformed connect_str segment {pair:?}"))
            })?;
            let key = percent_decode(k)?;
            let value = percent_decode(v)?;
            match key.as_str() {
                "username" => cfg.username = Some(value),
                "password" => cfg.password = Some(value),
                "database" => cfg.database = Some(value),
                "host" => cfg.host = Some(value),
                _ => {}
            }
        }
        Ok(cfg)
    }
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::InvalidInput("truncated percent-escape".into()))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::InvalidInput(format!("invalid percent-escape %{hex}")))?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::InvalidInput("connect_str is not valid UTF-8".into()))
}

/// An external content-addressed blob store. `put` returns `compute_hash`
/// of what was stored; `get` re-verifies that invariant on the way out.
pub trait OffchainStore: Send + Sync {
    fn is_ready(&self) -> bool;
    fn get_connection(&self) -> &str;
    fn put(&self, blob: &[u8]) -> Result<String>;
    fn get(&self, data_key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, data_key: &str) -> Result<()>;
    fn compute_hash(&self, blob: &[u8]) -> String;
}

/// Puts `blob`, retrying once after 500ms if the store reports HTTP 429.
/// This is the only retry in the crate (§4.9).
pub fn put_with_retry(store: &dyn OffchainStore, blob: &[u8]) -> Result<String> {
    match store.put(blob) {
        Err(Error::StorageError(msg)) if msg.contains("429") => {
            std::thread::sleep(Duration::from_millis(500));
            store.put(blob)
        }
        other => other,
    }
}

/// In-memory reference [`OffchainStore`], for tests and embedding without a
/// concrete document database.
pub struct MemoryOffchainStore {
    connection: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryOffchainStore {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

impl OffchainStore for MemoryOffchainStore {
    fn is_ready(&self) -> bool {
        true
    }

    fn get_connection(&self) -> &str {
        &self.connection
    }

    fn put(&self, blob: &[u8]) -> Result<String> {
        let key = self.compute_hash(blob);
        self.blobs.lock().unwrap().insert(key.clone(), blob.to_vec());
        Ok(key)
    }

    fn get(&self, data_key: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap();
        match blobs.get(data_key) {
            None => Ok(None),
            Some(blob) => {
                if self.compute_hash(blob) != data_key {
                    return Err(Error::IntegrityError(format!(
                        "off-chain blob {data_key} failed hash verification on read"
                    )));
                }
                Ok(Some(blob.clone()))
            }
        }
    }

    fn delete(&self, data_key: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(data_key);
        Ok(())
    }

    fn compute_hash(&self, blob: &[u8]) -> String {
        hex::encode(hash(blob))
    }
}

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn OffchainStore>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn OffchainStore>>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers `store` under `kind`, for process-wide lookup. Meant to be
/// called once during process init; later calls replace the prior entry.
pub fn register_offchain_store(kind: impl Into<String>, store: Arc<dyn OffchainStore>) {
    registry().write().unwrap().insert(kind.into(), store);
}

pub fn get_offchain_store(kind: &str) -> Option<Arc<dyn OffchainStore>> {
    registry().read().unwrap().get(kind).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let store = MemoryOffchainStore::new("mem://test");
        let key = store.put(b"hello").unwrap();
        assert_eq!(key, store.compute_hash(b"hello"));
        assert_eq!(store.get(&key).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn get_missing_is_none() {
        let store = MemoryOffchainStore::new("mem://test");
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn delete_then_get_is_none() {
        let store = MemoryOffchainStore::new("mem://test");
        let key = store.put(b"x").unwrap();
        store.delete(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn datastore_config_parses_recognized_options() {
        let cfg = DatastoreConfig::parse("ds-1", "couchdb", "username=alice&password=p%40ss&host=db.local&extra=ignored").unwrap();
        assert_eq!(cfg.username.as_deref(), Some("alice"));
        assert_eq!(cfg.password.as_deref(), Some("p@ss"));
        assert_eq!(cfg.host.as_deref(), Some("db.local"));
        assert_eq!(cfg.database, None);
    }

    #[test]
    fn datastore_config_empty_connect_str_is_all_none() {
        let cfg = DatastoreConfig::parse("ds-2", "couchdb", "").unwrap();
        assert_eq!(cfg.username, None);
        assert_eq!(cfg.host, None);
    }

    #[test]
    fn datastore_config_rejects_malformed_pair() {
        assert!(DatastoreConfig::parse("ds-3", "couchdb", "username").is_err());
    }

    #[test]
    fn registry_register_and_fetch() {
        register_offchain_store("memory-test-kind", Arc::new(MemoryOffchainStore::new("mem://a")));
        let store = get_offchain_store("memory-test-kind").unwrap();
        assert!(store.is_ready());
        assert!(get_offchain_store("nonexistent-kind").is_none());
    }
}
