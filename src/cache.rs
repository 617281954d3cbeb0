//! The cached transactional stub (C2): a per-transaction overlay over a
//! [`Ledger`] with read-your-writes and range-scan fusion.
//!
//! An in-memory working copy mediates every read/write and is flushed back
//! to durable storage on commit, the way a `RadixDb`/`BlobMap` pair would.
//! The backing structure here is a flat cache over the ledger's own key
//! space rather than an in-memory radix tree, since the ledger itself is
//! the ordered store (see C3 for the tree built *on top* of this cache).
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::ledger::{composite_key, Ledger, RANGE_END_SENTINEL};

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    dirty: bool,
    deleted: bool,
}

/// Per-transaction overlay over a [`Ledger`].
///
/// Not `Sync` by design: a transaction is single-threaded (§5), so the cache
/// uses plain `RefCell`s rather than locks.
pub struct CachedStub {
    ledger: Arc<dyn Ledger>,
    cache: RefCell<BTreeMap<String, CacheEntry>>,
    objects: RefCell<HashMap<String, Arc<dyn Any>>>,
}

impl CachedStub {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            cache: RefCell::new(BTreeMap::new()),
            objects: RefCell::new(HashMap::new()),
        }
    }

    /// In-transaction view of `key`: cached value if present, otherwise
    /// fetched from the ledger and cached.
    pub fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.cache.borrow().get(key) {
            return Ok(if entry.deleted {
                None
            } else {
                Some(entry.value.clone())
            });
        }
        let value = self.ledger.get(key)?;
        let deleted = value.is_none();
        self.cache.borrow_mut().insert(
            key.to_string(),
            CacheEntry {
                value: value.clone().unwrap_or_default(),
                dirty: false,
                deleted,
            },
        );
        Ok(value)
    }

    pub fn put_state(&self, key: &str, value: Vec<u8>) {
        self.cache.borrow_mut().insert(
            key.to_string(),
            CacheEntry {
                value,
                dirty: true,
                deleted: false,
            },
        );
    }

    pub fn del_state(&self, key: &str) {
        self.cache.borrow_mut().insert(
            key.to_string(),
            CacheEntry {
                value: Vec::new(),
                dirty: true,
                deleted: true,
            },
        );
    }

    /// Fuses the in-transaction cache with the underlying ledger for
    /// `[start, end)`, ascending, excluding deletes, observing prior writes
    /// of this transaction.
    pub fn range_scan(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let ledger_hits = self.ledger.range(start, end)?;
        let mut merged: BTreeMap<String, Vec<u8>> = ledger_hits.into_iter().collect();

        {
            let mut cache = self.cache.borrow_mut();
            for (key, value) in merged.iter() {
                cache.entry(key.clone()).or_insert_with(|| CacheEntry {
                    value: value.clone(),
                    dirty: false,
                    deleted: false,
                });
            }
            for (key, entry) in cache.range(start.to_string()..end.to_string()) {
                if entry.deleted {
                    merged.remove(key);
                } else if entry.dirty {
                    merged.insert(key.clone(), entry.value.clone());
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    /// `range_scan` over `[prefix, prefix || U+10FFFF)` for a composite key.
    pub fn partial_composite_range(
        &self,
        namespace: &str,
        prefix_parts: &[&str],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = composite_key(namespace, prefix_parts);
        let mut end = prefix.clone();
        end.push(RANGE_END_SENTINEL);
        self.range_scan(&prefix, &end)
    }

    pub fn composite_key(&self, namespace: &str, parts: &[&str]) -> String {
        composite_key(namespace, parts)
    }

    /// Free-form object cache, keyed by an opaque string. Values are stored
    /// by reference: mutating the `Any` behind the `Arc` (if the caller
    /// smuggles in interior mutability) is visible to every other holder.
    pub fn put_cache(&self, key: &str, value: Arc<dyn Any>) {
        self.objects.borrow_mut().insert(key.to_string(), value);
    }

    pub fn get_cache(&self, key: &str) -> Option<Arc<dyn Any>> {
        self.objects.borrow().get(key).cloned()
    }

    pub fn del_cache(&self, key: &str) {
        self.objects.borrow_mut().remove(key);
    }

    /// Flushes dirty/deleted entries to the underlying ledger: puts first,
    /// then deletes, so a put superseded by a later delete in the same
    /// transaction doesn't resurrect the key.
    pub fn flush(&self) -> Result<()> {
        let cache = self.cache.borrow();
        let mut puts = 0usize;
        let mut dels = 0usize;
        for (key, entry) in cache.iter() {
            if entry.dirty && !entry.deleted {
                self.ledger.put(key, entry.value.clone())?;
                puts += 1;
            }
        }
        for (key, entry) in cache.iter() {
            if entry.dirty && entry.deleted {
                self.ledger.del(key)?;
                dels += 1;
            }
        }
        tracing::debug!(puts, dels, "flush");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn stub() -> CachedStub {
        CachedStub::new(Arc::new(MemoryLedger::new()))
    }

    #[test]
    fn put_then_get() {
        let s = stub();
        s.put_state("a", b"1".to_vec());
        assert_eq!(s.get_state("a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn del_then_get_is_none() {
        let s = stub();
        s.put_state("a", b"1".to_vec());
        s.del_state("a");
        assert_eq!(s.get_state("a").unwrap(), None);
    }

    #[test]
    fn range_scan_empty_on_equal_bounds() {
        let s = stub();
        s.put_state("a", b"1".to_vec());
        assert_eq!(s.range_scan("a", "a").unwrap(), Vec::new());
    }

    #[test]
    fn range_scan_fuses_cache_and_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.put("b", b"ledger-b".to_vec()).unwrap();
        ledger.put("d", b"ledger-d".to_vec()).unwrap();
        let s = CachedStub::new(ledger);
        s.put_state("a", b"cache-a".to_vec());
        s.put_state("c", b"cache-c".to_vec());
        s.del_state("d");
        let got = s.range_scan("a", "e").unwrap();
        assert_eq!(
            got,
            vec![
                ("a".to_string(), b"cache-a".to_vec()),
                ("b".to_string(), b"ledger-b".to_vec()),
                ("c".to_string(), b"cache-c".to_vec()),
            ]
        );
    }

    #[test]
    fn flush_deletes_after_puts() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.put("a", b"old".to_vec()).unwrap();
        let s = CachedStub::new(ledger.clone());
        s.put_state("a", b"new".to_vec());
        s.del_state("a");
        s.flush().unwrap();
        assert_eq!(ledger.get("a").unwrap(), None);
    }

    #[test]
    fn partial_composite_range_scopes_to_prefix() {
        let s = stub();
        s.put_state(&composite_key("ns", &["a", "1"]), b"1".to_vec());
        s.put_state(&composite_key("ns", &["a", "2"]), b"2".to_vec());
        s.put_state(&composite_key("ns", &["b", "1"]), b"3".to_vec());
        let got = s.partial_composite_range("ns", &["a"]).unwrap();
        assert_eq!(got.len(), 2);
    }
}
