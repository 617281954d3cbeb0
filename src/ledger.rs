//! The underlying transactional ordered key-value contract (§4.1's "ledger").
//!
//! This is deliberately a narrow trait: point get/put/del, range scan, and
//! composite-key construction. A real deployment plugs in an actual
//! chaincode stub; this crate ships [`MemoryLedger`] as the reference
//! implementation used throughout the test suite.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Sentinel appended to a composite-key prefix to build an exclusive upper
/// bound for a partial-composite range scan (§6).
pub const RANGE_END_SENTINEL: char = '\u{10FFFF}';
const NS_SEP: char = '\u{0000}';

/// Builds the composite-key encoding from §6:
/// `U+0000 || namespace || U+0000 || part_1 || U+0000 || ...`.
pub fn composite_key(namespace: &str, parts: &[&str]) -> String {
    let mut s = String::new();
    s.push(NS_SEP);
    s.push_str(namespace);
    for part in parts {
        s.push(NS_SEP);
        s.push_str(part);
    }
    s
}

/// The underlying transactional ordered key-value store.
///
/// Implementors need not be transactional themselves from this trait's point
/// of view: the cache in front of it (C2) is what buffers mutations for the
/// duration of one transaction and flushes them at the end.
pub trait Ledger: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    /// Ascending, `[start, end)`.
    fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory reference [`Ledger`], backed by a `BTreeMap` for natural
/// lexicographic ordering.
#[derive(Default, Clone)]
pub struct MemoryLedger {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .range(start.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_shape() {
        let k = composite_key("graph:keys", &["a", "b"]);
        assert_eq!(k, "\u{0}graph:keys\u{0}a\u{0}b");
    }

    #[test]
    fn memory_ledger_range_is_ascending() {
        let ledger = MemoryLedger::new();
        ledger.put("b", b"2".to_vec()).unwrap();
        ledger.put("a", b"1".to_vec()).unwrap();
        ledger.put("c", b"3".to_vec()).unwrap();
        let got = ledger.range("a", "c").unwrap();
        assert_eq!(
            got,
            vec![("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())]
        );
    }
}
