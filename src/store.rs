//! The top-level transaction handle: wires the cached stub (C2), key-access
//! graph (C5), datatype tree (C6), and asset manager (C7) together over one
//! [`Ledger`]. Callers enter a transaction through C2, invoke C7
//! operations, which go through C5/C6, and C2 gathers all mutations so the
//! underlying ledger commits atomically on transaction end.
use std::sync::Arc;

use crate::asset::AssetManager;
use crate::cache::CachedStub;
use crate::datatype::DatatypeTree;
use crate::error::Result;
use crate::keygraph::KeyGraph;
use crate::ledger::Ledger;
use crate::rbt::RbTree;

/// One transaction's view over a ledger. Not `Sync`: a transaction is
/// single-threaded by construction (§5).
pub struct Transaction {
    stub: Arc<CachedStub>,
    pub keys: Arc<KeyGraph>,
    pub datatypes: Arc<DatatypeTree>,
    pub assets: AssetManager,
}

impl Transaction {
    /// Opens a fresh transaction over `ledger`. The cache starts empty;
    /// nothing is read until the first `get_state`/`range_scan`.
    pub fn open(ledger: Arc<dyn Ledger>) -> Result<Self> {
        let stub = Arc::new(CachedStub::new(ledger));
        let keys = Arc::new(KeyGraph::new(stub.clone()));
        let datatypes = Arc::new(DatatypeTree::new(stub.clone())?);
        let assets = AssetManager::new(stub.clone(), keys.clone(), datatypes.clone());
        Ok(Self {
            stub,
            keys,
            datatypes,
            assets,
        })
    }

    /// An ordered index table (C3) scoped to this transaction's cache.
    pub fn table(&self, name: impl Into<String>) -> RbTree {
        RbTree::new(self.stub.clone(), name)
    }

    /// The per-transaction cache, for callers that need raw `get_state` /
    /// `range_scan` access alongside the higher-level components.
    pub fn cache(&self) -> &Arc<CachedStub> {
        &self.stub
    }

    /// Flushes every dirty/deleted entry to the underlying ledger. There is
    /// no rollback API (§4.1): dropping the `Transaction` without calling
    /// `commit` simply discards the cache.
    pub fn commit(&self) -> Result<()> {
        self.stub.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::ids;
    use crate::ledger::MemoryLedger;

    #[test]
    fn open_commit_persists_through_a_new_transaction() {
        crate::test_support::init_tracing();
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());

        let tx1 = Transaction::open(ledger.clone()).unwrap();
        let public = Key::generate_rsa_keypair(ids::pub_priv_id("alice")).unwrap().0;
        tx1.assets.register_user("alice", &public, None, None).unwrap();
        tx1.commit().unwrap();

        let tx2 = Transaction::open(ledger).unwrap();
        let asset_id = ids::asset_id(crate::asset::USER_NAMESPACE, "alice");
        assert!(tx2.assets.get_asset(&asset_id, None).unwrap().is_some());
    }

    #[test]
    fn wrap_chain_end_to_end() {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
        let tx = Transaction::open(ledger).unwrap();
        let k1 = Key::generate_symmetric("sym-k1");
        let k2 = Key::generate_symmetric("sym-k2");
        let k3 = Key::generate_symmetric("sym-k3");
        tx.keys.add_access(&k1, &k2, None).unwrap();
        tx.keys.add_access(&k2, &k3, None).unwrap();

        let path = vec![k1.id.clone(), k2.id.clone(), k3.id.clone()];
        let got = tx.keys.get_key(&path, k1.bytes.clone()).unwrap();
        assert_eq!(got, k3.bytes);

        tx.keys.revoke_access(&k2.id, &k3.id);
        assert!(tx.keys.get_key(&path, k1.bytes.clone()).is_err());
    }
}
