//! # An embedded, permissioned data-management layer
//!
//! This crate sits on top of a transactional ordered key-value store (a
//! "ledger") and provides the engineering that makes it usable as a
//! consent-driven asset store: a key-access graph that encodes who can
//! decrypt what, a hierarchical datatype tree that lets whole classes of
//! assets be consented at once, a transactional cache that turns narrow
//! point-lookup/range-scan ledger access into read-your-writes with fast
//! range iteration, and the cryptographic protocol that binds it together.
//!
//! ## Components, leaves first
//!
//! - [`crypto`] (C1): authenticated symmetric encryption, asymmetric wrap,
//!   hashing, key-kind discrimination.
//! - [`cache`] (C2): the per-transaction overlay over a [`ledger::Ledger`],
//!   write-back cache, range-scan fusion, and a free-form object cache.
//! - [`rbt`] (C3): an on-ledger red-black tree index, persisted node by
//!   node through C2.
//! - [`graph`] (C4): a directed multigraph of composite-key edges, with
//!   BFS reachability, path search, and a pluggable filter DSL ([`filter`]).
//! - [`keygraph`] (C5): the key-access graph, a specialization of C4 whose
//!   edges are wrapped keys; traversing an edge decrypts the child.
//! - [`datatype`] (C6): the datatype tree, activation state that cascades
//!   to descendants, plus per-`(datatype, owner)` symmetric keys wired into
//!   C5.
//! - [`asset`] (C7): the asset & user manager, persists assets, wires
//!   their keys into C5, and exposes the access checks of §4.7.
//!
//! Data flow: callers enter a transaction through [`store::Transaction`],
//! invoke C7 operations, which go through C5/C6 for key derivation and
//! C3/C4 for indexing and relations. The cache gathers all mutations and
//! the underlying ledger commits atomically on transaction end.
//!
//! ## What this crate does not do
//!
//! Chaincode bootstrapping, CLI/API glue, metering/telemetry emission, and
//! concrete off-chain blob-store backends beyond the
//! [`offchain::OffchainStore`] trait are external collaborators, not part
//! of this core.
#![warn(missing_docs)]

pub mod asset;
pub mod cache;
pub mod crypto;
pub mod datatype;
pub mod error;
pub mod filter;
pub mod graph;
pub mod ids;
pub mod keygraph;
pub mod ledger;
pub mod offchain;
pub mod rbt;
pub mod store;

pub use crate::asset::{Asset, AssetManager, NewAsset, PrivateData, PrivateInput};
pub use crate::cache::CachedStub;
pub use crate::crypto::{Key, KeyKind};
pub use crate::datatype::{Datatype, DatatypeTree};
pub use crate::error::{Error, Result};
pub use crate::filter::Filter;
pub use crate::graph::{EdgeRecord, Graph};
pub use crate::keygraph::KeyGraph;
pub use crate::ledger::{Ledger, MemoryLedger};
pub use crate::offchain::{DatastoreConfig, OffchainStore};
pub use crate::rbt::RbTree;
pub use crate::store::Transaction;

/// Test-only tracing setup, an `FmtSubscriber` wired to the test writer so
/// `tracing` output interleaves correctly with `cargo test` output capture.
#[cfg(test)]
pub(crate) mod test_support {
    pub fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "warn".to_owned());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(env))
            .with_test_writer()
            .try_init();
    }
}
