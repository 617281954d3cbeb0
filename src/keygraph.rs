//! The key-access graph (C5): a specialization of the graph store (C4),
//! graph name `"keys"`, where an edge means "parent may decrypt child".
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CachedStub;
use crate::crypto::{Key, KeyKind};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::graph::Graph;

const GRAPH_NAME: &str = "keys";

/// What C5 persists to recognize a key again: never the secret itself, only
/// what's needed to detect a caller passing the wrong key for an id (a
/// sym-key hash, or an RSA public-key DER).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct KeyNode {
    id: String,
    fingerprint: Vec<u8>,
}

pub struct KeyGraph {
    stub: Arc<CachedStub>,
    graph: Graph,
}

impl KeyGraph {
    pub fn new(stub: Arc<CachedStub>) -> Self {
        Self {
            graph: Graph::new(stub.clone(), GRAPH_NAME),
            stub,
        }
    }

    fn node_key(&self, id: &str) -> String {
        self.stub.composite_key("key_node", &[id])
    }

    fn load_node(&self, id: &str) -> Result<Option<KeyNode>> {
        match self.stub.get_state(&self.node_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_node(&self, node: &KeyNode) -> Result<()> {
        self.stub.put_state(&self.node_key(&node.id), serde_json::to_vec(node)?);
        Ok(())
    }

    /// Verifies `key` against any existing node for its id, creating the
    /// node if absent. Returns whether the node already existed.
    fn verify_or_create_node(&self, key: &Key) -> Result<bool> {
        let fingerprint = key.public_identity()?;
        match self.load_node(&key.id)? {
            Some(existing) => {
                if existing.fingerprint != fingerprint {
                    return Err(Error::InvalidKey { id: key.id.clone() });
                }
                Ok(true)
            }
            None => {
                self.save_node(&KeyNode {
                    id: key.id.clone(),
                    fingerprint,
                })?;
                Ok(false)
            }
        }
    }

    /// Grants `parent` the ability to decrypt `child`.
    pub fn add_access(
        &self,
        parent: &Key,
        child: &Key,
        edge_meta: Option<HashMap<String, String>>,
    ) -> Result<()> {
        if child.kind == KeyKind::PublicRSA {
            return Err(Error::InvalidInput(
                "a public key may never be a child in the access graph".into(),
            ));
        }

        let parent_existed = self.verify_or_create_node(parent)?;
        let child_existed = self.verify_or_create_node(child)?;

        let mut metadata = edge_meta.unwrap_or_default();
        let access_type = metadata
            .get("access_type")
            .cloned()
            .unwrap_or_else(|| "read".to_string());
        let access_type = if access_type == "read_only" {
            "read".to_string()
        } else {
            access_type
        };
        metadata.insert("access_type".to_string(), access_type);

        if parent_existed && child_existed {
            if let Some(existing) = self.graph.get_edge(&parent.id, &child.id)? {
                if existing.metadata == metadata {
                    tracing::info!(parent = %parent.id, child = %child.id, "AddAccess idempotent");
                    return Ok(());
                }
            }
        }

        let wrapped = parent.wrap(&child.bytes)?;
        self.graph.put_edge(&parent.id, &child.id, wrapped, metadata)?;
        tracing::info!(parent = %parent.id, child = %child.id, "AddAccess");
        Ok(())
    }

    /// The fingerprint recorded for `id`, if any node has been created yet.
    pub fn node_fingerprint(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.load_node(id)?.map(|n| n.fingerprint))
    }

    /// Reifies `key` as a `KeyNode` if absent, verifying it against any
    /// existing node otherwise. Used to register a node with no edge yet,
    /// e.g. a user's `pub-priv-<id>` identity, which a private key is
    /// represented *by* (§3) rather than wrapped under.
    pub fn ensure_node(&self, key: &Key) -> Result<()> {
        self.verify_or_create_node(key)?;
        Ok(())
    }

    /// Direct parents of `id` in the access graph, as `(parent_id, edge)`.
    /// Used by the asset manager (C7) to find every edge into an asset key
    /// when deleting it.
    pub fn graph_parents(&self, id: &str) -> Result<Vec<(String, crate::graph::EdgeRecord)>> {
        self.graph.direct_parents(id)
    }

    pub fn revoke_access(&self, parent_id: &str, child_id: &str) {
        self.graph.delete_edge(parent_id, child_id);
        tracing::warn!(parent = %parent_id, child = %child_id, "RevokeAccess");
    }

    /// Decrypts along `path`, starting from `start_key_bytes` (the secret
    /// behind `path[0]`). A single-element path returns `start_key_bytes`
    /// unchanged; consecutive duplicate ids are collapsed.
    pub fn get_key(&self, path: &[String], start_key_bytes: Vec<u8>) -> Result<Vec<u8>> {
        let path = dedupe_adjacent(path);
        let start_id = path
            .first()
            .ok_or_else(|| Error::InvalidInput("key path must not be empty".into()))?;

        if path.len() == 1 {
            return Ok(start_key_bytes);
        }

        if !self.graph.has_path(&path)? {
            return Err(Error::PermissionDenied(format!(
                "no access path from {start_id} to {}",
                path.last().unwrap()
            )));
        }

        let start_node = self
            .load_node(start_id)?
            .ok_or_else(|| Error::NotFound(format!("key node {start_id}")))?;
        let start_key = Key::new(start_id.clone(), start_key_bytes)?;
        if start_key.public_identity()? != start_node.fingerprint {
            return Err(Error::InvalidKey {
                id: start_id.clone(),
            });
        }

        let mut current_id = start_key.id.clone();
        let mut current_bytes = start_key.bytes;
        for next_id in &path[1..] {
            let edge = self
                .graph
                .get_edge(&current_id, next_id)?
                .ok_or_else(|| Error::PermissionDenied(format!("no edge {current_id} -> {next_id}")))?;
            let current_key = Key::new(current_id.clone(), current_bytes)?;
            current_bytes = current_key.unwrap(&edge.payload)?;
            current_id = next_id.clone();
            self.stub
                .put_cache(&format!("keygraph:key:{current_id}"), Arc::new(current_bytes.clone()));
        }
        Ok(current_bytes)
    }

    pub fn slow_verify_access(&self, src: &str, dst: &str, filter: Option<&Filter>) -> Result<bool> {
        Ok(self.graph.find_path(src, dst, filter)?.is_some())
    }

    pub fn get_owner_keys(&self, dst: &str, filter: Option<&Filter>) -> Result<std::collections::HashSet<String>> {
        self.graph.ancestor_set(dst, filter)
    }

    pub fn get_user_keys(&self, user_pub_priv_id: &str, filter: Option<&Filter>) -> Result<std::collections::HashSet<String>> {
        self.graph.reachable_set(user_pub_priv_id, filter)
    }
}

fn dedupe_adjacent(path: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(path.len());
    for id in path {
        if out.last() != Some(id) {
            out.push(id.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn stub() -> Arc<CachedStub> {
        Arc::new(CachedStub::new(Arc::new(MemoryLedger::new())))
    }

    #[test]
    fn add_access_then_get_key_round_trip() {
        let kg = KeyGraph::new(stub());
        let parent = Key::generate_symmetric("sym-owner");
        let child = Key::generate_symmetric("sym-asset");
        kg.add_access(&parent, &child, None).unwrap();

        let path = vec![parent.id.clone(), child.id.clone()];
        let unwrapped = kg.get_key(&path, parent.bytes.clone()).unwrap();
        assert_eq!(unwrapped, child.bytes);
    }

    #[test]
    fn add_access_rejects_public_rsa_child() {
        let kg = KeyGraph::new(stub());
        let parent = Key::generate_symmetric("sym-owner");
        let (public, _private) = Key::generate_rsa_keypair("pub-priv-user").unwrap();
        let result = kg.add_access(&parent, &public, None);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn add_access_is_idempotent() {
        let kg = KeyGraph::new(stub());
        let parent = Key::generate_symmetric("sym-owner");
        let child = Key::generate_symmetric("sym-asset");
        kg.add_access(&parent, &child, None).unwrap();
        kg.add_access(&parent, &child, None).unwrap();
    }

    #[test]
    fn add_access_rejects_mismatched_existing_key() {
        let kg = KeyGraph::new(stub());
        let parent = Key::generate_symmetric("sym-owner");
        let child = Key::generate_symmetric("sym-asset");
        kg.add_access(&parent, &child, None).unwrap();

        let other_parent = Key::generate_symmetric("sym-owner");
        let result = kg.add_access(&other_parent, &child, None);
        assert!(matches!(result, Err(Error::InvalidKey { .. })));
    }

    #[test]
    fn revoke_access_breaks_path() {
        let kg = KeyGraph::new(stub());
        let parent = Key::generate_symmetric("sym-owner");
        let child = Key::generate_symmetric("sym-asset");
        kg.add_access(&parent, &child, None).unwrap();
        assert!(kg.slow_verify_access(&parent.id, &child.id, None).unwrap());
        kg.revoke_access(&parent.id, &child.id);
        assert!(!kg.slow_verify_access(&parent.id, &child.id, None).unwrap());
    }

    #[test]
    fn read_only_normalizes_to_read() {
        let kg = KeyGraph::new(stub());
        let parent = Key::generate_symmetric("sym-owner");
        let child = Key::generate_symmetric("sym-asset");
        let mut meta = HashMap::new();
        meta.insert("access_type".to_string(), "read_only".to_string());
        kg.add_access(&parent, &child, Some(meta)).unwrap();
        let edge = kg.graph.get_edge(&parent.id, &child.id).unwrap().unwrap();
        assert_eq!(edge.metadata.get("access_type").map(String::as_str), Some("read"));
    }

    #[test]
    fn get_key_single_element_path_is_identity() {
        let kg = KeyGraph::new(stub());
        let k = Key::generate_symmetric("sym-solo");
        kg.verify_or_create_node(&k).unwrap();
        let got = kg.get_key(&[k.id.clone()], k.bytes.clone()).unwrap();
        assert_eq!(got, k.bytes);
    }
}
