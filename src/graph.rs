//! The directed multigraph store (C4): composite-key forward/reverse edges
//! over a [`CachedStub`], with BFS reachability/path search pluggable with
//! the filter DSL.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CachedStub;
use crate::error::Result;
use crate::filter::Filter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeRecord {
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// One named directed multigraph, backed by a [`CachedStub`].
pub struct Graph {
    stub: Arc<CachedStub>,
    name: String,
}

impl Graph {
    pub fn new(stub: Arc<CachedStub>, name: impl Into<String>) -> Self {
        Self {
            stub,
            name: name.into(),
        }
    }

    fn forward_ns(&self) -> String {
        format!("graph:{}", self.name)
    }

    fn reverse_ns(&self) -> String {
        format!("rgraph:{}", self.name)
    }

    /// Insert or replace. Always writes both the forward and reverse edge.
    pub fn put_edge(
        &self,
        parent: &str,
        child: &str,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let record = EdgeRecord { payload, metadata };
        let bytes = serde_json::to_vec(&record)?;
        self.stub
            .put_state(&self.stub.composite_key(&self.forward_ns(), &[parent, child]), bytes.clone());
        self.stub
            .put_state(&self.stub.composite_key(&self.reverse_ns(), &[child, parent]), bytes);
        Ok(())
    }

    pub fn delete_edge(&self, parent: &str, child: &str) {
        self.stub
            .del_state(&self.stub.composite_key(&self.forward_ns(), &[parent, child]));
        self.stub
            .del_state(&self.stub.composite_key(&self.reverse_ns(), &[child, parent]));
    }

    pub fn get_edge(&self, parent: &str, child: &str) -> Result<Option<EdgeRecord>> {
        match self
            .stub
            .get_state(&self.stub.composite_key(&self.forward_ns(), &[parent, child]))?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Children of `parent`, ascending by child id.
    pub fn direct_children(&self, parent: &str) -> Result<Vec<(String, EdgeRecord)>> {
        self.neighbors(&self.forward_ns(), parent)
    }

    /// Parents of `child`, ascending by parent id.
    pub fn direct_parents(&self, child: &str) -> Result<Vec<(String, EdgeRecord)>> {
        self.neighbors(&self.reverse_ns(), child)
    }

    fn neighbors(&self, namespace: &str, node: &str) -> Result<Vec<(String, EdgeRecord)>> {
        let rows = self.stub.partial_composite_range(namespace, &[node])?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let other_id = last_composite_part(&key);
            out.push((other_id, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    /// `true` iff every consecutive pair in `nodes` has a forward edge.
    /// Cached per transaction under the concatenated path.
    pub fn has_path(&self, nodes: &[String]) -> Result<bool> {
        let cache_key = format!("has_path:{}:{}", self.name, nodes.join("\u{0}"));
        if let Some(cached) = self.stub.get_cache(&cache_key) {
            if let Some(b) = cached.downcast_ref::<bool>() {
                return Ok(*b);
            }
        }
        let mut ok = true;
        for pair in nodes.windows(2) {
            if self.get_edge(&pair[0], &pair[1])?.is_none() {
                ok = false;
                break;
            }
        }
        self.stub.put_cache(&cache_key, Arc::new(ok));
        Ok(ok)
    }

    /// BFS shortest path from `src` to `dst` over forward edges, skipping any
    /// edge whose metadata matches `filter`. Ties among children are broken
    /// by ascending id.
    pub fn find_path(
        &self,
        src: &str,
        dst: &str,
        filter: Option<&Filter>,
    ) -> Result<Option<Vec<String>>> {
        if src == dst {
            return Ok(Some(vec![src.to_string()]));
        }
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(src.to_string());
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(src.to_string());
        let mut came_from: HashMap<String, String> = HashMap::new();

        while let Some(cur) = queue.pop_front() {
            let mut children = self.direct_children(&cur)?;
            children.sort_by(|a, b| a.0.cmp(&b.0));
            for (child, edge) in children {
                if visited.contains(&child) {
                    continue;
                }
                if edge_expired(&edge.metadata) {
                    continue;
                }
                if let Some(f) = filter {
                    if f.evaluate(&metadata_as_values(&edge.metadata))? {
                        continue;
                    }
                }
                visited.insert(child.clone());
                came_from.insert(child.clone(), cur.clone());
                if child == dst {
                    return Ok(Some(reconstruct(&came_from, src, &child)));
                }
                queue.push_back(child);
            }
        }
        Ok(None)
    }

    /// Nodes reachable from `src` via forward edges, excluding `src`.
    pub fn reachable_set(&self, src: &str, filter: Option<&Filter>) -> Result<HashSet<String>> {
        self.bfs_set(src, filter, true)
    }

    /// Nodes that can reach `dst` via forward edges, excluding `dst`.
    pub fn ancestor_set(&self, dst: &str, filter: Option<&Filter>) -> Result<HashSet<String>> {
        self.bfs_set(dst, filter, false)
    }

    fn bfs_set(&self, start: &str, filter: Option<&Filter>, forward: bool) -> Result<HashSet<String>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(start.to_string());
        while let Some(cur) = queue.pop_front() {
            let neighbors = if forward {
                self.direct_children(&cur)?
            } else {
                self.direct_parents(&cur)?
            };
            for (other, edge) in neighbors {
                if visited.contains(&other) || other == start {
                    continue;
                }
                if edge_expired(&edge.metadata) {
                    continue;
                }
                if let Some(f) = filter {
                    if f.evaluate(&metadata_as_values(&edge.metadata))? {
                        continue;
                    }
                }
                visited.insert(other.clone());
                queue.push_back(other);
            }
        }
        Ok(visited)
    }
}

/// A consent edge moves `Valid -> Expired` the moment its `expiration`
/// (Unix seconds, §6) is at or before now; this is observed at read time
/// rather than written back, per the state machine in §4.8.
fn edge_expired(metadata: &HashMap<String, String>) -> bool {
    match metadata.get("expiration") {
        Some(s) => match s.parse::<i64>() {
            Ok(exp) => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_secs() as i64;
                exp <= now
            }
            Err(_) => false,
        },
        None => false,
    }
}

fn metadata_as_values(metadata: &HashMap<String, String>) -> HashMap<String, Value> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

fn last_composite_part(key: &str) -> String {
    key.rsplit('\u{0}').next().unwrap_or(key).to_string()
}

fn reconstruct(came_from: &HashMap<String, String>, src: &str, dst: &str) -> Vec<String> {
    let mut path = vec![dst.to_string()];
    let mut cur = dst.to_string();
    while cur != src {
        let prev = came_from.get(&cur).expect("bfs predecessor chain is complete");
        path.push(prev.clone());
        cur = prev.clone();
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use serde_json::json;

    fn graph() -> Graph {
        Graph::new(
            Arc::new(CachedStub::new(Arc::new(MemoryLedger::new()))),
            "g",
        )
    }

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let g = graph();
        g.put_edge("a", "b", vec![1, 2, 3], meta(&[("access_type", "read")])).unwrap();
        let edge = g.get_edge("a", "b").unwrap().unwrap();
        assert_eq!(edge.payload, vec![1, 2, 3]);
        assert_eq!(g.direct_parents("b").unwrap()[0].0, "a");
        g.delete_edge("a", "b");
        assert!(g.get_edge("a", "b").unwrap().is_none());
        assert!(g.direct_children("a").unwrap().is_empty());
    }

    #[test]
    fn find_path_across_two_hops() {
        let g = graph();
        g.put_edge("a", "b", vec![], HashMap::new()).unwrap();
        g.put_edge("b", "c", vec![], HashMap::new()).unwrap();
        let path = g.find_path("a", "c", None).unwrap().unwrap();
        assert_eq!(path, vec!["a", "b", "c"]);
    }

    #[test]
    fn find_path_skips_filtered_edge() {
        let g = graph();
        g.put_edge("a", "b", vec![], meta(&[("access_type", "write_only")])).unwrap();
        g.put_edge("a", "c", vec![], meta(&[("access_type", "read")])).unwrap();
        g.put_edge("c", "d", vec![], HashMap::new()).unwrap();
        g.put_edge("b", "d", vec![], HashMap::new()).unwrap();
        let filter = Filter::compile(&json!({"==": [{"var": "access_type"}, "write_only"]})).unwrap();
        let path = g.find_path("a", "d", Some(&filter)).unwrap().unwrap();
        assert_eq!(path, vec!["a", "c", "d"]);
    }

    #[test]
    fn find_path_none_when_unreachable() {
        let g = graph();
        g.put_edge("a", "b", vec![], HashMap::new()).unwrap();
        assert!(g.find_path("a", "z", None).unwrap().is_none());
    }

    #[test]
    fn reachable_and_ancestor_sets() {
        let g = graph();
        g.put_edge("a", "b", vec![], HashMap::new()).unwrap();
        g.put_edge("a", "c", vec![], HashMap::new()).unwrap();
        g.put_edge("b", "d", vec![], HashMap::new()).unwrap();
        let reach = g.reachable_set("a", None).unwrap();
        assert_eq!(reach, ["b", "c", "d"].iter().map(|s| s.to_string()).collect());
        let ancestors = g.ancestor_set("d", None).unwrap();
        assert_eq!(ancestors, ["a", "b"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn find_path_skips_expired_edge() {
        let g = graph();
        g.put_edge("a", "b", vec![], meta(&[("expiration", "1")])).unwrap();
        g.put_edge("a", "c", vec![], HashMap::new()).unwrap();
        g.put_edge("c", "b", vec![], HashMap::new()).unwrap();
        let path = g.find_path("a", "b", None).unwrap().unwrap();
        assert_eq!(path, vec!["a", "c", "b"]);
    }

    #[test]
    fn has_path_true_and_false() {
        let g = graph();
        g.put_edge("a", "b", vec![], HashMap::new()).unwrap();
        g.put_edge("b", "c", vec![], HashMap::new()).unwrap();
        assert!(g
            .has_path(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap());
        assert!(!g
            .has_path(&["a".to_string(), "c".to_string()])
            .unwrap());
    }
}
