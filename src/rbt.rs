//! The on-ledger ordered index (C3): a red-black tree keyed by string,
//! persisted node-by-node through the [`CachedStub`] (C2).
//!
//! Insert/remove follow the textbook CLRS algorithm, reimplemented
//! iteratively per the design notes (deep call stacks tied to tree height are
//! avoided). Every node lives at its own ledger key, so a transaction that
//! touches many nodes flushes them all atomically along with everything
//! else C2 buffered.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CachedStub;
use crate::error::{Error, Result};
use crate::ledger::{composite_key, RANGE_END_SENTINEL};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    key: String,
    value: Vec<u8>,
    color: Color,
    parent: Option<String>,
    left: Option<String>,
    right: Option<String>,
}

/// A red-black tree index over one named table, backed by a [`CachedStub`].
pub struct RbTree {
    stub: Arc<CachedStub>,
    name: String,
}

impl RbTree {
    pub fn new(stub: Arc<CachedStub>, name: impl Into<String>) -> Self {
        Self {
            stub,
            name: name.into(),
        }
    }

    fn node_key(&self, key: &str) -> String {
        composite_key("rbt", &[&self.name, key])
    }

    fn root_pointer_key(&self) -> String {
        composite_key("rbt", &[&self.name])
    }

    fn get_root(&self) -> Result<Option<String>> {
        Ok(self
            .stub
            .get_state(&self.root_pointer_key())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn set_root(&self, key: Option<&str>) {
        match key {
            Some(k) => self.stub.put_state(&self.root_pointer_key(), k.as_bytes().to_vec()),
            None => self.stub.del_state(&self.root_pointer_key()),
        }
    }

    fn load_node(&self, key: &str) -> Result<Option<Node>> {
        match self.stub.get_state(&self.node_key(key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn must_load(&self, key: &str) -> Result<Node> {
        self.load_node(key)?.ok_or_else(|| {
            Error::InvariantViolation(format!("rbt node {key} referenced but missing"))
        })
    }

    fn save_node(&self, node: &Node) -> Result<()> {
        self.stub
            .put_state(&self.node_key(&node.key), serde_json::to_vec(node)?);
        Ok(())
    }

    fn delete_node_record(&self, key: &str) {
        self.stub.del_state(&self.node_key(key));
    }

    fn color_of(&self, key: &Option<String>) -> Result<Color> {
        match key {
            None => Ok(Color::Black),
            Some(k) => Ok(self.must_load(k)?.color),
        }
    }

    fn set_color(&self, key: &str, color: Color) -> Result<()> {
        let mut node = self.must_load(key)?;
        node.color = color;
        self.save_node(&node)
    }

    /// `true` if `key` is present.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.load_node(key)?.map(|n| n.value))
    }

    /// Idempotent on equal value: inserting the same `(key, value)` twice is
    /// a no-op; re-inserting a different value replaces it in place (no
    /// rebalancing needed, the key already exists).
    pub fn insert(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("rbt key must not be empty".into()));
        }
        if let Some(mut existing) = self.load_node(key)? {
            if existing.value != value {
                existing.value = value;
                self.save_node(&existing)?;
            }
            return Ok(());
        }

        let root = self.get_root()?;
        if root.is_none() {
            self.save_node(&Node {
                key: key.to_string(),
                value,
                color: Color::Black,
                parent: None,
                left: None,
                right: None,
            })?;
            self.set_root(Some(key));
            return Ok(());
        }

        let mut cur = root;
        let mut parent: Option<String> = None;
        let mut goes_left = false;
        while let Some(cur_key) = cur {
            let node = self.must_load(&cur_key)?;
            parent = Some(cur_key);
            if key < node.key.as_str() {
                goes_left = true;
                cur = node.left;
            } else {
                goes_left = false;
                cur = node.right;
            }
        }

        self.save_node(&Node {
            key: key.to_string(),
            value,
            color: Color::Red,
            parent: parent.clone(),
            left: None,
            right: None,
        })?;
        if let Some(p_key) = &parent {
            let mut p = self.must_load(p_key)?;
            if goes_left {
                p.left = Some(key.to_string());
            } else {
                p.right = Some(key.to_string());
            }
            self.save_node(&p)?;
        }
        self.fixup_insert(key)
    }

    fn rotate_left(&self, x_key: &str) -> Result<()> {
        let mut x = self.must_load(x_key)?;
        let y_key = x
            .right
            .clone()
            .ok_or_else(|| Error::InvariantViolation("rotate_left without right child".into()))?;
        let mut y = self.must_load(&y_key)?;

        x.right = y.left.clone();
        if let Some(yl) = &y.left {
            let mut yl_node = self.must_load(yl)?;
            yl_node.parent = Some(x.key.clone());
            self.save_node(&yl_node)?;
        }
        y.parent = x.parent.clone();
        match &x.parent {
            None => self.set_root(Some(&y.key)),
            Some(p_key) => {
                let mut p = self.must_load(p_key)?;
                if p.left.as_deref() == Some(x.key.as_str()) {
                    p.left = Some(y.key.clone());
                } else {
                    p.right = Some(y.key.clone());
                }
                self.save_node(&p)?;
            }
        }
        y.left = Some(x.key.clone());
        x.parent = Some(y.key.clone());
        self.save_node(&x)?;
        self.save_node(&y)?;
        Ok(())
    }

    fn rotate_right(&self, x_key: &str) -> Result<()> {
        let mut x = self.must_load(x_key)?;
        let y_key = x
            .left
            .clone()
            .ok_or_else(|| Error::InvariantViolation("rotate_right without left child".into()))?;
        let mut y = self.must_load(&y_key)?;

        x.left = y.right.clone();
        if let Some(yr) = &y.right {
            let mut yr_node = self.must_load(yr)?;
            yr_node.parent = Some(x.key.clone());
            self.save_node(&yr_node)?;
        }
        y.parent = x.parent.clone();
        match &x.parent {
            None => self.set_root(Some(&y.key)),
            Some(p_key) => {
                let mut p = self.must_load(p_key)?;
                if p.left.as_deref() == Some(x.key.as_str()) {
                    p.left = Some(y.key.clone());
                } else {
                    p.right = Some(y.key.clone());
                }
                self.save_node(&p)?;
            }
        }
        y.right = Some(x.key.clone());
        x.parent = Some(y.key.clone());
        self.save_node(&x)?;
        self.save_node(&y)?;
        Ok(())
    }

    fn fixup_insert(&self, key: &str) -> Result<()> {
        let mut z = key.to_string();
        loop {
            let z_node = self.must_load(&z)?;
            let parent_key = match &z_node.parent {
                Some(p) => p.clone(),
                None => break,
            };
            let parent = self.must_load(&parent_key)?;
            if parent.color == Color::Black {
                break;
            }
            let grandparent_key = match &parent.parent {
                Some(g) => g.clone(),
                None => break,
            };
            let grandparent = self.must_load(&grandparent_key)?;
            let parent_is_left = grandparent.left.as_deref() == Some(parent_key.as_str());

            if parent_is_left {
                let uncle_key = grandparent.right.clone();
                if self.color_of(&uncle_key)? == Color::Red {
                    self.set_color(&parent_key, Color::Black)?;
                    self.set_color(&uncle_key.unwrap(), Color::Black)?;
                    self.set_color(&grandparent_key, Color::Red)?;
                    z = grandparent_key;
                } else {
                    if parent.right.as_deref() == Some(z.as_str()) {
                        z = parent_key.clone();
                        self.rotate_left(&z)?;
                    }
                    let z_node = self.must_load(&z)?;
                    let parent_key2 = z_node.parent.clone().unwrap();
                    self.set_color(&parent_key2, Color::Black)?;
                    self.set_color(&grandparent_key, Color::Red)?;
                    self.rotate_right(&grandparent_key)?;
                }
            } else {
                let uncle_key = grandparent.left.clone();
                if self.color_of(&uncle_key)? == Color::Red {
                    self.set_color(&parent_key, Color::Black)?;
                    self.set_color(&uncle_key.unwrap(), Color::Black)?;
                    self.set_color(&grandparent_key, Color::Red)?;
                    z = grandparent_key;
                } else {
                    if parent.left.as_deref() == Some(z.as_str()) {
                        z = parent_key.clone();
                        self.rotate_right(&z)?;
                    }
                    let z_node = self.must_load(&z)?;
                    let parent_key2 = z_node.parent.clone().unwrap();
                    self.set_color(&parent_key2, Color::Black)?;
                    self.set_color(&grandparent_key, Color::Red)?;
                    self.rotate_left(&grandparent_key)?;
                }
            }
        }
        if let Some(root_key) = self.get_root()? {
            self.set_color(&root_key, Color::Black)?;
        }
        Ok(())
    }

    fn minimum(&self, mut key: String) -> Result<String> {
        loop {
            let node = self.must_load(&key)?;
            match node.left {
                Some(l) => key = l,
                None => return Ok(key),
            }
        }
    }

    fn transplant(&self, u_key: &str, v_key: Option<String>) -> Result<()> {
        let u = self.must_load(u_key)?;
        match &u.parent {
            None => self.set_root(v_key.as_deref()),
            Some(p_key) => {
                let mut p = self.must_load(p_key)?;
                if p.left.as_deref() == Some(u_key) {
                    p.left = v_key.clone();
                } else {
                    p.right = v_key.clone();
                }
                self.save_node(&p)?;
            }
        }
        if let Some(v_key) = &v_key {
            let mut v = self.must_load(v_key)?;
            v.parent = u.parent.clone();
            self.save_node(&v)?;
        }
        Ok(())
    }

    /// Removes `key`. A missing key is a no-op.
    pub fn remove(&self, key: &str) -> Result<()> {
        let z = match self.load_node(key)? {
            Some(z) => z,
            None => return Ok(()),
        };
        let mut y_color = z.color;
        let x_key: Option<String>;
        let x_parent: Option<String>;

        if z.left.is_none() {
            x_key = z.right.clone();
            x_parent = z.parent.clone();
            self.transplant(&z.key, z.right.clone())?;
        } else if z.right.is_none() {
            x_key = z.left.clone();
            x_parent = z.parent.clone();
            self.transplant(&z.key, z.left.clone())?;
        } else {
            let y_key = self.minimum(z.right.clone().unwrap())?;
            let y_node = self.must_load(&y_key)?;
            y_color = y_node.color;
            x_key = y_node.right.clone();

            if y_node.parent.as_deref() == Some(z.key.as_str()) {
                x_parent = Some(y_key.clone());
            } else {
                x_parent = y_node.parent.clone();
                self.transplant(&y_key, y_node.right.clone())?;
                let mut y_node = self.must_load(&y_key)?;
                y_node.right = z.right.clone();
                if let Some(zr) = &z.right {
                    let mut zr_node = self.must_load(zr)?;
                    zr_node.parent = Some(y_key.clone());
                    self.save_node(&zr_node)?;
                }
                self.save_node(&y_node)?;
            }

            self.transplant(&z.key, Some(y_key.clone()))?;
            let mut y_node = self.must_load(&y_key)?;
            y_node.left = z.left.clone();
            if let Some(zl) = &z.left {
                let mut zl_node = self.must_load(zl)?;
                zl_node.parent = Some(y_key.clone());
                self.save_node(&zl_node)?;
            }
            y_node.color = z.color;
            self.save_node(&y_node)?;
        }

        self.delete_node_record(&z.key);
        if y_color == Color::Black {
            self.fixup_delete(x_key, x_parent)?;
        }
        Ok(())
    }

    fn fixup_delete(&self, mut x: Option<String>, mut x_parent: Option<String>) -> Result<()> {
        loop {
            let is_root = match (&x, self.get_root()?) {
                (Some(xk), Some(rk)) => xk == &rk,
                (None, None) => true,
                _ => false,
            };
            if is_root || self.color_of(&x)? == Color::Red {
                break;
            }
            let parent_key = match &x_parent {
                Some(p) => p.clone(),
                None => break,
            };
            let parent = self.must_load(&parent_key)?;
            let x_is_left = parent.left == x;

            if x_is_left {
                let mut w_key = match parent.right.clone() {
                    Some(w) => w,
                    None => break,
                };
                let mut w = self.must_load(&w_key)?;
                if w.color == Color::Red {
                    self.set_color(&w_key, Color::Black)?;
                    self.set_color(&parent_key, Color::Red)?;
                    self.rotate_left(&parent_key)?;
                    let parent_after = self.must_load(&parent_key)?;
                    w_key = parent_after.right.clone().unwrap();
                    w = self.must_load(&w_key)?;
                }
                let w_left_black = self.color_of(&w.left)? == Color::Black;
                let w_right_black = self.color_of(&w.right)? == Color::Black;
                if w_left_black && w_right_black {
                    self.set_color(&w_key, Color::Red)?;
                    x = Some(parent_key.clone());
                    x_parent = self.must_load(&parent_key)?.parent.clone();
                } else {
                    if w_right_black {
                        if let Some(wl) = &w.left {
                            self.set_color(wl, Color::Black)?;
                        }
                        self.set_color(&w_key, Color::Red)?;
                        self.rotate_right(&w_key)?;
                        let parent_after = self.must_load(&parent_key)?;
                        w_key = parent_after.right.clone().unwrap();
                        w = self.must_load(&w_key)?;
                    }
                    let parent_color = self.must_load(&parent_key)?.color;
                    self.set_color(&w_key, parent_color)?;
                    self.set_color(&parent_key, Color::Black)?;
                    if let Some(wr) = &w.right {
                        self.set_color(wr, Color::Black)?;
                    }
                    self.rotate_left(&parent_key)?;
                    x = self.get_root()?;
                    x_parent = None;
                }
            } else {
                let mut w_key = match parent.left.clone() {
                    Some(w) => w,
                    None => break,
                };
                let mut w = self.must_load(&w_key)?;
                if w.color == Color::Red {
                    self.set_color(&w_key, Color::Black)?;
                    self.set_color(&parent_key, Color::Red)?;
                    self.rotate_right(&parent_key)?;
                    let parent_after = self.must_load(&parent_key)?;
                    w_key = parent_after.left.clone().unwrap();
                    w = self.must_load(&w_key)?;
                }
                let w_left_black = self.color_of(&w.left)? == Color::Black;
                let w_right_black = self.color_of(&w.right)? == Color::Black;
                if w_left_black && w_right_black {
                    self.set_color(&w_key, Color::Red)?;
                    x = Some(parent_key.clone());
                    x_parent = self.must_load(&parent_key)?.parent.clone();
                } else {
                    if w_left_black {
                        if let Some(wr) = &w.right {
                            self.set_color(wr, Color::Black)?;
                        }
                        self.set_color(&w_key, Color::Red)?;
                        self.rotate_left(&w_key)?;
                        let parent_after = self.must_load(&parent_key)?;
                        w_key = parent_after.left.clone().unwrap();
                        w = self.must_load(&w_key)?;
                    }
                    let parent_color = self.must_load(&parent_key)?.color;
                    self.set_color(&w_key, parent_color)?;
                    self.set_color(&parent_key, Color::Black)?;
                    if let Some(wl) = &w.left {
                        self.set_color(wl, Color::Black)?;
                    }
                    self.rotate_right(&parent_key)?;
                    x = self.get_root()?;
                    x_parent = None;
                }
            }
        }
        if let Some(k) = x {
            self.set_color(&k, Color::Black)?;
        }
        Ok(())
    }

    /// Smallest entry with `key' >= key`.
    pub fn search_ge(&self, key: &str) -> Result<Option<(String, Vec<u8>)>> {
        let mut cur = self.get_root()?;
        let mut candidate = None;
        while let Some(cur_key) = cur {
            let node = self.must_load(&cur_key)?;
            if node.key.as_str() >= key {
                cur = node.left.clone();
                candidate = Some(node);
            } else {
                cur = node.right.clone();
            }
        }
        Ok(candidate.map(|n| (n.key, n.value)))
    }

    /// In-order successor of `key`, or `None` if `key` is the maximum.
    pub fn next(&self, key: &str) -> Result<Option<(String, Vec<u8>)>> {
        let node = match self.load_node(key)? {
            Some(n) => n,
            None => return Ok(None),
        };
        if let Some(right) = node.right {
            let mut cur = right;
            loop {
                let n = self.must_load(&cur)?;
                match n.left.clone() {
                    Some(l) => cur = l,
                    None => return Ok(Some((n.key, n.value))),
                }
            }
        }
        let mut cur_key = node.key;
        let mut parent = node.parent;
        while let Some(p_key) = parent {
            let p = self.must_load(&p_key)?;
            if p.left.as_deref() == Some(cur_key.as_str()) {
                return Ok(Some((p.key, p.value)));
            }
            cur_key = p_key;
            parent = p.parent.clone();
        }
        Ok(None)
    }

    /// Non-recursive in-order range iteration over `[start, end)`.
    pub fn range_iter(
        &self,
        start: &str,
        end: &str,
        ascending: bool,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        if start >= end {
            return Ok(out);
        }
        let mut cur = self.search_ge(start)?;
        while let Some((k, v)) = cur {
            if k.as_str() >= end {
                break;
            }
            let next = self.next(&k)?;
            out.push((k, v));
            cur = next;
        }
        if !ascending {
            out.reverse();
        }
        Ok(out)
    }

    /// `range_iter` over `[prefix, prefix || U+10FFFF)`.
    pub fn partial_composite_range(
        &self,
        namespace: &str,
        prefix_parts: &[&str],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = composite_key(namespace, prefix_parts);
        let mut end = prefix.clone();
        end.push(RANGE_END_SENTINEL);
        self.range_iter(&prefix, &end, true)
    }

    /// Checks the standard red-black invariants: root is black, no red node
    /// has a red child, and every root-to-leaf path has equal black-depth.
    /// Exposed for tests; a correct implementation never fails this.
    #[cfg(any(test, feature = "proptest-support"))]
    pub fn check_invariants(&self) -> Result<()> {
        let root = self.get_root()?;
        if let Some(r) = &root {
            if self.color_of(&Some(r.clone()))? != Color::Black {
                return Err(Error::InvariantViolation("root is not black".into()));
            }
        }
        self.check_node(&root)?;
        Ok(())
    }

    #[cfg(any(test, feature = "proptest-support"))]
    fn check_node(&self, key: &Option<String>) -> Result<usize> {
        let key = match key {
            None => return Ok(1),
            Some(k) => k,
        };
        let node = self.must_load(key)?;
        if node.color == Color::Red {
            if self.color_of(&node.left)? == Color::Red || self.color_of(&node.right)? == Color::Red {
                return Err(Error::InvariantViolation(format!(
                    "red node {key} has a red child"
                )));
            }
        }
        let left_depth = self.check_node(&node.left)?;
        let right_depth = self.check_node(&node.right)?;
        if left_depth != right_depth {
            return Err(Error::InvariantViolation(format!(
                "unequal black-depth at {key}: {left_depth} vs {right_depth}"
            )));
        }
        Ok(left_depth + if node.color == Color::Black { 1 } else { 0 })
    }
}
