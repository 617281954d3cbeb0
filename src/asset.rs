//! Asset & user manager (C7): persists assets (public + encrypted private
//! halves) and users (assets under a fixed namespace), wires their keys into
//! the key-access graph (C5), and exposes the public-facing access checks
//! (§4.7).
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::CachedStub;
use crate::crypto::Key;
use crate::datatype::DatatypeTree;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::ids;
use crate::keygraph::KeyGraph;
use crate::rbt::RbTree;

/// Namespace users are registered under, for `ids::asset_id`.
pub const USER_NAMESPACE: &str = "data_model.User";
/// Fixed index table name for users (§3 "User").
pub const USER_INDEX_TABLE: &str = "user-index";

/// An asset's private half: either ciphertext under the asset key, or a
/// sentinel marking "stored off-chain by reference" (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrivateData {
    Ciphertext(Vec<u8>),
    OffChainRef(String),
}

/// What a caller supplies for the private half on `add_asset`/`update_asset`.
pub enum PrivateInput {
    Plaintext(Vec<u8>),
    OffChainRef(String),
}

/// A persisted asset record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub datatypes: Vec<String>,
    pub public_data: Vec<u8>,
    pub private_data: PrivateData,
    pub owner_id: String,
    pub metadata: HashMap<String, String>,
    pub asset_key_id: String,
    pub asset_key_hash: Vec<u8>,
    pub index_table: String,
}

/// Everything needed to create a new asset: the caller supplies the fields
/// that aren't derivable, plus the index key components for its table.
pub struct NewAsset {
    pub asset_id: String,
    pub datatypes: Vec<String>,
    pub public_data: Vec<u8>,
    pub private: PrivateInput,
    pub owner_id: String,
    pub metadata: HashMap<String, String>,
    pub index_table: String,
    /// Ordered field values making up this asset's entry in `index_table`,
    /// e.g. `["0000000018"]` for a single numeric field `n`. Left to the
    /// caller to pre-format (zero-padded decimal etc.) so lexicographic
    /// order matches the intended order; see SPEC_FULL.md's decision on the
    /// source's `10^12` offset trick.
    pub index_fields: Vec<String>,
}

fn write_filter() -> Filter {
    // Skip an edge whose access_type is "read": it does not grant write.
    // Structural scaffolding edges (the datatype ancestor-key chain) are
    // exempted: they carry the default "read" access_type but aren't a
    // consent grant, so pruning them would block every datatype-rooted
    // write consent from ever reaching its target.
    Filter::compile(&json!({
        "and": [
            {"==": [{"var": "access_type"}, "read"]},
            {"!=": [{"var": "edge_role"}, "structural"]}
        ]
    }))
    .expect("static filter compiles")
}

fn read_filter() -> Filter {
    // skip any edge that only grants write (write_only excludes read).
    Filter::compile(&json!({"==": [{"var": "access_type"}, "write_only"]})).expect("static filter compiles")
}

fn index_key(fields: &[String], asset_id: &str) -> String {
    let mut s = fields.join("\u{0}");
    s.push('\u{0}');
    s.push_str(asset_id);
    s
}

fn index_bound(fields: &[String]) -> String {
    fields.join("\u{0}")
}

/// The asset & user manager (C7), built over the key-access graph (C5) and
/// datatype tree (C6) for a single transaction.
pub struct AssetManager {
    stub: Arc<CachedStub>,
    keys: Arc<KeyGraph>,
    datatypes: Arc<DatatypeTree>,
}

impl AssetManager {
    pub fn new(stub: Arc<CachedStub>, keys: Arc<KeyGraph>, datatypes: Arc<DatatypeTree>) -> Self {
        Self { stub, keys, datatypes }
    }

    fn record_key(&self, asset_id: &str) -> String {
        self.stub.composite_key("asset", &[asset_id])
    }

    fn load(&self, asset_id: &str) -> Result<Option<Asset>> {
        match self.stub.get_state(&self.record_key(asset_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, asset: &Asset) -> Result<()> {
        self.stub
            .put_state(&self.record_key(&asset.asset_id), serde_json::to_vec(asset)?);
        Ok(())
    }

    /// Checks whether `caller_id` has write access to `asset`: direct
    /// ownership, or a live (non-expired, non-`read`/`read_only`) path from
    /// the caller's identity key to the asset key (§4.7).
    pub fn has_write_access(&self, caller_id: &str, asset: &Asset) -> Result<bool> {
        if caller_id == asset.owner_id {
            return Ok(true);
        }
        let filter = write_filter();
        self.keys
            .slow_verify_access(&ids::pub_priv_id(caller_id), &asset.asset_key_id, Some(&filter))
    }

    /// Checks whether `caller_id` has read access to `asset`: anything that
    /// grants write, or a live path not marked `write_only`.
    pub fn has_read_access(&self, caller_id: &str, asset: &Asset) -> Result<bool> {
        if self.has_write_access(caller_id, asset)? {
            return Ok(true);
        }
        let filter = read_filter();
        self.keys
            .slow_verify_access(&ids::pub_priv_id(caller_id), &asset.asset_key_id, Some(&filter))
    }

    /// Creates an asset record. `caller_id` must be the declared owner,
    /// unless `strict_owner_check` is `false`, in which case the caller only
    /// needs a path to the (about to be registered) asset key, checked
    /// here via the wrap step itself, since `owner_sym` is what authorizes
    /// the wiring.
    pub fn add_asset(
        &self,
        new: NewAsset,
        asset_key: &Key,
        owner_sym: &Key,
        caller_id: &str,
        strict_owner_check: bool,
    ) -> Result<()> {
        if strict_owner_check && caller_id != new.owner_id {
            return Err(Error::PermissionDenied(format!(
                "{caller_id} is not the declared owner of asset {}",
                new.asset_id
            )));
        }
        if self.load(&new.asset_id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "asset {} already exists",
                new.asset_id
            )));
        }

        let private_data = match new.private {
            PrivateInput::Plaintext(plaintext) => PrivateData::Ciphertext(asset_key.wrap(&plaintext)?),
            PrivateInput::OffChainRef(data_key) => PrivateData::OffChainRef(data_key),
        };

        self.keys.add_access(
            owner_sym,
            asset_key,
            Some(HashMap::from([("access_type".to_string(), "write".to_string())])),
        )?;
        for dt in &new.datatypes {
            let dt_key = self.datatypes.add_datatype_sym_key(&self.keys, dt, &new.owner_id, owner_sym)?;
            self.keys.add_access(
                &dt_key,
                asset_key,
                Some(HashMap::from([("access_type".to_string(), "write".to_string())])),
            )?;
        }

        let asset = Asset {
            asset_id: new.asset_id.clone(),
            datatypes: new.datatypes,
            public_data: new.public_data,
            private_data,
            owner_id: new.owner_id,
            metadata: new.metadata,
            asset_key_id: asset_key.id.clone(),
            asset_key_hash: asset_key.content_hash(),
            index_table: new.index_table.clone(),
        };
        self.save(&asset)?;

        let index = RbTree::new(self.stub.clone(), asset.index_table.clone());
        index.insert(
            &index_key(&new.index_fields, &asset.asset_id),
            asset.asset_id.as_bytes().to_vec(),
        )?;
        tracing::info!(asset_id = %asset.asset_id, owner = %asset.owner_id, "add_asset");
        Ok(())
    }

    /// Replaces public/private data. Requires write access; rejects a
    /// changed asset key (keys are immutable once bound, §4.6).
    pub fn update_asset(
        &self,
        asset_id: &str,
        public_data: Vec<u8>,
        private: PrivateInput,
        asset_key: &Key,
        caller_id: &str,
    ) -> Result<()> {
        let mut asset = self
            .load(asset_id)?
            .ok_or_else(|| Error::NotFound(format!("asset {asset_id}")))?;
        if !self.has_write_access(caller_id, &asset)? {
            return Err(Error::PermissionDenied(format!(
                "{caller_id} lacks write access to asset {asset_id}"
            )));
        }
        if asset_key.content_hash() != asset.asset_key_hash {
            return Err(Error::IntegrityError(
                "asset key is immutable once bound; supplied key does not match".into(),
            ));
        }
        asset.public_data = public_data;
        asset.private_data = match private {
            PrivateInput::Plaintext(plaintext) => PrivateData::Ciphertext(asset_key.wrap(&plaintext)?),
            PrivateInput::OffChainRef(data_key) => PrivateData::OffChainRef(data_key),
        };
        self.save(&asset)?;
        tracing::info!(asset_id, "update_asset");
        Ok(())
    }

    /// Returns the record; `private_data` is decrypted in place if
    /// `asset_key` is supplied and matches, otherwise returned as ciphertext
    /// with no error (§4.6).
    pub fn get_asset(&self, asset_id: &str, asset_key: Option<&Key>) -> Result<Option<Asset>> {
        let mut asset = match self.load(asset_id)? {
            Some(a) => a,
            None => return Ok(None),
        };
        if let Some(key) = asset_key {
            if key.content_hash() == asset.asset_key_hash {
                if let PrivateData::Ciphertext(ct) = &asset.private_data {
                    let plaintext = key.unwrap(ct)?;
                    asset.private_data = PrivateData::Ciphertext(plaintext);
                }
            }
        }
        Ok(Some(asset))
    }

    /// Removes the asset record, its index entry, and every key-graph edge
    /// into its asset key. Requires write access.
    pub fn delete_asset(&self, asset_id: &str, asset_key: &Key, caller_id: &str, index_fields: &[String]) -> Result<()> {
        let asset = self
            .load(asset_id)?
            .ok_or_else(|| Error::NotFound(format!("asset {asset_id}")))?;
        if !self.has_write_access(caller_id, &asset)? {
            return Err(Error::PermissionDenied(format!(
                "{caller_id} lacks write access to asset {asset_id}"
            )));
        }
        if asset_key.content_hash() != asset.asset_key_hash {
            return Err(Error::IntegrityError(
                "supplied asset key does not match the stored key hash".into(),
            ));
        }
        for (parent_id, _edge) in self.keys.graph_parents(&asset.asset_key_id)? {
            self.keys.revoke_access(&parent_id, &asset.asset_key_id);
        }
        self.stub.del_state(&self.record_key(asset_id));
        let index = RbTree::new(self.stub.clone(), asset.index_table.clone());
        index.remove(&index_key(index_fields, asset_id))?;
        tracing::warn!(asset_id, "delete_asset");
        Ok(())
    }

    /// Walks `table` from the lexicographic prefix derived from
    /// `fields`/`start_vals`/`end_vals`, optionally resuming after
    /// `previous_key`, applying `filter` against each asset's metadata, and
    /// yielding up to `limit` assets.
    ///
    /// `namespace` identifies the caller's asset kind for diagnostics
    /// (`table` alone already disambiguates the index; this is not used to
    /// filter rows). `fields` must have one entry per `start_vals`/`end_vals`
    /// component.
    ///
    /// If `decrypt_private`, each result's `private_data` is decrypted:
    /// `key_path` gives the `(start_key, path)` shared by every matching
    /// asset up to (but not including) its own `asset_key_id`, which is
    /// appended per result before walking the key graph. With `key_path`
    /// absent, decryption is attempted with no key (always a no-op, same as
    /// `get_asset` with `asset_key: None`). If `only_private`, `public_data`
    /// is cleared from each result before it's returned.
    #[allow(clippy::too_many_arguments)]
    pub fn get_asset_iter(
        &self,
        namespace: &str,
        table: &str,
        fields: &[String],
        start_vals: &[String],
        end_vals: &[String],
        previous_key: Option<&str>,
        decrypt_private: bool,
        only_private: bool,
        key_path: Option<(&Key, &[String])>,
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<Asset>> {
        if start_vals.len() != fields.len() || end_vals.len() != fields.len() {
            return Err(Error::InvalidInput(
                "start_vals and end_vals must each have one entry per field".into(),
            ));
        }
        let index = RbTree::new(self.stub.clone(), table.to_string());
        let start = index_bound(start_vals);
        let end = index_bound(end_vals);
        let rows = index.range_iter(&start, &end, true)?;

        let mut out = Vec::new();
        for (key, value) in rows {
            if let Some(prev) = previous_key {
                if key.as_str() <= prev {
                    continue;
                }
            }
            let asset_id = String::from_utf8_lossy(&value).into_owned();
            let asset = match self.load(&asset_id)? {
                Some(a) => a,
                None => continue,
            };
            if let Some(f) = filter {
                let meta: HashMap<String, Value> = asset
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                if f.evaluate(&meta)? {
                    continue;
                }
            }
            let mut asset = if decrypt_private {
                let resolved = match key_path {
                    Some((start_key, rest)) => {
                        let mut path: Vec<String> = Vec::with_capacity(rest.len() + 2);
                        path.push(start_key.id.clone());
                        path.extend(rest.iter().cloned());
                        if path.last() != Some(&asset.asset_key_id) {
                            path.push(asset.asset_key_id.clone());
                        }
                        let bytes = self.keys.get_key(&path, start_key.bytes.clone())?;
                        Some(Key::new(asset.asset_key_id.clone(), bytes)?)
                    }
                    None => None,
                };
                self.get_asset(&asset.asset_id, resolved.as_ref())?.unwrap()
            } else {
                asset
            };
            if only_private {
                asset.public_data.clear();
            }
            out.push(asset);
            if out.len() >= limit {
                break;
            }
        }
        tracing::debug!(namespace, table, returned = out.len(), "get_asset_iter");
        Ok(out)
    }

    /// Registers a user as an `Asset` under the fixed user namespace and
    /// index table (§3 "User"), reifying their RSA keypair's node (a
    /// private key is represented by its matching public key's node, §3),
    /// wiring an optional personal symmetric key as its child, and storing
    /// an optional encrypted private key (§3 "an optional encrypted private
    /// key").
    ///
    /// A personal sym key additionally gets its `log-sym-<user_id>` key
    /// derived and wired underneath it, for log encryption (§6 key scheme).
    /// A supplied `private_key_der` is wrapped under its own
    /// `private-hash-<user_id>` key, derived from the DER itself: anyone
    /// who already holds the private key can re-derive the wrapping key
    /// locally, so this needs no exchange over the access graph.
    pub fn register_user(
        &self,
        user_id: &str,
        public_key: &Key,
        personal_sym: Option<&Key>,
        private_key_der: Option<&[u8]>,
    ) -> Result<Asset> {
        let asset_id = ids::asset_id(USER_NAMESPACE, user_id);
        if self.load(&asset_id)?.is_some() {
            return Err(Error::InvalidInput(format!("user {user_id} already registered")));
        }
        self.keys.ensure_node(public_key)?;
        if let Some(sym) = personal_sym {
            self.keys.add_access(
                public_key,
                sym,
                Some(HashMap::from([("access_type".to_string(), "write".to_string())])),
            )?;
            let log_key = Key::new(ids::log_sym_id(user_id), ids::derive_log_sym_key(&sym.bytes))?;
            self.keys.add_access(
                sym,
                &log_key,
                Some(HashMap::from([("access_type".to_string(), "write".to_string())])),
            )?;
        }
        let private_data = match private_key_der {
            Some(der) => {
                let hash_key = Key::new(ids::private_hash_id(user_id), ids::derive_private_hash_key(der))?;
                self.keys.ensure_node(&hash_key)?;
                PrivateData::Ciphertext(hash_key.wrap(der)?)
            }
            None => PrivateData::Ciphertext(Vec::new()),
        };
        let asset = Asset {
            asset_id: asset_id.clone(),
            datatypes: Vec::new(),
            public_data: public_key.bytes.clone(),
            private_data,
            owner_id: user_id.to_string(),
            metadata: HashMap::new(),
            asset_key_id: public_key.id.clone(),
            asset_key_hash: public_key.content_hash(),
            index_table: USER_INDEX_TABLE.to_string(),
        };
        self.save(&asset)?;
        let index = RbTree::new(self.stub.clone(), USER_INDEX_TABLE.to_string());
        index.insert(&index_key(&[user_id.to_string()], &asset_id), asset_id.as_bytes().to_vec())?;
        tracing::info!(user_id, "register_user");
        Ok(asset)
    }
}
