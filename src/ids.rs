//! Deterministic id construction (§6 "Key identifier scheme" / "Asset
//! identifier"). These ids are used verbatim as node ids in the key-access
//! graph (C5) and as ledger keys elsewhere, so the scheme has to be followed
//! exactly rather than just "some id that happens to be unique".
use crate::crypto::hash;

pub fn pub_priv_id(entity_id: &str) -> String {
    format!("pub-priv-{entity_id}")
}

pub fn sym_id(entity_id: &str) -> String {
    format!("sym-{entity_id}")
}

pub fn log_sym_id(entity_id: &str) -> String {
    format!("log-sym-{entity_id}")
}

/// `sha256(sym_key || "logSymKey")`, the secret behind [`log_sym_id`].
pub fn derive_log_sym_key(sym_key: &[u8]) -> Vec<u8> {
    let mut buf = sym_key.to_vec();
    buf.extend_from_slice(b"logSymKey");
    hash(&buf)
}

pub fn private_hash_id(entity_id: &str) -> String {
    format!("private-hash-{entity_id}")
}

/// `sha256(private_key_der)`, the secret behind [`private_hash_id`].
pub fn derive_private_hash_key(private_key_der: &[u8]) -> Vec<u8> {
    hash(private_key_der)
}

pub fn datatype_owner_sym_id(owner_id: &str, datatype_id: &str) -> String {
    format!("sym-{owner_id}-{datatype_id}")
}

/// `"asset_" || base64url(sha256(namespace || ":" || user_id))`.
pub fn asset_id(namespace: &str, user_id: &str) -> String {
    let mut buf = namespace.as_bytes().to_vec();
    buf.push(b':');
    buf.extend_from_slice(user_id.as_bytes());
    let digest = hash(&buf);
    format!(
        "asset_{}",
        base64::encode_config(digest, base64::URL_SAFE_NO_PAD)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_schemes_match_format() {
        assert_eq!(pub_priv_id("alice"), "pub-priv-alice");
        assert_eq!(sym_id("alice"), "sym-alice");
        assert_eq!(log_sym_id("alice"), "log-sym-alice");
        assert_eq!(private_hash_id("alice"), "private-hash-alice");
        assert_eq!(datatype_owner_sym_id("alice", "dt1"), "sym-alice-dt1");
    }

    #[test]
    fn asset_id_is_deterministic() {
        let a = asset_id("data_model.Asset", "user-1");
        let b = asset_id("data_model.Asset", "user-1");
        assert_eq!(a, b);
        assert!(a.starts_with("asset_"));
        assert_ne!(a, asset_id("data_model.Asset", "user-2"));
    }
}
