//! Crypto primitives (C1): authenticated symmetric encryption, asymmetric
//! wrap, hashing, and key-kind discrimination.
//!
//! Mirrors the shape of a typical `Key`/`encrypt`/`decrypt` trio: a key is a
//! small value type, encryption produces a self-contained blob that carries
//! its own nonce, and callers never have to juggle algorithm state by hand.
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{PaddingScheme, PublicKey as _, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length in bytes of a valid symmetric key (AES-256).
pub const SYM_KEY_LEN: usize = 32;
/// Length in bytes of the prepended AES-GCM nonce.
const NONCE_LEN: usize = 12;

/// Discriminates what a [`Key`]'s bytes mean.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Symmetric,
    PublicRSA,
    PrivateRSA,
}

/// A key: some bytes plus the kind that says how to interpret them.
///
/// `kind` is derivable from `bytes` (see [`classify`]) but we still carry it
/// explicitly so callers that already know what they hold don't pay for a
/// DER parse on every access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub bytes: Vec<u8>,
    pub kind: KeyKind,
}

impl Key {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() != bytes.is_empty() {
            return Err(Error::InvalidInput(
                "key id must be non-empty iff bytes are non-empty".into(),
            ));
        }
        let kind = classify(&bytes)?;
        Ok(Self { id, bytes, kind })
    }

    pub fn generate_symmetric(id: impl Into<String>) -> Self {
        let mut bytes = vec![0u8; SYM_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            id: id.into(),
            bytes,
            kind: KeyKind::Symmetric,
        }
    }

    pub fn generate_rsa_keypair(id: impl Into<String>) -> Result<(Key, Key)> {
        let id = id.into();
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| Error::CryptoError(format!("rsa keygen failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        let priv_der = private
            .to_pkcs1_der()
            .map_err(|e| Error::CryptoError(format!("rsa encode failed: {e}")))?
            .as_bytes()
            .to_vec();
        let pub_der = public
            .to_pkcs1_der()
            .map_err(|e| Error::CryptoError(format!("rsa encode failed: {e}")))?
            .as_bytes()
            .to_vec();
        let priv_key = Key {
            id: id.clone(),
            bytes: priv_der,
            kind: KeyKind::PrivateRSA,
        };
        let pub_key = Key {
            id,
            bytes: pub_der,
            kind: KeyKind::PublicRSA,
        };
        Ok((pub_key, priv_key))
    }

    fn rsa_public(&self) -> Result<RsaPublicKey> {
        match self.kind {
            KeyKind::PublicRSA => RsaPublicKey::from_pkcs1_der(&self.bytes)
                .map_err(|e| Error::CryptoError(format!("bad public key der: {e}"))),
            KeyKind::PrivateRSA => {
                let sk = RsaPrivateKey::from_pkcs1_der(&self.bytes)
                    .map_err(|e| Error::CryptoError(format!("bad private key der: {e}")))?;
                Ok(RsaPublicKey::from(&sk))
            }
            KeyKind::Symmetric => Err(Error::InvalidInput(
                "symmetric key has no rsa public half".into(),
            )),
        }
    }

    fn rsa_private(&self) -> Result<RsaPrivateKey> {
        match self.kind {
            KeyKind::PrivateRSA => RsaPrivateKey::from_pkcs1_der(&self.bytes)
                .map_err(|e| Error::CryptoError(format!("bad private key der: {e}"))),
            _ => Err(Error::InvalidInput("key is not an rsa private key".into())),
        }
    }

    /// Wraps `child` under this key, per the kind-specific scheme:
    /// sym-AEAD when this key is symmetric, RSA-OAEP(SHA-256) otherwise.
    pub fn wrap(&self, child: &[u8]) -> Result<Vec<u8>> {
        match self.kind {
            KeyKind::Symmetric => sym_encrypt(&self.bytes, child),
            KeyKind::PublicRSA | KeyKind::PrivateRSA => {
                let public = self.rsa_public()?;
                let padding = PaddingScheme::new_oaep::<Sha256>();
                public
                    .encrypt(&mut rand::thread_rng(), padding, child)
                    .map_err(|e| Error::CryptoError(format!("rsa wrap failed: {e}")))
            }
        }
    }

    /// Unwraps `wrapped` using this key. Only meaningful on symmetric or
    /// private-RSA keys (a public key can wrap but never unwrap).
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        match self.kind {
            KeyKind::Symmetric => sym_decrypt(&self.bytes, wrapped),
            KeyKind::PrivateRSA => {
                let private = self.rsa_private()?;
                let padding = PaddingScheme::new_oaep::<Sha256>();
                private
                    .decrypt(padding, wrapped)
                    .map_err(|e| Error::CryptoError(format!("rsa unwrap failed: {e}")))
            }
            KeyKind::PublicRSA => Err(Error::InvalidInput(
                "a public key cannot unwrap; it is never a target".into(),
            )),
        }
    }

    /// `sha256(bytes)` for symmetric keys, or the DER itself for asymmetric
    /// ones (those are already the canonical public identity).
    pub fn content_hash(&self) -> Vec<u8> {
        hash(&self.bytes)
    }

    /// What a key-access node persists to recognize this key again without
    /// ever storing a secret: `sha256(bytes)` for a symmetric key, or the
    /// public-key DER for either half of an RSA pair.
    pub fn public_identity(&self) -> Result<Vec<u8>> {
        match self.kind {
            KeyKind::Symmetric => Ok(self.content_hash()),
            KeyKind::PublicRSA | KeyKind::PrivateRSA => {
                let public = self.rsa_public()?;
                public
                    .to_pkcs1_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .map_err(|e| Error::CryptoError(format!("rsa encode failed: {e}")))
            }
        }
    }
}

/// Classifies raw key bytes by shape: a fixed-length blob is symmetric,
/// otherwise it must parse as an RSA public or private DER document.
pub fn classify(bytes: &[u8]) -> Result<KeyKind> {
    if bytes.len() == SYM_KEY_LEN {
        return Ok(KeyKind::Symmetric);
    }
    if RsaPrivateKey::from_pkcs1_der(bytes).is_ok() {
        return Ok(KeyKind::PrivateRSA);
    }
    if RsaPublicKey::from_pkcs1_der(bytes).is_ok() {
        return Ok(KeyKind::PublicRSA);
    }
    Err(Error::InvalidInput(
        "key bytes are neither a 32-byte symmetric key nor a parseable rsa der".into(),
    ))
}

/// SHA-256 of arbitrary bytes.
pub fn hash(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn sym_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("bad aes key: {e}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut out = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::CryptoError(format!("aes-gcm encrypt failed: {e}")))?;
    let mut result = nonce_bytes.to_vec();
    result.append(&mut out);
    Ok(result)
}

fn sym_decrypt(key: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(Error::CryptoError("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("bad aes key: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| Error::CryptoError(format!("aes-gcm decrypt failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sym_roundtrip() {
        let key = Key::generate_symmetric("sym-test");
        let wrapped = key.wrap(b"hello world").unwrap();
        assert_eq!(key.unwrap(&wrapped).unwrap(), b"hello world");
    }

    #[test]
    fn rsa_roundtrip() {
        let (public, private) = Key::generate_rsa_keypair("pub-priv-test").unwrap();
        let wrapped = public.wrap(b"a symmetric key").unwrap();
        assert_eq!(private.unwrap(&wrapped).unwrap(), b"a symmetric key");
    }

    #[test]
    fn public_key_cannot_unwrap() {
        let (public, _private) = Key::generate_rsa_keypair("pub-priv-test2").unwrap();
        let wrapped = public.wrap(b"x").unwrap();
        assert!(public.unwrap(&wrapped).is_err());
    }

    #[test]
    fn classify_roundtrip() {
        let sym = Key::generate_symmetric("s");
        assert_eq!(classify(&sym.bytes).unwrap(), KeyKind::Symmetric);
        let (public, private) = Key::generate_rsa_keypair("p").unwrap();
        assert_eq!(classify(&public.bytes).unwrap(), KeyKind::PublicRSA);
        assert_eq!(classify(&private.bytes).unwrap(), KeyKind::PrivateRSA);
    }
}
