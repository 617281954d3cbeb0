use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in this crate.
///
/// Variants are grouped by the taxonomy in the design doc rather than by which
/// component raised them, so callers can match on "what kind of problem is
/// this" without caring which of C1-C7 noticed it first.
#[derive(Debug, Error)]
pub enum Error {
    /// Empty/illegal identifiers, malformed JSON, unsupported key kind.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A key's bytes don't match a previously persisted node.
    #[error("invalid key for {id}: does not match the persisted node")]
    InvalidKey {
        /// id of the mismatched key node
        id: String,
    },

    /// Asset/datatype/edge absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks a required path/role.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Hash mismatch between stored key and retrieved blob, or between
    /// `asset_key_hash` and a supplied asset key.
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// Wrap/unwrap, parse, or signature failure.
    #[error("crypto error: {0}")]
    CryptoError(String),

    /// Underlying ledger or off-chain I/O failed.
    #[error("storage error: {0}")]
    StorageError(String),

    /// A red-black or tree invariant would be broken. Never surfaced to
    /// callers under correct inputs; a hit here is this crate's bug, not the
    /// caller's.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidInput(format!("malformed json: {e}"))
    }
}
