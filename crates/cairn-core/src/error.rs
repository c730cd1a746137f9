use thiserror::Error;

use crate::blob::BlobHandle;
use crate::crypto::id::Id;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("repository already exists: {0}")]
    RepoAlreadyExists(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// Content does not hash to the identifier it was requested or stored under.
    #[error("integrity check failed for {object}: {detail}")]
    Integrity { object: String, detail: String },

    /// The AEAD layer rejected a ciphertext.
    #[error("authentication failed for {object}: {detail}")]
    Authentication { object: String, detail: String },

    #[error("blob not found: {0}")]
    BlobNotFound(BlobHandle),

    #[error("object not found: '{0}'")]
    ObjectNotFound(String),

    #[error("invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("invalid tree {0}: {1}")]
    InvalidTree(Id, String),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("index incomplete: {} index file(s) failed to load", .0.len())]
    IndexIncomplete(Vec<(Id, String)>),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// True for failures that indict one stored copy of an object rather than
    /// the backend or the caller. Readers may try another copy.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CairnError::Integrity { .. } | CairnError::Authentication { .. }
        )
    }
}
