use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::id::Id;

/// The two kinds of content a pack can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

impl BlobType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlobType::Data => "data",
            BlobType::Tree => "tree",
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a blob: the same bytes stored as data and as tree are
/// different blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobHandle {
    pub id: Id,
    pub blob_type: BlobType,
}

impl BlobHandle {
    pub fn new(id: Id, blob_type: BlobType) -> Self {
        Self { id, blob_type }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.blob_type, self.id)
    }
}

/// One physical occurrence of a blob inside a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlob {
    pub handle: BlobHandle,
    pub pack_id: Id,
    pub offset: u64,
    /// Stored (encrypted envelope) length.
    pub length: u32,
    pub uncompressed_length: u32,
}

impl PackedBlob {
    /// Human-readable location used in error messages.
    pub fn location(&self) -> String {
        format!("pack {} offset {}", self.pack_id, self.offset)
    }
}
