use serde::{Deserialize, Serialize};

use crate::blob::{BlobHandle, BlobType, PackedBlob};
use crate::crypto::id::Id;
use crate::repo::pack::PackTrailerEntry;

/// One blob record inside an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBlob {
    pub id: Id,
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl IndexBlob {
    pub fn handle(&self) -> BlobHandle {
        BlobHandle::new(self.id, self.blob_type)
    }

    pub fn to_packed_blob(&self, pack_id: Id) -> PackedBlob {
        PackedBlob {
            handle: self.handle(),
            pack_id,
            offset: self.offset,
            length: self.length,
            uncompressed_length: self.uncompressed_length,
        }
    }
}

impl From<&PackTrailerEntry> for IndexBlob {
    fn from(entry: &PackTrailerEntry) -> Self {
        Self {
            id: entry.id,
            blob_type: entry.blob_type,
            offset: entry.offset,
            length: entry.length,
            uncompressed_length: entry.uncompressed_length,
        }
    }
}

/// All records of one pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPack {
    pub id: Id,
    pub blobs: Vec<IndexBlob>,
}

/// Persisted form of an index file, stored encrypted under `index/<id>`.
///
/// `supersedes` names older index files whose content this one fully
/// contains. They are safe to delete once this file is durable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default)]
    pub supersedes: Vec<Id>,
    pub packs: Vec<IndexPack>,
}

impl IndexFile {
    pub fn blob_count(&self) -> usize {
        self.packs.iter().map(|p| p.blobs.len()).sum()
    }

    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
