use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::{BlobHandle, BlobType, PackedBlob};
use crate::crypto::id::Id;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};
use crate::storage::{FileType, StorageBackend};

use super::format::{pack_object_with_context, unpack_object_expect_with_context, ObjectType};

/// Pack format version, stored in the footer.
pub const PACK_VERSION: u32 = 1;
/// Footer: `[u32 LE trailer length][u32 LE format version]`.
pub const PACK_FOOTER_SIZE: usize = 8;

/// Maximum number of blobs in a single pack file.
/// Bounds the trailer size when many tiny blobs are saved.
pub const MAX_BLOBS_PER_PACK: usize = 10_000;

/// Maximum age of an open pack before it is sealed (in seconds).
pub const PACK_MAX_AGE_SECS: u64 = 300;

/// Skip upfront `reserve()` for unreasonably large targets (e.g. `usize::MAX` in tests).
const MAX_PREALLOC_SIZE: usize = 256 * 1024 * 1024;

const PACK_TRAILER_CONTEXT: &[u8] = b"pack-trailer";

/// One entry in a pack's trailer, describing a single blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackTrailerEntry {
    pub id: Id,
    pub blob_type: BlobType,
    pub uncompressed_length: u32,
    pub offset: u64,
    pub length: u32,
}

impl PackTrailerEntry {
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

/// Accumulates encrypted blobs into one contiguous buffer until the pack is
/// sealed.
///
/// Blobs start at offset 0 with no per-blob framing; the trailer appended by
/// `seal` is the only record of where each blob lives.
pub struct PackWriter {
    target_size: usize,
    pack_bytes: Vec<u8>,
    entries: Vec<PackTrailerEntry>,
    positions: HashMap<BlobHandle, usize>,
    /// When the first blob was added to the current buffer.
    first_blob_time: Option<Instant>,
}

impl PackWriter {
    pub fn new(target_size: usize) -> Self {
        Self {
            target_size,
            pack_bytes: Vec::new(),
            entries: Vec::new(),
            positions: HashMap::new(),
            first_blob_time: None,
        }
    }

    /// Append an encrypted blob. Returns its offset within the pack.
    /// Adding a handle that is already buffered is a no-op.
    pub fn add_blob(&mut self, handle: BlobHandle, stored: &[u8], uncompressed_length: u32) -> u64 {
        if let Some(&pos) = self.positions.get(&handle) {
            return self.entries[pos].offset;
        }
        if self.entries.is_empty() {
            if self.pack_bytes.capacity() == 0 && self.target_size <= MAX_PREALLOC_SIZE {
                self.pack_bytes.reserve(self.target_size);
            }
            self.first_blob_time = Some(Instant::now());
        }

        let offset = self.pack_bytes.len() as u64;
        self.pack_bytes.extend_from_slice(stored);
        self.positions.insert(handle, self.entries.len());
        self.entries.push(PackTrailerEntry {
            id: handle.id,
            blob_type: handle.blob_type,
            uncompressed_length,
            offset,
            length: stored.len() as u32,
        });
        offset
    }

    pub fn contains(&self, handle: &BlobHandle) -> bool {
        self.positions.contains_key(handle)
    }

    /// Trailer entry and stored bytes of a buffered blob.
    pub fn pending_blob(&self, handle: &BlobHandle) -> Option<(&PackTrailerEntry, &[u8])> {
        let entry = &self.entries[*self.positions.get(handle)?];
        let start = entry.offset as usize;
        Some((entry, &self.pack_bytes[start..start + entry.length as usize]))
    }

    /// Whether the pack should be sealed: target size reached, blob-count
    /// limit reached, or the pack has been open longer than the max age.
    pub fn should_flush(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self.pack_bytes.len() >= self.target_size {
            return true;
        }
        if self.entries.len() >= MAX_BLOBS_PER_PACK {
            return true;
        }
        self.first_blob_time
            .is_some_and(|t| t.elapsed().as_secs() >= PACK_MAX_AGE_SECS)
    }

    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn blob_count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes of blob data buffered so far.
    pub fn size(&self) -> usize {
        self.pack_bytes.len()
    }

    /// Append the encrypted trailer and footer, compute the pack id, and
    /// reset the writer. On error the buffered blobs are left untouched.
    pub fn seal(&mut self, crypto: &dyn CryptoEngine) -> Result<SealedPack> {
        if self.entries.is_empty() {
            return Err(CairnError::Other("cannot seal empty pack writer".into()));
        }

        // Fallible work first: pack_bytes is not modified until it succeeds.
        let trailer_bytes = rmp_serde::to_vec(&self.entries)?;
        let trailer = pack_object_with_context(
            ObjectType::PackTrailer,
            PACK_TRAILER_CONTEXT,
            &trailer_bytes,
            crypto,
        )?;
        let trailer_len = u32::try_from(trailer.len())
            .map_err(|_| CairnError::Other("pack trailer exceeds 4 GiB".into()))?;

        let mut data = std::mem::take(&mut self.pack_bytes);
        data.extend_from_slice(&trailer);
        data.extend_from_slice(&trailer_len.to_le_bytes());
        data.extend_from_slice(&PACK_VERSION.to_le_bytes());

        let id = Id::compute(&data);
        let entries = std::mem::take(&mut self.entries);
        let positions = std::mem::take(&mut self.positions);
        self.first_blob_time = None;

        debug!(pack = %id, blobs = entries.len(), bytes = data.len(), "sealed pack");
        Ok(SealedPack {
            id,
            data,
            entries,
            positions,
        })
    }
}

/// A finalized pack that may still be uploading. Its blobs stay readable
/// from memory until the upload settles.
pub struct SealedPack {
    pub id: Id,
    pub data: Vec<u8>,
    pub entries: Vec<PackTrailerEntry>,
    positions: HashMap<BlobHandle, usize>,
}

impl SealedPack {
    pub fn contains(&self, handle: &BlobHandle) -> bool {
        self.positions.contains_key(handle)
    }

    pub fn blob(&self, handle: &BlobHandle) -> Option<(&PackTrailerEntry, &[u8])> {
        let entry = &self.entries[*self.positions.get(handle)?];
        let start = entry.offset as usize;
        Some((entry, &self.data[start..start + entry.length as usize]))
    }

    pub fn storage_key(&self) -> String {
        FileType::Pack.storage_key(&self.id)
    }
}

/// Range-read one stored blob. `Ok(None)` means the pack object is missing.
pub fn read_blob_from_pack(
    storage: &dyn StorageBackend,
    pack_id: &Id,
    offset: u64,
    length: u32,
) -> Result<Option<Vec<u8>>> {
    storage.get_range(&FileType::Pack.storage_key(pack_id), offset, length as u64)
}

/// Read a pack's trailer tail-first: stat, footer, then trailer, without
/// touching blob data. Returns the entries and the pack's total size.
pub fn read_pack_trailer(
    storage: &dyn StorageBackend,
    pack_id: &Id,
    crypto: &dyn CryptoEngine,
) -> Result<(Vec<PackTrailerEntry>, u64)> {
    let key = FileType::Pack.storage_key(pack_id);
    let size = storage
        .size(&key)?
        .ok_or_else(|| CairnError::ObjectNotFound(key.clone()))?;
    if size < PACK_FOOTER_SIZE as u64 {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id}: {size} bytes is too small for a footer"
        )));
    }

    let footer = storage
        .get_range(&key, size - PACK_FOOTER_SIZE as u64, PACK_FOOTER_SIZE as u64)?
        .ok_or_else(|| CairnError::ObjectNotFound(key.clone()))?;
    let footer: [u8; PACK_FOOTER_SIZE] = footer.as_slice().try_into().map_err(|_| {
        CairnError::InvalidFormat(format!("pack {pack_id}: short read on footer"))
    })?;
    let trailer_len = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]) as u64;
    let version = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
    if version != PACK_VERSION {
        return Err(CairnError::UnsupportedVersion(version));
    }
    let body_len = size - PACK_FOOTER_SIZE as u64;
    if trailer_len == 0 || trailer_len > body_len {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id}: trailer length {trailer_len} out of range"
        )));
    }

    let trailer_start = body_len - trailer_len;
    let trailer = storage
        .get_range(&key, trailer_start, trailer_len)?
        .ok_or_else(|| CairnError::ObjectNotFound(key.clone()))?;
    if trailer.len() as u64 != trailer_len {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id}: short read on trailer"
        )));
    }
    let trailer_bytes = unpack_object_expect_with_context(
        &trailer,
        ObjectType::PackTrailer,
        PACK_TRAILER_CONTEXT,
        crypto,
    )?;
    let entries: Vec<PackTrailerEntry> = rmp_serde::from_slice(&trailer_bytes)?;

    for entry in &entries {
        let end = entry.offset.checked_add(entry.length as u64);
        if end.map_or(true, |end| end > trailer_start) {
            return Err(CairnError::InvalidFormat(format!(
                "pack {pack_id}: blob {} range {}+{} overlaps the trailer",
                entry.handle(),
                entry.offset,
                entry.length
            )));
        }
    }
    Ok((entries, size))
}
