pub mod file;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use crate::blob::{BlobHandle, BlobType, PackedBlob};
use crate::crypto::id::Id;
use crate::error::{CairnError, Result};
use crate::repo::pack::PackTrailerEntry;

use self::file::{IndexBlob, IndexFile, IndexPack};

/// Where one copy of a blob lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlobLocation {
    pack_id: Id,
    offset: u64,
    length: u32,
    uncompressed_length: u32,
}

impl BlobLocation {
    fn from_index_blob(pack_id: Id, blob: &IndexBlob) -> Self {
        Self {
            pack_id,
            offset: blob.offset,
            length: blob.length,
            uncompressed_length: blob.uncompressed_length,
        }
    }

    fn to_packed_blob(self, handle: BlobHandle) -> PackedBlob {
        PackedBlob {
            handle,
            pack_id: self.pack_id,
            offset: self.offset,
            length: self.length,
            uncompressed_length: self.uncompressed_length,
        }
    }
}

#[derive(Debug, Default)]
struct IndexState {
    /// Every known copy per blob, in insertion order.
    entries: HashMap<BlobHandle, Vec<BlobLocation>>,
    /// Packs recorded since the last successful incremental save.
    overlay: Vec<IndexPack>,
    /// Index files whose content has been merged.
    files: BTreeSet<Id>,
    /// Index files announced as replaced by a newer file.
    superseded: BTreeSet<Id>,
}

impl IndexState {
    /// Returns `true` if the record was new.
    fn insert(&mut self, handle: BlobHandle, location: BlobLocation) -> bool {
        let locations = self.entries.entry(handle).or_default();
        if locations.contains(&location) {
            return false;
        }
        locations.push(location);
        true
    }
}

/// State captured at the start of a full index rewrite.
#[derive(Debug)]
pub struct FullRewrite {
    /// Complete contents to write, grouped by pack.
    pub packs: Vec<IndexPack>,
    /// Overlay taken out of the index. Hand back with
    /// [`Index::restore_overlay`] if the rewrite fails.
    pub overlay: Vec<IndexPack>,
    /// Files made redundant once the rewrite is durable. Only files merged
    /// or written by this session: a file announced as superseded but never
    /// loaded may hold records no other file has.
    pub old_files: BTreeSet<Id>,
}

/// In-memory index from blob handle to every known pack location.
///
/// Holds the union of all merged index files plus an overlay of packs that
/// were durably written in this session but not yet saved to an index file.
/// All methods take `&self`; mutations hold the write lock only for the
/// in-memory update.
#[derive(Debug, Default)]
pub struct Index {
    state: RwLock<IndexState>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if at least one record exists for `handle`.
    pub fn has(&self, handle: &BlobHandle) -> bool {
        self.state.read().entries.contains_key(handle)
    }

    /// Every known location of `handle`, in insertion order.
    pub fn lookup(&self, handle: &BlobHandle) -> Result<Vec<PackedBlob>> {
        let state = self.state.read();
        match state.entries.get(handle) {
            Some(locations) if !locations.is_empty() => Ok(locations
                .iter()
                .map(|loc| loc.to_packed_blob(*handle))
                .collect()),
            _ => Err(CairnError::BlobNotFound(*handle)),
        }
    }

    /// Number of distinct blobs of `blob_type`.
    pub fn count(&self, blob_type: BlobType) -> usize {
        self.state
            .read()
            .entries
            .keys()
            .filter(|h| h.blob_type == blob_type)
            .count()
    }

    /// Number of distinct blobs of either type.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Record a durably written pack. Its blobs become visible and are
    /// queued for the next incremental save.
    pub fn store_pack(&self, pack_id: Id, entries: &[PackTrailerEntry]) {
        let blobs: Vec<IndexBlob> = entries.iter().map(IndexBlob::from).collect();
        let mut state = self.state.write();
        for blob in &blobs {
            state.insert(blob.handle(), BlobLocation::from_index_blob(pack_id, blob));
        }
        state.overlay.push(IndexPack { id: pack_id, blobs });
    }

    /// Merge a loaded index file. Returns `false` if the file was already
    /// merged. Identical records collapse; records naming other packs are kept.
    pub fn merge_file(&self, file_id: Id, file: &IndexFile) -> bool {
        let mut state = self.state.write();
        if !state.files.insert(file_id) {
            return false;
        }
        let mut added = 0usize;
        for pack in &file.packs {
            for blob in &pack.blobs {
                if state.insert(blob.handle(), BlobLocation::from_index_blob(pack.id, blob)) {
                    added += 1;
                }
            }
        }
        state.superseded.extend(file.supersedes.iter().copied());
        debug!(file = %file_id, packs = file.packs.len(), added, "merged index file");
        true
    }

    pub fn is_file_loaded(&self, file_id: &Id) -> bool {
        self.state.read().files.contains(file_id)
    }

    /// Take the packs recorded since the last save, leaving the overlay empty.
    pub fn take_overlay(&self) -> Vec<IndexPack> {
        std::mem::take(&mut self.state.write().overlay)
    }

    /// Put back an overlay whose save failed, ahead of anything recorded since.
    pub fn restore_overlay(&self, mut overlay: Vec<IndexPack>) {
        if overlay.is_empty() {
            return;
        }
        let mut state = self.state.write();
        overlay.append(&mut state.overlay);
        state.overlay = overlay;
    }

    /// Whether any pack is recorded only in memory.
    pub fn has_unsaved(&self) -> bool {
        !self.state.read().overlay.is_empty()
    }

    /// Note that `file_id` was written and holds content already in memory.
    pub fn mark_file_saved(&self, file_id: Id) {
        self.state.write().files.insert(file_id);
    }

    /// Drop every record naming one of `pack_ids`. Used after compaction has
    /// rewritten those packs' live blobs elsewhere.
    pub fn remove_packs(&self, pack_ids: &HashSet<Id>) -> usize {
        if pack_ids.is_empty() {
            return 0;
        }
        let mut state = self.state.write();
        let mut removed = 0usize;
        state.entries.retain(|_, locations| {
            let before = locations.len();
            locations.retain(|loc| !pack_ids.contains(&loc.pack_id));
            removed += before - locations.len();
            !locations.is_empty()
        });
        state.overlay.retain(|p| !pack_ids.contains(&p.id));
        debug!(packs = pack_ids.len(), records = removed, "removed packs from index");
        removed
    }

    /// All records grouped by pack, ordered by pack id then offset.
    pub fn packs(&self) -> Vec<IndexPack> {
        collect_packs(&self.state.read())
    }

    /// Merged or written index files.
    pub fn files(&self) -> BTreeSet<Id> {
        self.state.read().files.clone()
    }

    /// Files announced as superseded by a merged file.
    pub fn superseded(&self) -> BTreeSet<Id> {
        self.state.read().superseded.clone()
    }

    /// Snapshot the contents and take the overlay in one step, so packs
    /// stored while the rewrite runs land in a fresh overlay.
    pub fn begin_full_rewrite(&self) -> FullRewrite {
        let mut state = self.state.write();
        let packs = collect_packs(&state);
        let overlay = std::mem::take(&mut state.overlay);
        let old_files = state.files.clone();
        FullRewrite {
            packs,
            overlay,
            old_files,
        }
    }

    /// Swap `old` for `written` in the set of live files. `old` stays in the
    /// superseded set until each file is actually deleted.
    pub fn finish_full_rewrite(&self, written: &[Id], old: &BTreeSet<Id>) {
        let mut state = self.state.write();
        state.files.retain(|id| !old.contains(id));
        state.files.extend(written.iter().copied());
        state.superseded.extend(old.iter().copied());
        for id in written {
            state.superseded.remove(id);
        }
    }

    /// Forget a superseded file once it has been deleted.
    pub fn forget_superseded(&self, file_id: &Id) {
        self.state.write().superseded.remove(file_id);
    }
}

fn collect_packs(state: &IndexState) -> Vec<IndexPack> {
    let mut by_pack: BTreeMap<Id, Vec<IndexBlob>> = BTreeMap::new();
    for (handle, locations) in &state.entries {
        for loc in locations {
            by_pack.entry(loc.pack_id).or_default().push(IndexBlob {
                id: handle.id,
                blob_type: handle.blob_type,
                offset: loc.offset,
                length: loc.length,
                uncompressed_length: loc.uncompressed_length,
            });
        }
    }
    by_pack
        .into_iter()
        .map(|(id, mut blobs)| {
            blobs.sort_by_key(|b| (b.offset, b.id, b.blob_type));
            IndexPack { id, blobs }
        })
        .collect()
}
