use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::blob::BlobHandle;
use crate::crypto::id::Id;
use crate::crypto::CryptoEngine;
use crate::error::{CairnError, Result};
use crate::index::Index;
use crate::storage::StorageBackend;

use super::pack::{PackTrailerEntry, PackWriter, SealedPack};

/// Write-path state of a repository handle: the open pack, sealed packs
/// still uploading, and the upload threads.
pub(crate) struct WriteSession {
    pub(crate) writer: PackWriter,
    /// Sealed packs whose upload has not settled. Their blobs are served
    /// from here until the index knows about them.
    pub(crate) in_flight: HashMap<Id, Arc<SealedPack>>,
    /// Background upload threads waiting to be joined, oldest first.
    pub(crate) pending_uploads: VecDeque<JoinHandle<()>>,
    /// Upload failures not yet reported by `flush`.
    pub(crate) failed_uploads: Vec<CairnError>,
    /// Blobs of failed packs not yet passed to `save_blob` again.
    pub(crate) lost_blobs: HashSet<BlobHandle>,
    pub(crate) max_in_flight_uploads: usize,
}

impl WriteSession {
    pub(crate) fn new(pack_target_size: usize, max_in_flight_uploads: usize) -> Self {
        Self {
            writer: PackWriter::new(pack_target_size),
            in_flight: HashMap::new(),
            pending_uploads: VecDeque::new(),
            failed_uploads: Vec::new(),
            lost_blobs: HashSet::new(),
            max_in_flight_uploads: max_in_flight_uploads.max(1),
        }
    }

    /// Whether `handle` is buffered or uploading in this session.
    pub(crate) fn contains(&self, handle: &BlobHandle) -> bool {
        self.writer.contains(handle) || self.in_flight.values().any(|p| p.contains(handle))
    }

    /// Copy of a pending blob's trailer entry and stored bytes.
    pub(crate) fn pending_blob(&self, handle: &BlobHandle) -> Option<(PackTrailerEntry, Vec<u8>)> {
        if let Some((entry, bytes)) = self.writer.pending_blob(handle) {
            return Some((entry.clone(), bytes.to_vec()));
        }
        self.in_flight
            .values()
            .find_map(|p| p.blob(handle))
            .map(|(entry, bytes)| (entry.clone(), bytes.to_vec()))
    }

    /// Blobs saved in this session that are not yet durable.
    pub(crate) fn unflushed_blobs(&self) -> usize {
        self.writer.blob_count()
            + self
                .in_flight
                .values()
                .map(|p| p.entries.len())
                .sum::<usize>()
    }
}

/// A write session shared between the repository and its upload threads.
pub(crate) struct SharedSession {
    pub(crate) state: Mutex<WriteSession>,
    /// Signalled whenever an upload settles.
    settled: Condvar,
}

impl SharedSession {
    pub(crate) fn new(pack_target_size: usize, max_in_flight_uploads: usize) -> Self {
        Self {
            state: Mutex::new(WriteSession::new(pack_target_size, max_in_flight_uploads)),
            settled: Condvar::new(),
        }
    }

    /// Seal the open pack (if any) and start uploading it in the background.
    /// Must be called with `state` locked from `self.state`.
    pub(crate) fn rotate(
        self: &Arc<Self>,
        state: &mut WriteSession,
        storage: &Arc<dyn StorageBackend>,
        index: &Arc<Index>,
        crypto: &dyn CryptoEngine,
    ) -> Result<()> {
        if !state.writer.has_pending() {
            return Ok(());
        }
        let sealed = Arc::new(state.writer.seal(crypto)?);
        let pack_id = sealed.id;
        state.in_flight.insert(pack_id, Arc::clone(&sealed));

        let session = Arc::clone(self);
        let storage = Arc::clone(storage);
        let index = Arc::clone(index);
        let spawned = std::thread::Builder::new()
            .name("pack-upload".into())
            .spawn(move || upload_pack(&session, storage.as_ref(), &index, &sealed));
        match spawned {
            Ok(handle) => {
                state.pending_uploads.push_back(handle);
                Ok(())
            }
            Err(e) => {
                state.in_flight.remove(&pack_id);
                Err(CairnError::Io(e))
            }
        }
    }

    /// Block on the oldest uploads while more than the allowed number are
    /// outstanding. The session lock is not held while joining.
    pub(crate) fn cap_pending_uploads(&self) {
        loop {
            let handle = {
                let mut state = self.state.lock();
                self.reap_finished(&mut state);
                if state.pending_uploads.len() <= state.max_in_flight_uploads {
                    return;
                }
                state.pending_uploads.pop_front()
            };
            if let Some(handle) = handle {
                self.join_upload(handle);
            }
        }
    }

    /// Wait until every upload started so far has settled, then return the
    /// failures recorded since the last call.
    pub(crate) fn wait_all(&self) -> Vec<CairnError> {
        let mut state = self.state.lock();
        loop {
            if let Some(handle) = state.pending_uploads.pop_front() {
                drop(state);
                self.join_upload(handle);
                state = self.state.lock();
                continue;
            }
            // Another caller may be joining the last threads.
            if state.in_flight.is_empty() {
                return std::mem::take(&mut state.failed_uploads);
            }
            self.settled.wait(&mut state);
        }
    }

    fn join_upload(&self, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            let mut state = self.state.lock();
            self.record_panic(&mut state);
        }
    }

    fn reap_finished(&self, state: &mut WriteSession) {
        let (finished, running): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut state.pending_uploads)
                .into_iter()
                .partition(|h| h.is_finished());
        state.pending_uploads = running;
        for handle in finished {
            if handle.join().is_err() {
                self.record_panic(state);
            }
        }
    }

    /// A panicking upload thread never reached its cleanup: drop the packs
    /// no thread holds anymore so waiters do not block on them.
    fn record_panic(&self, state: &mut WriteSession) {
        state
            .failed_uploads
            .push(CairnError::Other("pack upload thread panicked".into()));
        let lost = &mut state.lost_blobs;
        state.in_flight.retain(|_, p| {
            let held = Arc::strong_count(p) > 1;
            if !held {
                lost.extend(p.entries.iter().map(PackTrailerEntry::handle));
            }
            held
        });
        self.settled.notify_all();
    }
}

/// Upload thread body. The index is updated before the in-memory copy is
/// dropped so the blobs never become invisible to this session.
fn upload_pack(
    session: &SharedSession,
    storage: &dyn StorageBackend,
    index: &Index,
    pack: &Arc<SealedPack>,
) {
    let result = storage.put(&pack.storage_key(), &pack.data);
    match &result {
        Ok(()) => {
            index.store_pack(pack.id, &pack.entries);
            debug!(pack = %pack.id, blobs = pack.entries.len(), bytes = pack.data.len(), "uploaded pack");
        }
        Err(e) => warn!(pack = %pack.id, blobs = pack.entries.len(), "pack upload failed: {e}"),
    }

    let mut state = session.state.lock();
    state.in_flight.remove(&pack.id);
    if let Err(e) = result {
        state
            .lost_blobs
            .extend(pack.entries.iter().map(PackTrailerEntry::handle));
        state.failed_uploads.push(e);
    }
    session.settled.notify_all();
}
