pub mod format;
pub mod pack;
pub mod snapshot;
pub mod tree;
mod write_session;

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blob::{BlobHandle, BlobType, PackedBlob};
use crate::compress::{self, Compression};
use crate::config::{ChunkerConfig, RepositoryOptions};
use crate::crypto::id::Id;
use crate::crypto::key::{EncryptedKey, MasterKey};
use crate::crypto::{engine_for, CryptoEngine, EncryptionMode, PlaintextEngine};
use crate::error::{CairnError, Result};
use crate::index::file::{IndexFile, IndexPack};
use crate::index::Index;
use crate::storage::{FileType, KeyIter, StorageBackend, CONFIG_KEY};
use crate::util::check_interrupted;

use self::format::{pack_object_with_context, unpack_object_expect_with_context, ObjectType};
use self::pack::{read_blob_from_pack, read_pack_trailer};
use self::snapshot::Snapshot;
use self::tree::Tree;
use self::write_session::SharedSession;

/// Repository format version written to the config.
pub const REPO_VERSION: u32 = 1;

/// Maximum number of blob records in one index file. Packs are never split
/// across files, so a single large pack may exceed this.
pub const MAX_BLOBS_PER_INDEX_FILE: usize = 50_000;

const CONFIG_OBJECT_CONTEXT: &[u8] = b"config";

/// Lazily produced object ids of one file type.
pub type IdIter<'a> = Box<dyn Iterator<Item = Result<Id>> + Send + 'a>;

/// Repository metadata, written once by `init` and stored encrypted at `config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: Id,
    pub chunker_params: ChunkerConfig,
    pub encryption: EncryptionMode,
    pub created: DateTime<Utc>,
}

/// Outcome of [`Repository::save_full_index`].
#[derive(Debug, Default)]
pub struct FullIndexSummary {
    /// New index files, all confirmed durable.
    pub written: Vec<Id>,
    /// Superseded files that were deleted.
    pub removed: Vec<Id>,
    /// Superseded files that could not be deleted, with the error.
    pub failed: Vec<(Id, String)>,
}

/// Loads verified blobs.
pub trait BlobLoader {
    fn load_blob(&self, blob_type: BlobType, id: Id, buf: &mut Vec<u8>) -> Result<usize>;
    fn lookup_blob_size(&self, blob_type: BlobType, id: Id) -> Result<u32>;
}

/// Stores blobs with deduplication.
pub trait BlobSaver {
    fn save_blob(&self, blob_type: BlobType, data: &[u8], id: Option<Id>) -> Result<Id>;
}

/// Enumerates stored objects of one file type.
pub trait Lister {
    fn list<'a>(&'a self, file_type: FileType, shutdown: Option<&'a AtomicBool>)
        -> Result<IdIter<'a>>;
}

/// Removes a whole repository.
pub trait Deleter {
    fn delete(&self, shutdown: Option<&AtomicBool>) -> Result<()>;
}

/// Handle to an open repository. All operations take `&self`, so an
/// `Arc<Repository>` can be shared by worker threads.
pub struct Repository {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoEngine>,
    config: RepoConfig,
    key_id: Option<Id>,
    options: RepositoryOptions,
    compression: Compression,
    index: Arc<Index>,
    session: Arc<SharedSession>,
}

impl Repository {
    /// Initialize a new repository: write the wrapped master key (if
    /// encrypted) and the config object.
    pub fn init(
        storage: Box<dyn StorageBackend>,
        encryption: EncryptionMode,
        chunker_params: ChunkerConfig,
        passphrase: Option<&str>,
        options: RepositoryOptions,
    ) -> Result<Self> {
        options.validate()?;
        chunker_params.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::from(storage);

        if storage.exists(CONFIG_KEY)? {
            return Err(CairnError::RepoAlreadyExists("config already present".into()));
        }

        let config = RepoConfig {
            version: REPO_VERSION,
            id: Id::random(),
            chunker_params,
            encryption,
            created: Utc::now(),
        };

        let (crypto, key_id): (Arc<dyn CryptoEngine>, Option<Id>) = match encryption {
            EncryptionMode::None => (Arc::new(PlaintextEngine), None),
            mode => {
                let pass = passphrase.ok_or_else(|| {
                    CairnError::Config("passphrase required for encrypted repository".into())
                })?;
                let master_key = MasterKey::generate();
                let encrypted = master_key.to_encrypted(pass, mode, &options.kdf)?;
                let key_bytes = rmp_serde::to_vec_named(&encrypted)?;
                let key_id = Id::compute(&key_bytes);
                storage.put(&FileType::Key.storage_key(&key_id), &key_bytes)?;
                (engine_for(mode, Some(&master_key))?, Some(key_id))
            }
        };

        let config_bytes = rmp_serde::to_vec_named(&config)?;
        let packed = pack_object_with_context(
            ObjectType::Config,
            CONFIG_OBJECT_CONTEXT,
            &config_bytes,
            crypto.as_ref(),
        )?;
        storage.put(CONFIG_KEY, &packed)?;
        debug!(repo = %config.id, mode = encryption.as_str(), "initialized repository");

        Ok(Self::assemble(storage, crypto, config, key_id, options))
    }

    /// Open an existing repository and load its index.
    pub fn open(
        storage: Box<dyn StorageBackend>,
        passphrase: Option<&str>,
        options: RepositoryOptions,
    ) -> Result<Self> {
        let repo = Self::open_without_index(storage, passphrase, options)?;
        repo.load_index(None)?;
        Ok(repo)
    }

    /// Open a repository without loading the index. Callers load it with
    /// [`Repository::load_index`] when they need it.
    pub fn open_without_index(
        storage: Box<dyn StorageBackend>,
        passphrase: Option<&str>,
        options: RepositoryOptions,
    ) -> Result<Self> {
        options.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::from(storage);

        let config_data = storage
            .get(CONFIG_KEY)?
            .ok_or_else(|| CairnError::RepoNotFound("config not found".into()))?;
        let (crypto, key_id, mode) = unlock(storage.as_ref(), passphrase)?;

        let config_bytes = unpack_object_expect_with_context(
            &config_data,
            ObjectType::Config,
            CONFIG_OBJECT_CONTEXT,
            crypto.as_ref(),
        )?;
        let config: RepoConfig = rmp_serde::from_slice(&config_bytes)?;
        if config.version != REPO_VERSION {
            return Err(CairnError::UnsupportedVersion(config.version));
        }
        if config.encryption != mode {
            return Err(CairnError::InvalidFormat(format!(
                "config encryption '{}' does not match key mode '{}'",
                config.encryption.as_str(),
                mode.as_str()
            )));
        }
        debug!(repo = %config.id, key = ?key_id, "opened repository");

        Ok(Self::assemble(storage, crypto, config, key_id, options))
    }

    fn assemble(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        config: RepoConfig,
        key_id: Option<Id>,
        options: RepositoryOptions,
    ) -> Self {
        let session = SharedSession::new(options.pack_size as usize, options.upload_concurrency);
        Self {
            storage,
            crypto,
            config,
            key_id,
            compression: options.compression(),
            options,
            index: Arc::new(Index::new()),
            session: Arc::new(session),
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Id of the key object used to unlock the repository.
    pub fn key_id(&self) -> Option<Id> {
        self.key_id
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    /// Replace the in-memory index. Pending packs are flushed into the old
    /// index first.
    pub fn set_index(&mut self, index: Index) -> Result<()> {
        self.flush()?;
        self.index = Arc::new(index);
        Ok(())
    }

    // --- Blob path ---

    /// Store a blob unless it is already indexed or pending in this session.
    /// Returns the blob id. A supplied `id` must match the content hash; the
    /// zero id means "compute it".
    pub fn save_blob(&self, blob_type: BlobType, data: &[u8], id: Option<Id>) -> Result<Id> {
        let computed = Id::compute(data);
        if let Some(id) = id.filter(|id| !id.is_zero()) {
            if id != computed {
                return Err(CairnError::Integrity {
                    object: BlobHandle::new(id, blob_type).to_string(),
                    detail: format!("content hashes to {computed}"),
                });
            }
        }
        let handle = BlobHandle::new(computed, blob_type);
        if self.index.has(&handle) || self.session.state.lock().contains(&handle) {
            return Ok(computed);
        }

        if data.len() as u64 > compress::MAX_DECOMPRESS_SIZE {
            return Err(CairnError::Other(format!(
                "blob {handle} is {} bytes, limit is {} bytes",
                data.len(),
                compress::MAX_DECOMPRESS_SIZE
            )));
        }
        let compressed = compress::compress(self.compression, data)?;
        let stored = pack_object_with_context(
            ObjectType::for_blob(blob_type),
            &computed.0,
            &compressed,
            self.crypto.as_ref(),
        )?;

        {
            let mut state = self.session.state.lock();
            // Another worker may have stored it meanwhile.
            if self.index.has(&handle) || state.contains(&handle) {
                return Ok(computed);
            }
            state.lost_blobs.remove(&handle);
            state.writer.add_blob(handle, &stored, data.len() as u32);
            if state.writer.should_flush() {
                self.session
                    .rotate(&mut state, &self.storage, &self.index, self.crypto.as_ref())?;
            }
        }
        self.session.cap_pending_uploads();
        Ok(computed)
    }

    /// Load a blob into `buf` and return its length. Every copy is verified
    /// against `id`; candidates that are missing or corrupt are skipped.
    pub fn load_blob(&self, blob_type: BlobType, id: Id, buf: &mut Vec<u8>) -> Result<usize> {
        let handle = BlobHandle::new(id, blob_type);

        // The session is checked before the index: an upload stores its
        // records before dropping the in-memory copy.
        let pending = self.session.state.lock().pending_blob(&handle);
        if let Some((entry, stored)) = pending {
            let plaintext = self.open_blob(&handle, &stored, entry.uncompressed_length, "pending pack")?;
            return Ok(fill(buf, plaintext));
        }

        let candidates = match self.index.lookup(&handle) {
            Ok(candidates) => candidates,
            Err(CairnError::BlobNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut corruption = None;
        for blob in &candidates {
            match self.read_packed_blob(blob) {
                Ok(Some(plaintext)) => return Ok(fill(buf, plaintext)),
                Ok(None) => debug!(blob = %handle, pack = %blob.pack_id, "pack missing, trying next copy"),
                Err(e) if e.is_corruption() => {
                    warn!(blob = %handle, "skipping corrupt copy: {e}");
                    corruption.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(corruption.unwrap_or(CairnError::BlobNotFound(handle)))
    }

    /// Uncompressed size of a blob, from the session or the index.
    pub fn lookup_blob_size(&self, blob_type: BlobType, id: Id) -> Result<u32> {
        let handle = BlobHandle::new(id, blob_type);
        if let Some((entry, _)) = self.session.state.lock().pending_blob(&handle) {
            return Ok(entry.uncompressed_length);
        }
        self.index
            .lookup(&handle)?
            .first()
            .map(|b| b.uncompressed_length)
            .ok_or(CairnError::BlobNotFound(handle))
    }

    fn read_packed_blob(&self, blob: &PackedBlob) -> Result<Option<Vec<u8>>> {
        let Some(stored) =
            read_blob_from_pack(self.storage.as_ref(), &blob.pack_id, blob.offset, blob.length)?
        else {
            return Ok(None);
        };
        if stored.len() != blob.length as usize {
            return Err(CairnError::Integrity {
                object: blob.handle.to_string(),
                detail: format!(
                    "{}: short read, {} of {} bytes",
                    blob.location(),
                    stored.len(),
                    blob.length
                ),
            });
        }
        self.open_blob(&blob.handle, &stored, blob.uncompressed_length, &blob.location())
            .map(Some)
    }

    /// Decrypt, decompress and verify one stored blob.
    fn open_blob(
        &self,
        handle: &BlobHandle,
        stored: &[u8],
        uncompressed_length: u32,
        location: &str,
    ) -> Result<Vec<u8>> {
        let compressed = unpack_object_expect_with_context(
            stored,
            ObjectType::for_blob(handle.blob_type),
            &handle.id.0,
            self.crypto.as_ref(),
        )
        .map_err(|e| match e {
            CairnError::DecryptionFailed => CairnError::Authentication {
                object: handle.to_string(),
                detail: format!("{location}: ciphertext rejected"),
            },
            other => CairnError::Integrity {
                object: handle.to_string(),
                detail: format!("{location}: {other}"),
            },
        })?;
        let plaintext = compress::decompress_with_hint(&compressed, Some(uncompressed_length as usize))
            .map_err(|e| CairnError::Integrity {
                object: handle.to_string(),
                detail: format!("{location}: {e}"),
            })?;
        let actual = Id::compute(&plaintext);
        if actual != handle.id {
            return Err(CairnError::Integrity {
                object: handle.to_string(),
                detail: format!("{location}: content hashes to {actual}"),
            });
        }
        Ok(plaintext)
    }

    /// Contents and total size of a pack, read from its tail only.
    pub fn list_pack(&self, pack_id: &Id) -> Result<(Vec<PackedBlob>, u64)> {
        let (entries, size) = read_pack_trailer(self.storage.as_ref(), pack_id, self.crypto.as_ref())?;
        let blobs = entries.iter().map(|e| e.to_packed_blob(*pack_id)).collect();
        Ok((blobs, size))
    }

    /// Ids of all stored objects of `file_type`, pulled one backend key at a
    /// time. Once `shutdown` is set the iterator yields `Interrupted` and ends.
    pub fn list<'a>(
        &'a self,
        file_type: FileType,
        shutdown: Option<&'a AtomicBool>,
    ) -> Result<IdIter<'a>> {
        if file_type == FileType::Config {
            return Err(CairnError::InvalidFormat(
                "the config object is not named by an id".into(),
            ));
        }
        check_interrupted(shutdown)?;
        let keys = self.storage.list(file_type.prefix())?;
        Ok(Box::new(ListIter {
            keys,
            file_type,
            shutdown,
            done: false,
        }))
    }

    /// Seal the open pack and wait for every upload issued so far.
    ///
    /// Blobs of a failed pack are no longer known. Every `flush` fails until
    /// each of them has been passed to `save_blob` again; the first call after
    /// a failure returns the upload error itself.
    pub fn flush(&self) -> Result<()> {
        {
            let mut state = self.session.state.lock();
            self.session
                .rotate(&mut state, &self.storage, &self.index, self.crypto.as_ref())?;
        }
        let mut failures = self.session.wait_all();
        if !failures.is_empty() {
            if failures.len() > 1 {
                warn!(count = failures.len(), "multiple pack uploads failed");
            }
            return Err(failures.remove(0));
        }
        let lost = self.session.state.lock().lost_blobs.len();
        if lost > 0 {
            return Err(CairnError::Backend(format!(
                "{lost} blob(s) from failed pack uploads have not been saved again"
            )));
        }
        Ok(())
    }

    // --- Unpacked objects ---

    /// Encrypt and store a single object. Its id is the hash of the stored bytes.
    pub fn save_unpacked(&self, file_type: FileType, plaintext: &[u8]) -> Result<Id> {
        self.store_unpacked(file_type, plaintext).map(|(id, _)| id)
    }

    fn store_unpacked(&self, file_type: FileType, plaintext: &[u8]) -> Result<(Id, u64)> {
        let obj_type = unpacked_object_type(file_type)?;
        let stored = pack_object_with_context(
            obj_type,
            file_type.as_str().as_bytes(),
            plaintext,
            self.crypto.as_ref(),
        )?;
        let id = Id::compute(&stored);
        self.storage.put(&file_type.storage_key(&id), &stored)?;
        Ok((id, stored.len() as u64))
    }

    /// Load, verify and decrypt a single object.
    pub fn load_and_decrypt(&self, file_type: FileType, id: &Id) -> Result<Vec<u8>> {
        let obj_type = unpacked_object_type(file_type)?;
        let key = file_type.storage_key(id);
        let stored = self
            .storage
            .get(&key)?
            .ok_or_else(|| CairnError::ObjectNotFound(key.clone()))?;
        let actual = Id::compute(&stored);
        if actual != *id {
            return Err(CairnError::Integrity {
                object: key,
                detail: format!("stored bytes hash to {actual}"),
            });
        }
        unpack_object_expect_with_context(
            &stored,
            obj_type,
            file_type.as_str().as_bytes(),
            self.crypto.as_ref(),
        )
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Id> {
        let bytes = rmp_serde::to_vec_named(snapshot)?;
        self.save_unpacked(FileType::Snapshot, &bytes)
    }

    pub fn load_snapshot(&self, id: &Id) -> Result<Snapshot> {
        let bytes = self.load_and_decrypt(FileType::Snapshot, id)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    // --- Trees ---

    pub fn save_tree(&self, tree: &Tree) -> Result<Id> {
        tree::save_tree(self, tree)
    }

    pub fn load_tree(&self, id: Id) -> Result<Tree> {
        tree::load_tree(self, id)
    }

    // --- Index persistence ---

    /// Write the packs recorded since the last save as one new index file.
    /// Returns `None` when there was nothing to write. Packs still uploading
    /// are not included; call [`Repository::flush`] first.
    pub fn save_index(&self) -> Result<Option<Id>> {
        let overlay = self.index.take_overlay();
        if overlay.is_empty() {
            return Ok(None);
        }
        let file = IndexFile {
            supersedes: Vec::new(),
            packs: overlay,
        };
        let stored = file
            .encode()
            .and_then(|bytes| self.store_unpacked(FileType::Index, &bytes));
        match stored {
            Ok((id, _)) => {
                self.index.mark_file_saved(id);
                debug!(file = %id, packs = file.packs.len(), blobs = file.blob_count(), "saved index file");
                Ok(Some(id))
            }
            Err(e) => {
                self.index.restore_overlay(file.packs);
                Err(e)
            }
        }
    }

    /// Merge every index file in the repository into the in-memory index.
    /// Files that fail to load are skipped and reported together as
    /// `IndexIncomplete` after the rest have been merged.
    pub fn load_index(&self, shutdown: Option<&AtomicBool>) -> Result<()> {
        let mut failed = Vec::new();
        let mut merged = 0usize;
        for id in self.list(FileType::Index, shutdown)? {
            let id = id?;
            if self.index.is_file_loaded(&id) {
                continue;
            }
            let file = self
                .load_and_decrypt(FileType::Index, &id)
                .and_then(|bytes| IndexFile::decode(&bytes));
            match file {
                Ok(file) => {
                    if self.index.merge_file(id, &file) {
                        merged += 1;
                    }
                }
                Err(e) => {
                    warn!(file = %id, "failed to load index file: {e}");
                    failed.push((id, e.to_string()));
                }
            }
        }
        debug!(files = merged, blobs = self.index.len(), "loaded index");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CairnError::IndexIncomplete(failed))
        }
    }

    /// Rewrite the whole in-memory index as a fresh set of index files, then
    /// delete the files it replaces. Old files are only touched once every
    /// new file is confirmed durable.
    pub fn save_full_index(&self, shutdown: Option<&AtomicBool>) -> Result<FullIndexSummary> {
        check_interrupted(shutdown)?;
        let rewrite = self.index.begin_full_rewrite();
        let supersedes: Vec<Id> = rewrite.old_files.iter().copied().collect();

        let mut written = Vec::new();
        if let Err(e) =
            self.write_full_index_files(rewrite.packs, &supersedes, shutdown, &mut written)
        {
            // Files already written hold records that are all in memory.
            for id in &written {
                self.index.mark_file_saved(*id);
            }
            self.index.restore_overlay(rewrite.overlay);
            return Err(e);
        }
        self.index.finish_full_rewrite(&written, &rewrite.old_files);

        let written_set: BTreeSet<Id> = written.iter().copied().collect();
        let mut summary = FullIndexSummary {
            written,
            ..Default::default()
        };
        for id in rewrite.old_files.difference(&written_set) {
            check_interrupted(shutdown)?;
            match self.storage.delete(&FileType::Index.storage_key(id)) {
                Ok(()) => {
                    self.index.forget_superseded(id);
                    summary.removed.push(*id);
                }
                Err(e) => {
                    warn!(file = %id, "failed to remove superseded index file: {e}");
                    summary.failed.push((*id, e.to_string()));
                }
            }
        }
        debug!(
            written = summary.written.len(),
            removed = summary.removed.len(),
            failed = summary.failed.len(),
            "rewrote full index"
        );
        Ok(summary)
    }

    fn write_full_index_files(
        &self,
        packs: Vec<IndexPack>,
        supersedes: &[Id],
        shutdown: Option<&AtomicBool>,
        written: &mut Vec<Id>,
    ) -> Result<()> {
        for file in full_index_files(packs, supersedes, MAX_BLOBS_PER_INDEX_FILE) {
            check_interrupted(shutdown)?;
            let (id, size) = self.store_unpacked(FileType::Index, &file.encode()?)?;
            let durable = self.storage.size(&FileType::Index.storage_key(&id))?;
            if durable != Some(size) {
                return Err(CairnError::Backend(format!(
                    "index file {id} not durable: wrote {size} bytes, found {durable:?}"
                )));
            }
            written.push(id);
        }
        Ok(())
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        let unflushed = self.session.state.lock().unflushed_blobs();
        if unflushed > 0 {
            warn!(blobs = unflushed, "repository dropped with unflushed blobs");
        }
        for e in self.session.wait_all() {
            warn!("pack upload failed: {e}");
        }
        let lost = self.session.state.lock().lost_blobs.len();
        if lost > 0 {
            warn!(blobs = lost, "repository dropped with blobs lost to failed uploads");
        }
    }
}

impl BlobLoader for Repository {
    fn load_blob(&self, blob_type: BlobType, id: Id, buf: &mut Vec<u8>) -> Result<usize> {
        Repository::load_blob(self, blob_type, id, buf)
    }

    fn lookup_blob_size(&self, blob_type: BlobType, id: Id) -> Result<u32> {
        Repository::lookup_blob_size(self, blob_type, id)
    }
}

impl BlobSaver for Repository {
    fn save_blob(&self, blob_type: BlobType, data: &[u8], id: Option<Id>) -> Result<Id> {
        Repository::save_blob(self, blob_type, data, id)
    }
}

impl Lister for Repository {
    fn list<'a>(
        &'a self,
        file_type: FileType,
        shutdown: Option<&'a AtomicBool>,
    ) -> Result<IdIter<'a>> {
        Repository::list(self, file_type, shutdown)
    }
}

impl Deleter for Repository {
    /// Remove every object of the repository. The config goes last so an
    /// interrupted delete still leaves a recognizable repository.
    fn delete(&self, shutdown: Option<&AtomicBool>) -> Result<()> {
        for file_type in [
            FileType::Snapshot,
            FileType::Index,
            FileType::Pack,
            FileType::Lock,
            FileType::Key,
        ] {
            let ids: Vec<Id> = self.list(file_type, shutdown)?.collect::<Result<_>>()?;
            for id in &ids {
                check_interrupted(shutdown)?;
                self.storage.delete(&file_type.storage_key(id))?;
            }
            debug!(kind = %file_type, count = ids.len(), "deleted objects");
        }
        check_interrupted(shutdown)?;
        self.storage.delete(CONFIG_KEY)
    }
}

struct ListIter<'a> {
    keys: KeyIter<'a>,
    file_type: FileType,
    shutdown: Option<&'a AtomicBool>,
    done: bool,
}

impl Iterator for ListIter<'_> {
    type Item = Result<Id>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Err(e) = check_interrupted(self.shutdown) {
                self.done = true;
                return Some(Err(e));
            }
            match self.keys.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(key)) => match self.file_type.parse_key(&key) {
                    Some(id) => return Some(Ok(id)),
                    None => debug!(key = %key, "skipping non-object key"),
                },
            }
        }
    }
}

/// Try each key object with `passphrase`. A repository without key objects
/// is unencrypted.
fn unlock(
    storage: &dyn StorageBackend,
    passphrase: Option<&str>,
) -> Result<(Arc<dyn CryptoEngine>, Option<Id>, EncryptionMode)> {
    let mut key_ids = Vec::new();
    for key in storage.list(FileType::Key.prefix())? {
        if let Some(id) = FileType::Key.parse_key(&key?) {
            key_ids.push(id);
        }
    }
    if key_ids.is_empty() {
        return Ok((Arc::new(PlaintextEngine), None, EncryptionMode::None));
    }
    let pass = passphrase.ok_or_else(|| {
        CairnError::Config("passphrase required for encrypted repository".into())
    })?;
    key_ids.sort();

    for id in key_ids {
        let Some(data) = storage.get(&FileType::Key.storage_key(&id))? else {
            continue;
        };
        let encrypted: EncryptedKey = match rmp_serde::from_slice(&data) {
            Ok(k) => k,
            Err(e) => {
                warn!(key = %id, "unreadable key object: {e}");
                continue;
            }
        };
        match MasterKey::from_encrypted(&encrypted, pass) {
            Ok(master_key) => {
                let engine = engine_for(encrypted.mode, Some(&master_key))?;
                return Ok((engine, Some(id), encrypted.mode));
            }
            Err(CairnError::DecryptionFailed) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(CairnError::DecryptionFailed)
}

fn unpacked_object_type(file_type: FileType) -> Result<ObjectType> {
    match file_type {
        FileType::Index => Ok(ObjectType::Index),
        FileType::Snapshot => Ok(ObjectType::Snapshot),
        FileType::Lock => Ok(ObjectType::Lock),
        other => Err(CairnError::InvalidFormat(format!(
            "{other} objects are not stored through the unpacked path"
        ))),
    }
}

/// Group packs into index files of at most `max_blobs` records, never
/// splitting a pack.
fn split_index_packs(packs: Vec<IndexPack>, max_blobs: usize) -> Vec<Vec<IndexPack>> {
    let mut files = Vec::new();
    let mut current: Vec<IndexPack> = Vec::new();
    let mut count = 0usize;
    for pack in packs {
        if !current.is_empty() && count + pack.blobs.len() > max_blobs {
            files.push(std::mem::take(&mut current));
            count = 0;
        }
        count += pack.blobs.len();
        current.push(pack);
    }
    if !current.is_empty() {
        files.push(current);
    }
    files
}

/// Split a full rewrite into index files. Only the last file names the
/// files it replaces, so a partially written set never announces them.
fn full_index_files(packs: Vec<IndexPack>, supersedes: &[Id], max_blobs: usize) -> Vec<IndexFile> {
    let mut files: Vec<IndexFile> = split_index_packs(packs, max_blobs)
        .into_iter()
        .map(|packs| IndexFile {
            supersedes: Vec::new(),
            packs,
        })
        .collect();
    if let Some(last) = files.last_mut() {
        last.supersedes = supersedes.to_vec();
    }
    files
}

fn fill(buf: &mut Vec<u8>, plaintext: Vec<u8>) -> usize {
    *buf = plaintext;
    buf.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::file::IndexBlob;

    fn pack_with(n: usize, byte: u8) -> IndexPack {
        IndexPack {
            id: Id([byte; 32]),
            blobs: (0..n)
                .map(|i| IndexBlob {
                    id: Id::compute(&[byte, i as u8]),
                    blob_type: BlobType::Data,
                    offset: i as u64,
                    length: 1,
                    uncompressed_length: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn split_never_breaks_a_pack() {
        let packs = vec![pack_with(3, 1), pack_with(3, 2), pack_with(5, 3), pack_with(1, 4)];
        let files = split_index_packs(packs, 6);
        let sizes: Vec<usize> = files
            .iter()
            .map(|f| f.iter().map(|p| p.blobs.len()).sum())
            .collect();
        assert_eq!(sizes, vec![6, 6]);
    }

    #[test]
    fn split_keeps_oversized_pack_alone() {
        let files = split_index_packs(vec![pack_with(1, 1), pack_with(9, 2)], 4);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1][0].blobs.len(), 9);
    }

    #[test]
    fn split_of_nothing_is_empty() {
        assert!(split_index_packs(Vec::new(), 10).is_empty());
    }

    #[test]
    fn only_last_full_index_file_names_replaced_files() {
        let old = vec![Id([9; 32]), Id([8; 32])];
        let packs = vec![pack_with(3, 1), pack_with(3, 2), pack_with(3, 3)];
        let files = full_index_files(packs, &old, 4);
        assert_eq!(files.len(), 3);
        assert!(files[0].supersedes.is_empty());
        assert!(files[1].supersedes.is_empty());
        assert_eq!(files[2].supersedes, old);
    }

    #[test]
    fn unpacked_path_rejects_packs_and_keys() {
        assert!(unpacked_object_type(FileType::Pack).is_err());
        assert!(unpacked_object_type(FileType::Key).is_err());
        assert!(unpacked_object_type(FileType::Config).is_err());
        assert_eq!(unpacked_object_type(FileType::Index).unwrap(), ObjectType::Index);
    }
}
