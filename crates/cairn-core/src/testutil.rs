use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::{ChunkerConfig, KdfConfig, RepositoryOptions};
use crate::crypto::EncryptionMode;
use crate::error::{CairnError, Result};
use crate::repo::Repository;
use crate::storage::{KeyIter, StorageBackend};

pub const TEST_PASSPHRASE: &str = "correct horse battery staple";

/// In-memory storage backend for testing.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored under `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.data
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Overwrite one byte of a stored object.
    pub fn corrupt_byte(&self, key: &str, offset: usize) {
        let mut map = self.data.lock();
        let data = map.get_mut(key).expect("object to corrupt");
        data[offset] ^= 0xFF;
    }

    pub fn remove(&self, key: &str) {
        self.data.lock().remove(key);
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock();
        Ok(map.get(key).map(|data| {
            let start = (offset as usize).min(data.len());
            let end = start.saturating_add(length as usize).min(data.len());
            data[start..end].to_vec()
        }))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().contains_key(key))
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.data.lock().get(key).map(|d| d.len() as u64))
    }

    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        Ok(Box::new(self.keys(prefix).into_iter().map(Ok)))
    }
}

/// Shared handle to inspect which keys were written via `put()`.
#[derive(Clone, Default)]
pub struct PutLog(Arc<Mutex<Vec<String>>>);

impl PutLog {
    /// Keys written since the last `clear()`.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn record(&self, key: &str) {
        self.0.lock().push(key.to_string());
    }
}

/// Storage wrapper that records which keys were passed to `put()`.
pub struct RecordingBackend {
    inner: MemoryBackend,
    log: PutLog,
}

impl RecordingBackend {
    pub fn new() -> (Self, PutLog) {
        let log = PutLog::default();
        (
            Self {
                inner: MemoryBackend::new(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl StorageBackend for RecordingBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.log.record(key);
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.size(key)
    }
    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        self.inner.list(prefix)
    }
}

/// Memory backend whose `put` or `delete` fail for keys under a prefix.
#[derive(Default)]
pub struct FaultyBackend {
    pub inner: MemoryBackend,
    fail_put: Mutex<Option<String>>,
    fail_delete: Mutex<Option<String>>,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, prefix: Option<&str>) {
        *self.fail_put.lock() = prefix.map(str::to_string);
    }

    pub fn fail_deletes(&self, prefix: Option<&str>) {
        *self.fail_delete.lock() = prefix.map(str::to_string);
    }

    fn check(rule: &Mutex<Option<String>>, op: &str, key: &str) -> Result<()> {
        match rule.lock().as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                Err(CairnError::Backend(format!("injected {op} failure for '{key}'")))
            }
            _ => Ok(()),
        }
    }
}

impl StorageBackend for FaultyBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        Self::check(&self.fail_put, "put", key)?;
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        Self::check(&self.fail_delete, "delete", key)?;
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.size(key)
    }
    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        self.inner.list(prefix)
    }
}

/// Memory backend that counts how many keys listing iterators have produced.
#[derive(Default)]
pub struct CountingListBackend {
    pub inner: MemoryBackend,
    pub pulled: Arc<AtomicUsize>,
}

impl StorageBackend for CountingListBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.size(key)
    }
    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        let pulled = Arc::clone(&self.pulled);
        Ok(Box::new(self.inner.list(prefix)?.inspect(move |_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        })))
    }
}

/// Memory backend that holds pack uploads until `release()` is called.
#[derive(Default)]
pub struct GatedBackend {
    pub inner: MemoryBackend,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl StorageBackend for GatedBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if key.starts_with("data/") {
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.size(key)
    }
    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        self.inner.list(prefix)
    }
}

/// Small packs and a cheap KDF so tests stay fast.
pub fn test_options() -> RepositoryOptions {
    RepositoryOptions {
        pack_size: 64 * 1024,
        kdf: KdfConfig {
            time_cost: 1,
            memory_cost: 8,
            parallelism: 1,
        },
        ..RepositoryOptions::default()
    }
}

/// Create a plaintext repository on `storage`.
pub fn init_plaintext(storage: Arc<dyn StorageBackend>) -> Repository {
    Repository::init(
        Box::new(storage),
        EncryptionMode::None,
        ChunkerConfig::default(),
        None,
        test_options(),
    )
    .expect("failed to init test repo")
}

/// Create an encrypted repository on `storage`, unlocked by [`TEST_PASSPHRASE`].
pub fn init_encrypted(storage: Arc<dyn StorageBackend>, mode: EncryptionMode) -> Repository {
    Repository::init(
        Box::new(storage),
        mode,
        ChunkerConfig::default(),
        Some(TEST_PASSPHRASE),
        test_options(),
    )
    .expect("failed to init encrypted test repo")
}

/// Open `storage` as a fresh session and load its index.
pub fn reopen(storage: Arc<dyn StorageBackend>, passphrase: Option<&str>) -> Repository {
    Repository::open(Box::new(storage), passphrase, test_options()).expect("failed to reopen")
}

/// A plaintext repository backed by its own `MemoryBackend`.
pub fn test_repo_plaintext() -> (Repository, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (init_plaintext(backend.clone()), backend)
}

/// An AES-256-GCM repository backed by its own `MemoryBackend`.
pub fn test_repo_encrypted() -> (Repository, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (init_encrypted(backend.clone(), EncryptionMode::Aes256Gcm), backend)
}
