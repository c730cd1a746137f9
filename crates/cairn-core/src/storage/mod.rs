pub mod local_backend;

use std::fmt;
use std::sync::Arc;

use crate::crypto::id::Id;
use crate::error::Result;

/// Lazily produced storage keys. Each `next()` may perform backend I/O.
pub type KeyIter<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

/// Key/value object store the repository is layered on.
///
/// Keys are `/`-separated relative paths. Missing objects are reported as
/// `Ok(None)` / `Ok(false)` rather than errors.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read `length` bytes at `offset`. A read past the end returns the
    /// available bytes; callers check the length.
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Stored size of an object.
    fn size(&self, key: &str) -> Result<Option<u64>>;

    /// All object keys under `prefix`, recursively.
    fn list(&self, prefix: &str) -> Result<KeyIter<'_>>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        (**self).get_range(key, offset, length)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }
    fn size(&self, key: &str) -> Result<Option<u64>> {
        (**self).size(key)
    }
    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        (**self).list(prefix)
    }
}

/// Kinds of objects stored in a repository, each under its own key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Pack,
    Index,
    Key,
    Lock,
    Snapshot,
    Config,
}

pub const CONFIG_KEY: &str = "config";

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::Pack,
        FileType::Index,
        FileType::Key,
        FileType::Lock,
        FileType::Snapshot,
        FileType::Config,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Pack => "pack",
            FileType::Index => "index",
            FileType::Key => "key",
            FileType::Lock => "lock",
            FileType::Snapshot => "snapshot",
            FileType::Config => "config",
        }
    }

    /// Listing prefix for this file type.
    pub fn prefix(self) -> &'static str {
        match self {
            FileType::Pack => "data/",
            FileType::Index => "index/",
            FileType::Key => "keys/",
            FileType::Lock => "locks/",
            FileType::Snapshot => "snapshots/",
            FileType::Config => CONFIG_KEY,
        }
    }

    /// Storage key for object `id`. Packs are sharded by their first byte;
    /// the config is a singleton and ignores `id`.
    pub fn storage_key(self, id: &Id) -> String {
        match self {
            FileType::Pack => format!("data/{}/{}", id.shard_prefix(), id.to_hex()),
            FileType::Config => CONFIG_KEY.to_string(),
            other => format!("{}{}", other.prefix(), id.to_hex()),
        }
    }

    /// Recover the id from a listed key. Returns `None` for keys that do not
    /// belong to this file type or are not named by an id.
    pub fn parse_key(self, key: &str) -> Option<Id> {
        if self == FileType::Config {
            return None;
        }
        let rest = key.strip_prefix(self.prefix())?;
        let name = match self {
            FileType::Pack => {
                let (shard, name) = rest.split_once('/')?;
                if shard.len() != 2 || !name.starts_with(shard) {
                    return None;
                }
                name
            }
            _ => rest,
        };
        Id::from_hex(name).ok()
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_keys_are_sharded() {
        let id = Id([0xAB; 32]);
        let key = FileType::Pack.storage_key(&id);
        assert_eq!(key, format!("data/ab/{}", id.to_hex()));
        assert_eq!(FileType::Pack.parse_key(&key), Some(id));
    }

    #[test]
    fn flat_keys_roundtrip() {
        let id = Id::compute(b"x");
        for ft in [
            FileType::Index,
            FileType::Key,
            FileType::Lock,
            FileType::Snapshot,
        ] {
            let key = ft.storage_key(&id);
            assert!(key.starts_with(ft.prefix()));
            assert_eq!(ft.parse_key(&key), Some(id));
        }
    }

    #[test]
    fn parse_key_rejects_foreign_keys() {
        let id = Id::compute(b"x");
        assert_eq!(FileType::Index.parse_key("index/readme.txt"), None);
        assert_eq!(
            FileType::Index.parse_key(&FileType::Snapshot.storage_key(&id)),
            None
        );
        // wrong shard directory
        assert_eq!(
            FileType::Pack.parse_key(&format!("data/zz/{}", id.to_hex())),
            None
        );
        assert_eq!(FileType::Config.parse_key(CONFIG_KEY), None);
    }

    #[test]
    fn config_key_is_singleton() {
        assert_eq!(FileType::Config.storage_key(&Id::compute(b"a")), "config");
    }
}
