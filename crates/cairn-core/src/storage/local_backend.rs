use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{CairnError, Result};
use crate::storage::{KeyIter, StorageBackend};

/// Storage backend for a local directory using `std::fs` directly.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        Ok(Self {
            root: fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject storage keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CairnError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        if Path::new(key)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe storage key: parent traversal '{key}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write to a temp file in the target directory, then rename into place,
    /// so readers never observe a partial object.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(length as usize);
        file.take(length).read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        match self.atomic_write(&path, data) {
            Err(CairnError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.atomic_write(&path, data)
            }
            other => other,
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.size(key)?.is_some())
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<KeyIter<'_>> {
        let trimmed = prefix.trim_end_matches('/');
        let dir = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.resolve(trimmed)?
        };
        let mut pending = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => pending.push(fs::read_dir(&dir)?),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Box::new(LocalKeyIter {
            root: &self.root,
            pending,
        }))
    }
}

/// Depth-first directory walk that reads one directory entry per step.
struct LocalKeyIter<'a> {
    root: &'a Path,
    pending: Vec<fs::ReadDir>,
}

impl LocalKeyIter<'_> {
    /// Convert an absolute path to a `/`-separated key relative to the root.
    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

impl Iterator for LocalKeyIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dir = self.pending.last_mut()?;
            let entry = match dir.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Some(Err(e.into())),
                None => {
                    self.pending.pop();
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => return Some(Err(e.into())),
            };
            let path = entry.path();
            if file_type.is_dir() {
                match fs::read_dir(&path) {
                    Ok(rd) => self.pending.push(rd),
                    Err(e) => return Some(Err(e.into())),
                }
            } else if file_type.is_file() {
                match self.key_for(&path) {
                    Some(key) => return Some(Ok(key)),
                    None => debug!(path = %path.display(), "skipping non-utf8 storage path"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("").is_err());
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("\\Windows\\System32").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("data/../../etc/passwd").is_err());
        assert!(LocalBackend::validate_key("data/ab/abcdef").is_ok());
    }

    #[test]
    fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();

        assert_eq!(backend.get("index/aa").unwrap(), None);
        backend.put("index/aa", b"hello").unwrap();
        assert_eq!(backend.get("index/aa").unwrap().unwrap(), b"hello");
        assert!(backend.exists("index/aa").unwrap());
        assert_eq!(backend.size("index/aa").unwrap(), Some(5));

        backend.delete("index/aa").unwrap();
        assert!(!backend.exists("index/aa").unwrap());
        // deleting twice is not an error
        backend.delete("index/aa").unwrap();
    }

    #[test]
    fn get_range_reads_slice_and_truncates_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("data/00/obj", b"0123456789").unwrap();

        assert_eq!(
            backend.get_range("data/00/obj", 2, 3).unwrap().unwrap(),
            b"234"
        );
        assert_eq!(
            backend.get_range("data/00/obj", 8, 10).unwrap().unwrap(),
            b"89"
        );
        assert_eq!(backend.get_range("data/00/missing", 0, 1).unwrap(), None);
    }

    #[test]
    fn list_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("data/00/a", b"1").unwrap();
        backend.put("data/01/b", b"2").unwrap();
        backend.put("index/c", b"3").unwrap();

        let mut keys: Vec<String> = backend
            .list("data/")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["data/00/a".to_string(), "data/01/b".to_string()]);

        let all: Vec<String> = backend.list("").unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert_eq!(backend.list("snapshots/").unwrap().count(), 0);
    }
}
