//! Filesystem-backed local cache
//!
//! Layout: `<root>/<key>.db`, plus a `<key>.db.partial` staging file while a
//! build is running. Installs go through a temp file and `rename` in the same
//! directory so readers never observe a half-written database.

use crate::error::CoreError;
use crate::models::CacheKey;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// SQLite sidecar suffixes removed together with a database file
const SIDECAR_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Local store of whole database files
pub trait LocalStore: Send + Sync {
    fn root(&self) -> &Path;

    /// Canonical path for `key`, whether or not it exists
    fn path_for(&self, key: &CacheKey) -> PathBuf;

    /// Path the acquisition tool writes to before install
    fn staging_path(&self, key: &CacheKey) -> PathBuf;

    /// Existing database for `key`
    fn get(&self, key: &CacheKey) -> Option<PathBuf>;

    /// Create the root and clear any stale staging file, returning the staging path
    fn prepare_staging(&self, key: &CacheKey) -> Result<PathBuf, CoreError>;

    /// Atomically install `source` as the database for `key`, replacing any existing one
    fn put(&self, key: &CacheKey, source: &Path) -> Result<PathBuf, CoreError>;

    /// Atomically install `bytes` as the database for `key`
    fn install_bytes(&self, key: &CacheKey, bytes: &[u8]) -> Result<PathBuf, CoreError>;

    /// Remove the database for `key`; absent is not an error
    fn evict(&self, key: &CacheKey) -> Result<(), CoreError>;

    /// Remove every cached and staging database, returning how many were removed
    fn clear(&self) -> Result<usize, CoreError>;
}

/// Local store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsLocalStore {
    root: PathBuf,
}

impl FsLocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ensure_root(&self) -> Result<(), CoreError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| CoreError::store_io(&self.root, "create cache directory", e))
    }

    fn temp_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!(".{}.tmp.{}", key.file_name(), std::process::id()))
    }
}

impl LocalStore for FsLocalStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    fn staging_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.partial", key.file_name()))
    }

    fn get(&self, key: &CacheKey) -> Option<PathBuf> {
        let path = self.path_for(key);
        if path.is_file() {
            Some(path)
        } else {
            None
        }
    }

    fn prepare_staging(&self, key: &CacheKey) -> Result<PathBuf, CoreError> {
        self.ensure_root()?;
        let staging = self.staging_path(key);
        remove_database_files(&staging)?;
        Ok(staging)
    }

    fn put(&self, key: &CacheKey, source: &Path) -> Result<PathBuf, CoreError> {
        self.ensure_root()?;
        let dest = self.path_for(key);

        if source.parent() == Some(self.root.as_path()) {
            fs::rename(source, &dest)
                .map_err(|e| CoreError::store_io(&dest, "install database", e))?;
        } else {
            let tmp = self.temp_path(key);
            fs::copy(source, &tmp).map_err(|e| CoreError::store_io(&tmp, "copy database", e))?;
            if let Err(e) = fs::rename(&tmp, &dest) {
                let _ = fs::remove_file(&tmp);
                return Err(CoreError::store_io(&dest, "install database", e));
            }
        }
        remove_sidecars(&dest);

        debug!(board = %key, path = %dest.display(), "Database installed");
        Ok(dest)
    }

    fn install_bytes(&self, key: &CacheKey, bytes: &[u8]) -> Result<PathBuf, CoreError> {
        self.ensure_root()?;
        let dest = self.path_for(key);
        let tmp = self.temp_path(key);

        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(CoreError::store_io(&tmp, "write database", e));
        }

        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(CoreError::store_io(&dest, "install database", e));
        }
        remove_sidecars(&dest);

        debug!(board = %key, bytes = bytes.len(), "Database installed from bytes");
        Ok(dest)
    }

    fn evict(&self, key: &CacheKey) -> Result<(), CoreError> {
        let path = self.path_for(key);
        remove_database_files(&path)?;
        debug!(board = %key, "Database evicted");
        Ok(())
    }

    fn clear(&self) -> Result<usize, CoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CoreError::store_io(&self.root, "list cache directory", e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry =
                entry.map_err(|e| CoreError::store_io(&self.root, "list cache directory", e))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".db") || name.ends_with(".db.partial") {
                remove_database_files(&path)?;
                removed += 1;
            }
        }

        debug!(root = %self.root.display(), removed, "Local cache cleared");
        Ok(removed)
    }
}

/// Remove a database file and its SQLite sidecars; absent files are fine
pub(crate) fn remove_database_files(path: &Path) -> Result<(), CoreError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(CoreError::store_io(path, "remove database", e)),
    }
    remove_sidecars(path);
    Ok(())
}

fn remove_sidecars(path: &Path) {
    for suffix in SIDECAR_SUFFIXES {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?sidecar, error = %e, "Failed to remove SQLite sidecar"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(board: &str) -> CacheKey {
        CacheKey::parse(board).unwrap()
    }

    #[test]
    fn test_get_absent() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));
        assert!(store.get(&key("aurora")).is_none());
    }

    #[test]
    fn test_install_bytes_then_get() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));

        let path = store.install_bytes(&key("Aurora"), b"payload").unwrap();
        assert_eq!(path, dir.path().join("dbs").join("aurora.db"));
        assert_eq!(store.get(&key("aurora")), Some(path.clone()));
        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_put_replaces_existing() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));
        store.install_bytes(&key("aurora"), b"old").unwrap();

        let staging = store.prepare_staging(&key("aurora")).unwrap();
        fs::write(&staging, b"new").unwrap();

        let path = store.put(&key("aurora"), &staging).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!staging.exists());
    }

    #[test]
    fn test_put_from_outside_root_copies() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));
        let source = dir.path().join("built.db");
        fs::write(&source, b"built").unwrap();

        let path = store.put(&key("decoy"), &source).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"built");
        assert!(source.exists());
    }

    #[test]
    fn test_evict_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));
        let path = store.install_bytes(&key("tension"), b"x").unwrap();
        fs::write(format!("{}-wal", path.display()), b"wal").unwrap();

        store.evict(&key("tension")).unwrap();
        store.evict(&key("tension")).unwrap();

        assert!(store.get(&key("tension")).is_none());
        assert!(!Path::new(&format!("{}-wal", path.display())).exists());
    }

    #[test]
    fn test_prepare_staging_removes_stale_partial() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));
        let staging = store.prepare_staging(&key("kilter")).unwrap();
        fs::write(&staging, b"stale").unwrap();

        let again = store.prepare_staging(&key("kilter")).unwrap();
        assert_eq!(again, staging);
        assert!(!staging.exists());
    }

    #[test]
    fn test_clear_counts_databases() {
        let dir = tempdir().unwrap();
        let store = FsLocalStore::new(dir.path().join("dbs"));
        store.install_bytes(&key("aurora"), b"a").unwrap();
        store.install_bytes(&key("kilter"), b"k").unwrap();
        fs::write(dir.path().join("dbs").join("notes.txt"), b"keep").unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(dir.path().join("dbs").join("notes.txt").exists());
        assert_eq!(FsLocalStore::new(dir.path().join("missing")).clear().unwrap(), 0);
    }
}
