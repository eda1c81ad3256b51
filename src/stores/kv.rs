//! Byte-granular key-value storage.
//!
//! `DiskKv` keeps one file per key, sharded into directories by key prefix
//! path segments. Each value file carries magic bytes, a format version, and
//! a trailing CRC32 so torn writes surface as corruption instead of bad
//! state. The store directory is locked exclusively for the process.

use crate::error::{RepositoryError, Result};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for value files.
const VALUE_MAGIC: &[u8; 4] = b"KVS\0";

/// Current value file format version.
const VALUE_VERSION: u8 = 1;

/// Minimal storage contract the repository's stores build on.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn del(&self, key: &str) -> Result<()>;

    /// All keys under a prefix, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// File-per-key store rooted at a directory.
pub struct DiskKv {
    path: PathBuf,
    _lock_file: File,
}

impl DiskKv {
    /// Open or create a store at `path`, taking an exclusive lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| RepositoryError::Locked)?;

        Ok(Self {
            path,
            _lock_file: lock_file,
        })
    }

    fn value_path(&self, key: &str) -> PathBuf {
        // Key segments map to directories; the last segment is the file.
        self.path.join(key)
    }
}

impl KvStore for DiskKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value_path = self.value_path(key);
        if !value_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&value_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != VALUE_MAGIC {
            return Err(RepositoryError::InvalidFormat(format!(
                "invalid value magic for key {key}"
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != VALUE_VERSION {
            return Err(RepositoryError::InvalidFormat(format!(
                "unsupported value version: {}",
                version[0]
            )));
        }

        let mut rest = Vec::new();
        file.read_to_end(&mut rest)?;
        if rest.len() < 4 {
            return Err(RepositoryError::Corruption(format!(
                "truncated value for key {key}"
            )));
        }
        let (value, checksum_bytes) = rest.split_at(rest.len() - 4);
        let stored_checksum = u32::from_le_bytes([
            checksum_bytes[0],
            checksum_bytes[1],
            checksum_bytes[2],
            checksum_bytes[3],
        ]);
        let computed_checksum = crc32fast::hash(value);
        if stored_checksum != computed_checksum {
            return Err(RepositoryError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(Some(value.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let value_path = self.value_path(key);
        if let Some(parent) = value_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&value_path)?;
        file.write_all(VALUE_MAGIC)?;
        file.write_all(&[VALUE_VERSION])?;
        file.write_all(value)?;
        file.write_all(&crc32fast::hash(value).to_le_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        let value_path = self.value_path(key);
        if value_path.exists() {
            fs::remove_file(value_path)?;
        }
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        collect_keys(&self.path, &self.path, &mut out)?;
        out.retain(|k| k.starts_with(prefix));
        out.sort();
        Ok(out)
    }
}

fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_keys(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key = relative.to_string_lossy().replace('\\', "/");
            if key != "LOCK" {
                out.push(key);
            }
        }
    }
    Ok(())
}
