// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Blob storage for index files.
//!
//! The index addresses every file by a `/`-separated key relative to some root.
//! [`FileStorage`] maps keys onto a local directory; [`MemoryStorage`] keeps them
//! in a map, which is what the tests use.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Named byte-blob storage.
pub trait Storage: Debug + Send + Sync {
    /// Read the whole blob at `key`.
    ///
    /// Returns [`Error::NotFound`] if there is no such blob.
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or replace the blob at `key`.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Whether a blob exists at `key`.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Copy a blob to a new key.
    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let bytes = self.read(from)?;
        self.write(to, &bytes)
    }
}

/// Storage rooted at a local directory.
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create a storage rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Fill a scratch file beside `key`'s path with `fill`, then rename it into
    /// place. Readers see either the old blob or the new one, never a partial one.
    fn replace(
        &self,
        key: &str,
        fill: impl FnOnce(&Path) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "no file name"))?;
        tmp.set_file_name(format!(
            "{name}.tmp.{}.{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let result = fill(&tmp).and_then(|()| std::fs::rename(&tmp, &path));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        std::fs::read(self.path(key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotFound(key.to_owned()),
            _ => Error::io(key, e),
        })
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.replace(key, |tmp| std::fs::write(tmp, bytes))
            .map_err(|e| Error::io(key, e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.path(key).try_exists().map_err(|e| Error::io(key, e))
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.path(from);
        if !source.try_exists().map_err(|e| Error::io(from, e))? {
            return Err(Error::NotFound(from.to_owned()));
        }
        self.replace(to, |tmp| std::fs::copy(&source, tmp).map(|_| ()))
            .map_err(|e| Error::io(to, e))
    }
}

/// In-memory storage. Clones share the same blobs.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    /// An empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every blob, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.blobs.read().clone()
    }

    /// Keys starting with `prefix`, in order.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Remove the blob at `key`, if any.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.write().remove(key)
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.write().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }
}
