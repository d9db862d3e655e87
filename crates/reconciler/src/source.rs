//! Source repositories holding declared artefact definitions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::is_within;

/// One candidate source definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceEntry {
    /// Registry-relative location, always starting with `/`.
    pub location: String,
    /// Backing path, used for extension routing.
    pub path: PathBuf,
}

impl SourceEntry {
    /// Create an entry.
    pub fn new(location: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            path: path.into(),
        }
    }
}

/// Discovery collaborator: enumerate entries and read their bytes.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Enumerate every entry whose location starts with `root`.
    ///
    /// A failure here is pass-fatal.
    async fn list(&self, root: &str) -> Result<Vec<SourceEntry>>;

    /// Read the raw bytes of one entry.
    async fn read(&self, entry: &SourceEntry) -> Result<Vec<u8>>;
}

/// Repository backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FileSystemRepository {
    base: PathBuf,
}

impl FileSystemRepository {
    /// Create a repository rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The directory backing this repository.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn location_of(base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?;
        let segments = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect_vec();
        Some(format!("/{}", segments.join("/")))
    }

    fn walk(base: &Path, root: &str) -> Result<Vec<SourceEntry>> {
        if !base.is_dir() {
            return Err(Error::source_unavailable(
                base.display().to_string(),
                "registry directory does not exist",
            ));
        }

        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&base.to_string_lossy())
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| Error::source_unavailable(base.display().to_string(), e.to_string()))?;

        let mut entries = Vec::new();
        for path in paths {
            let path =
                path.map_err(|e| Error::source_unavailable(base.display().to_string(), e.to_string()))?;
            if !path.is_file() {
                continue;
            }
            if let Some(location) = Self::location_of(base, &path) {
                if is_within(&location, root) {
                    entries.push(SourceEntry::new(location, path));
                }
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[async_trait]
impl SourceRepository for FileSystemRepository {
    async fn list(&self, root: &str) -> Result<Vec<SourceEntry>> {
        let base = self.base.clone();
        let root = root.to_string();
        let entries = tokio::task::spawn_blocking(move || Self::walk(&base, &root))
            .await
            .map_err(|e| Error::source_unavailable(self.base.display().to_string(), e.to_string()))??;
        debug!(base = %self.base.display(), entries = entries.len(), "Listed registry");
        Ok(entries)
    }

    async fn read(&self, entry: &SourceEntry) -> Result<Vec<u8>> {
        tokio::fs::read(&entry.path)
            .await
            .map_err(|e| Error::source_unavailable(&entry.location, e.to_string()))
    }
}

/// In-memory repository for tests and embedding.
#[derive(Default)]
pub struct InMemoryRepository {
    documents: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub async fn put(&self, location: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.documents
            .write()
            .await
            .insert(location.into(), content.into());
    }

    /// Remove a document. Returns whether it existed.
    pub async fn remove(&self, location: &str) -> bool {
        self.documents.write().await.remove(location).is_some()
    }

    /// Simulate an unreachable repository.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceRepository for InMemoryRepository {
    async fn list(&self, root: &str) -> Result<Vec<SourceEntry>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::source_unavailable(root, "repository unavailable"));
        }
        Ok(self
            .documents
            .read()
            .await
            .keys()
            .filter(|location| is_within(location, root))
            .map(|location| SourceEntry::new(location.clone(), location.clone()))
            .collect_vec())
    }

    async fn read(&self, entry: &SourceEntry) -> Result<Vec<u8>> {
        self.documents
            .read()
            .await
            .get(&entry.location)
            .cloned()
            .ok_or_else(|| Error::source_unavailable(&entry.location, "document not found"))
    }
}
