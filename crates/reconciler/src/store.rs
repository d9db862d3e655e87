//! Persisted artefact store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Artefact, ArtefactKey, is_within};

/// Trait for artefact persistence backends.
///
/// Upserts are keyed by [`ArtefactKey`]; the surrogate id is assigned on
/// first insert and carried over on every later save. Audit fields are
/// owned by the store.
#[async_trait]
pub trait ArtefactStore: Send + Sync {
    /// Find an artefact by key.
    async fn find_by_key(&self, key: &ArtefactKey) -> Result<Option<Artefact>>;

    /// All artefacts of a type located inside `scope`.
    async fn find_all(&self, artefact_type: &str, scope: &str) -> Result<Vec<Artefact>>;

    /// Insert or update by key, returning the stored record.
    async fn save(&self, artefact: &Artefact) -> Result<Artefact>;

    /// Delete by key. Returns whether a record existed.
    async fn delete(&self, key: &ArtefactKey) -> Result<bool>;
}

/// In-memory store for tests and single-process deployments.
pub struct InMemoryArtefactStore {
    artefacts: RwLock<HashMap<ArtefactKey, Artefact>>,
    actor: String,
}

impl InMemoryArtefactStore {
    /// Create an empty store recording `actor` in audit fields.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            artefacts: RwLock::new(HashMap::new()),
            actor: actor.into(),
        }
    }

    /// Number of stored artefacts.
    pub async fn len(&self) -> usize {
        self.artefacts.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.artefacts.read().await.is_empty()
    }

    /// Seed the store with already persisted records.
    pub async fn load(&self, records: Vec<Artefact>) {
        let mut artefacts = self.artefacts.write().await;
        for record in records {
            artefacts.insert(record.key.clone(), record);
        }
    }

    /// Put back the record held for `key` before a failed mutation.
    pub async fn restore(&self, key: &ArtefactKey, previous: Option<Artefact>) {
        let mut artefacts = self.artefacts.write().await;
        match previous {
            Some(record) => {
                artefacts.insert(key.clone(), record);
            }
            None => {
                artefacts.remove(key);
            }
        }
    }

    /// Every stored record, ordered by key.
    pub async fn snapshot(&self) -> Vec<Artefact> {
        self.artefacts
            .read()
            .await
            .values()
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .cloned()
            .collect_vec()
    }
}

impl Default for InMemoryArtefactStore {
    fn default() -> Self {
        Self::new("system")
    }
}

#[async_trait]
impl ArtefactStore for InMemoryArtefactStore {
    async fn find_by_key(&self, key: &ArtefactKey) -> Result<Option<Artefact>> {
        Ok(self.artefacts.read().await.get(key).cloned())
    }

    async fn find_all(&self, artefact_type: &str, scope: &str) -> Result<Vec<Artefact>> {
        Ok(self
            .artefacts
            .read()
            .await
            .values()
            .filter(|a| a.artefact_type == artefact_type && is_within(&a.location, scope))
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .cloned()
            .collect_vec())
    }

    async fn save(&self, artefact: &Artefact) -> Result<Artefact> {
        let now = Utc::now();
        let mut artefacts = self.artefacts.write().await;
        let mut record = artefact.clone();

        match artefacts.get(&artefact.key) {
            Some(existing) => {
                record.id = existing.id;
                record.created_by = existing.created_by.clone();
                record.created_at = existing.created_at;
            }
            None => {
                record.id = Some(record.id.unwrap_or_default());
                record.created_by = Some(self.actor.clone());
                record.created_at = Some(now);
            }
        }
        record.updated_by = Some(self.actor.clone());
        record.updated_at = Some(now);

        artefacts.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, key: &ArtefactKey) -> Result<bool> {
        Ok(self.artefacts.write().await.remove(key).is_some())
    }
}

/// Store persisted as a JSON array in a single file.
///
/// The whole file is rewritten after every mutation, through a temporary
/// file and a rename. A mutation whose write fails is rolled back, so the
/// records served always match the file.
pub struct JsonFileArtefactStore {
    path: PathBuf,
    inner: InMemoryArtefactStore,
    write_lock: Mutex<()>,
}

impl JsonFileArtefactStore {
    /// Open the store at `path`, loading existing records if the file exists.
    ///
    /// # Errors
    ///
    /// Returns `StoreFailed` if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>, actor: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let inner = InMemoryArtefactStore::new(actor);

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<Artefact> = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::store_failed("open", format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), records = records.len(), "Loaded artefact state");
                inner.load(records).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No artefact state yet");
            }
            Err(e) => {
                return Err(Error::store_failed("open", format!("{}: {e}", path.display())));
            }
        }

        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current records. Callers hold `write_lock`.
    async fn flush(&self, operation: &str) -> Result<()> {
        let records = self.inner.snapshot().await;
        let json = serde_json::to_vec_pretty(&records)
            .map_err(|e| Error::store_failed(operation, e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store_failed(operation, format!("{}: {e}", parent.display())))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::store_failed(operation, format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::store_failed(operation, format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl ArtefactStore for JsonFileArtefactStore {
    async fn find_by_key(&self, key: &ArtefactKey) -> Result<Option<Artefact>> {
        self.inner.find_by_key(key).await
    }

    async fn find_all(&self, artefact_type: &str, scope: &str) -> Result<Vec<Artefact>> {
        self.inner.find_all(artefact_type, scope).await
    }

    async fn save(&self, artefact: &Artefact) -> Result<Artefact> {
        let _guard = self.write_lock.lock().await;
        let previous = self.inner.find_by_key(&artefact.key).await?;
        let record = self.inner.save(artefact).await?;
        if let Err(e) = self.flush("save").await {
            warn!(key = %artefact.key, error = %e, "Rolling back unsaved artefact");
            self.inner.restore(&artefact.key, previous).await;
            return Err(e);
        }
        Ok(record)
    }

    async fn delete(&self, key: &ArtefactKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.inner.find_by_key(key).await? else {
            return Ok(false);
        };
        self.inner.delete(key).await?;
        if let Err(e) = self.flush("delete").await {
            warn!(key = %key, error = %e, "Rolling back undeleted artefact");
            self.inner.restore(key, Some(previous)).await;
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_assigns_id_and_audit_fields() {
        let store = InMemoryArtefactStore::new("tester");
        let saved = store.save(&Artefact::new("role", "/a.role", b"{}")).await;
        assert!(saved.is_ok());
        let saved = saved.ok();
        assert!(saved.as_ref().and_then(|a| a.id).is_some());
        assert_eq!(
            saved.as_ref().and_then(|a| a.created_by.clone()).as_deref(),
            Some("tester")
        );
        assert!(saved.and_then(|a| a.updated_at).is_some());
    }

    #[tokio::test]
    async fn test_upsert_by_key_keeps_surrogate_id() {
        let store = InMemoryArtefactStore::default();
        let first = store
            .save(&Artefact::new("role", "/a.role", b"v1"))
            .await
            .ok()
            .and_then(|a| a.id);

        // A freshly parsed artefact has no id; the store must not mint a new one.
        let second = store
            .save(&Artefact::new("role", "/a.role", b"v2"))
            .await
            .ok()
            .and_then(|a| a.id);

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_all_filters_type_and_prefix() {
        let store = InMemoryArtefactStore::default();
        for (ty, loc) in [
            ("role", "/p1/a.role"),
            ("role", "/p2/b.role"),
            ("role", "/p10/d.role"),
            ("job", "/p1/c.job"),
        ] {
            let _ = store.save(&Artefact::new(ty, loc, b"")).await;
        }

        let roles = store.find_all("role", "/p1").await.unwrap_or_default();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles.first().map(|a| a.name.as_str()), Some("a"));

        let all_roles = store.find_all("role", "").await.unwrap_or_default();
        assert_eq!(all_roles.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = InMemoryArtefactStore::default();
        let artefact = Artefact::new("role", "/a.role", b"");
        let _ = store.save(&artefact).await;

        assert_eq!(store.delete(&artefact.key).await.ok(), Some(true));
        assert_eq!(store.delete(&artefact.key).await.ok(), Some(false));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir();
        assert!(dir.is_ok());
        let Ok(dir) = dir else { return };
        let path = dir.path().join("state").join("artefacts.json");

        let store = JsonFileArtefactStore::open(&path, "tester").await;
        assert!(store.is_ok());
        let Ok(store) = store else { return };
        let artefact = Artefact::new("role", "/a.role", b"{}");
        let id = store.save(&artefact).await.ok().and_then(|a| a.id);

        let reopened = JsonFileArtefactStore::open(&path, "tester").await;
        let found = match reopened {
            Ok(s) => s.find_by_key(&artefact.key).await.ok().flatten(),
            Err(_) => None,
        };
        assert_eq!(found.and_then(|a| a.id), id);
    }

    #[tokio::test]
    async fn test_json_file_store_rolls_back_when_state_is_unwritable() {
        let dir = tempfile::tempdir();
        assert!(dir.is_ok());
        let Ok(dir) = dir else { return };
        let state_dir = dir.path().join("state");
        assert!(std::fs::create_dir_all(&state_dir).is_ok());

        let store = JsonFileArtefactStore::open(state_dir.join("artefacts.json"), "tester").await;
        assert!(store.is_ok());
        let Ok(store) = store else { return };
        let kept = Artefact::new("role", "/kept.role", b"{}");
        assert!(store.save(&kept).await.is_ok());

        // Replace the state directory with a plain file.
        assert!(std::fs::remove_dir_all(&state_dir).is_ok());
        assert!(std::fs::write(&state_dir, b"blocker").is_ok());

        let fresh = Artefact::new("role", "/fresh.role", b"{}");
        assert!(matches!(store.save(&fresh).await, Err(Error::StoreFailed { .. })));
        assert!(store.find_by_key(&fresh.key).await.ok().flatten().is_none());

        let changed = kept.clone().with_description("changed");
        assert!(store.save(&changed).await.is_err());
        let current = store.find_by_key(&kept.key).await.ok().flatten();
        assert_eq!(current.as_ref().and_then(|a| a.description.clone()), None);

        assert!(matches!(store.delete(&kept.key).await, Err(Error::StoreFailed { .. })));
        assert!(store.find_by_key(&kept.key).await.ok().flatten().is_some());
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir();
        assert!(dir.is_ok());
        let Ok(dir) = dir else { return };
        let path = dir.path().join("artefacts.json");
        assert!(std::fs::write(&path, b"not json").is_ok());

        let result = JsonFileArtefactStore::open(&path, "tester").await;
        assert!(matches!(result, Err(Error::StoreFailed { .. })));
    }
}
