//! Shared fixtures for reconciler integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use artesync_reconciler::{
    Artefact, ArtefactKey, ArtefactPhase, ArtefactStore, DepleterConfig, DocumentSynchronizer,
    Error, InMemoryArtefactStore, InMemoryRepository, PhaseExecutor, ProcessorBuilder,
    ProcessorConfig, Result, SynchronizationProcessor,
};

/// Executor that journals every successful phase and rejects chosen names.
#[derive(Default)]
pub struct RecordingExecutor {
    journal: Mutex<Vec<(String, ArtefactPhase)>>,
    rejected: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingExecutor {
    pub async fn reject(&self, name: &str) {
        self.rejected.lock().await.insert(name.to_string());
    }

    pub async fn accept_all(&self) {
        self.rejected.lock().await.clear();
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    pub async fn journal(&self) -> Vec<(String, ArtefactPhase)> {
        self.journal.lock().await.clone()
    }

    /// Names applied in `phase`, in application order.
    pub async fn applied(&self, phase: ArtefactPhase) -> Vec<String> {
        self.journal
            .lock()
            .await
            .iter()
            .filter(|(_, p)| *p == phase)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl PhaseExecutor for RecordingExecutor {
    async fn execute(&self, artefact: &Artefact, phase: ArtefactPhase) -> Result<()> {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejected.lock().await.contains(&artefact.name) {
            return Err(Error::apply_failed(
                artefact.key.as_str(),
                phase,
                "rejected by downstream engine",
            ));
        }
        self.journal
            .lock()
            .await
            .push((artefact.name.clone(), phase));
        Ok(())
    }
}

/// In-memory store that can be switched into an outage.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryArtefactStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::store_failed(operation, "database unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtefactStore for FlakyStore {
    async fn find_by_key(&self, key: &ArtefactKey) -> Result<Option<Artefact>> {
        self.check("find_by_key")?;
        self.inner.find_by_key(key).await
    }

    async fn find_all(&self, artefact_type: &str, scope: &str) -> Result<Vec<Artefact>> {
        self.check("find_all")?;
        self.inner.find_all(artefact_type, scope).await
    }

    async fn save(&self, artefact: &Artefact) -> Result<Artefact> {
        self.check("save")?;
        self.inner.save(artefact).await
    }

    async fn delete(&self, key: &ArtefactKey) -> Result<bool> {
        self.check("delete")?;
        self.inner.delete(key).await
    }
}

/// A processor over three artefact types: `role`, `group` and `job`.
/// Only `job` takes part in START and STOP.
pub struct Fixture {
    pub source: Arc<InMemoryRepository>,
    pub store: Arc<FlakyStore>,
    pub executor: Arc<RecordingExecutor>,
    pub processor: Arc<SynchronizationProcessor>,
}

impl Fixture {
    pub fn new() -> Self {
        let source = Arc::new(InMemoryRepository::new());
        let store = Arc::new(FlakyStore::default());
        let executor = Arc::new(RecordingExecutor::default());

        let document = |artefact_type: &str| {
            DocumentSynchronizer::new(artefact_type, artefact_type, store.clone(), executor.clone())
        };

        let built = ProcessorBuilder::new()
            .with_source(source.clone())
            .with_synchronizer(Arc::new(document("role")))
            .with_synchronizer(Arc::new(document("group")))
            .with_synchronizer(Arc::new(document("job").with_start_stop(true)))
            .with_config(ProcessorConfig {
                depleter: DepleterConfig {
                    apply_timeout: Duration::from_secs(5),
                    max_concurrent_applies: 4,
                },
                ..ProcessorConfig::default()
            })
            .build();

        let processor = match built {
            Ok(processor) => processor,
            Err(_) => SynchronizationProcessor::new(
                Default::default(),
                source.clone(),
                ProcessorConfig::default(),
            ),
        };

        Self {
            source,
            store,
            executor,
            processor: Arc::new(processor),
        }
    }

    /// Declare `name` of `artefact_type` at `/{name}.{artefact_type}`.
    pub async fn declare(&self, artefact_type: &str, name: &str, dependencies: &[ArtefactKey]) {
        self.declare_with(artefact_type, name, dependencies, "v1").await;
    }

    pub async fn declare_with(
        &self,
        artefact_type: &str,
        name: &str,
        dependencies: &[ArtefactKey],
        description: &str,
    ) {
        let body = serde_json::json!({
            "description": description,
            "dependencies": dependencies.iter().map(ArtefactKey::as_str).collect::<Vec<_>>(),
        });
        self.source
            .put(location(artefact_type, name), body.to_string())
            .await;
    }

    pub async fn retract(&self, artefact_type: &str, name: &str) {
        self.source.remove(&location(artefact_type, name)).await;
    }

    pub async fn stored(&self, artefact_type: &str, name: &str) -> Option<Artefact> {
        self.store
            .inner
            .find_by_key(&key(artefact_type, name))
            .await
            .ok()
            .flatten()
    }
}

pub fn location(artefact_type: &str, name: &str) -> String {
    format!("/{name}.{artefact_type}")
}

pub fn key(artefact_type: &str, name: &str) -> ArtefactKey {
    ArtefactKey::derive(artefact_type, &location(artefact_type, name), name)
}
