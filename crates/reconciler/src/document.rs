//! Generic synchronizer for JSON artefact documents.
//!
//! A source file holds either one JSON object or an array of objects.
//! Each object may carry `name`, `description` and `dependencies` (full
//! artefact keys); any other field is type-specific payload and is kept
//! verbatim in the artefact content. Side effects beyond the durable
//! record are delegated to a [`PhaseExecutor`].

use std::path::Path;
use std::sync::Arc;

use artesync_core::ResultExt;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::callback::SynchronizerCallback;
use crate::error::{Error, Result};
use crate::store::ArtefactStore;
use crate::synchronizer::{AcceptTarget, Synchronizer};
use crate::topology::TopologyWrapper;
use crate::types::{Artefact, ArtefactLifecycle, ArtefactPhase};

/// Downstream effect of a phase, e.g. deploying into a runtime engine.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Perform `phase` for `artefact`.
    async fn execute(&self, artefact: &Artefact, phase: ArtefactPhase) -> Result<()>;
}

/// Executor with no side effects; the durable record is the whole state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpExecutor;

#[async_trait]
impl PhaseExecutor for NoOpExecutor {
    async fn execute(&self, _artefact: &Artefact, _phase: ArtefactPhase) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DocumentHeader {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Synchronizer for one artefact type stored as JSON documents.
pub struct DocumentSynchronizer {
    artefact_type: String,
    extension: String,
    store: Arc<dyn ArtefactStore>,
    executor: Arc<dyn PhaseExecutor>,
    start_stop: bool,
}

impl DocumentSynchronizer {
    pub fn new(
        artefact_type: impl Into<String>,
        extension: impl Into<String>,
        store: Arc<dyn ArtefactStore>,
        executor: Arc<dyn PhaseExecutor>,
    ) -> Self {
        Self {
            artefact_type: artefact_type.into(),
            extension: extension.into(),
            store,
            executor,
            start_stop: false,
        }
    }

    /// Take part in START and STOP.
    #[must_use]
    pub fn with_start_stop(mut self, enabled: bool) -> Self {
        self.start_stop = enabled;
        self
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    fn build(&self, location: &str, value: &Value, raw: &[u8], require_name: bool) -> Result<Artefact> {
        let header = DocumentHeader::deserialize(value)
            .map_err(|e| Error::parse_failed(location, e.to_string()))?;

        let mut artefact = Artefact::new(&self.artefact_type, location, raw);
        match header.name {
            Some(name) if !name.trim().is_empty() => artefact = artefact.with_name(name),
            _ if require_name => {
                return Err(Error::parse_failed(
                    location,
                    "every document in an array needs a name",
                ))
            }
            _ => {}
        }
        if let Some(description) = header.description {
            artefact = artefact.with_description(description);
        }
        for dependency in header.dependencies {
            artefact = artefact.with_dependency(dependency.as_str());
        }
        Ok(artefact)
    }
}

#[async_trait]
impl Synchronizer for DocumentSynchronizer {
    fn artefact_type(&self) -> &str {
        &self.artefact_type
    }

    fn is_accepted(&self, target: AcceptTarget<'_>) -> bool {
        match target {
            AcceptTarget::Path(path) => has_extension(path, &self.extension),
            AcceptTarget::Type(artefact_type) => artefact_type == self.artefact_type,
        }
    }

    async fn parse(&self, location: &str, content: &[u8]) -> Result<Vec<Artefact>> {
        let value: Value = serde_json::from_slice(content)
            .map_err(|e| Error::parse_failed(location, e.to_string()))?;

        let mut artefacts = match &value {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    let raw = serde_json::to_vec(item)
                        .map_err(|e| Error::parse_failed(location, e.to_string()))?;
                    self.build(location, item, &raw, true)
                })
                .collect::<Result<Vec<_>>>()?,
            Value::Object(_) => vec![self.build(location, &value, content, false)?],
            _ => {
                return Err(Error::parse_failed(
                    location,
                    "expected a JSON object or an array of objects",
                ))
            }
        };

        for artefact in &mut artefacts {
            if let Some(existing) = self.store.find_by_key(&artefact.key).await? {
                artefact.id = existing.id;
            }
        }

        debug!(
            location,
            artefact_type = %self.artefact_type,
            count = artefacts.len(),
            "Parsed document"
        );
        Ok(artefacts)
    }

    async fn retrieve(&self, location: &str) -> Result<Vec<Artefact>> {
        self.store.find_all(&self.artefact_type, location).await
    }

    async fn set_status(&self, artefact: &Artefact) -> Result<()> {
        if artefact.lifecycle == ArtefactLifecycle::Deleted {
            self.store.delete(&artefact.key).await?;
        } else {
            self.store.save(artefact).await?;
        }
        Ok(())
    }

    async fn apply(&self, wrapper: &TopologyWrapper, phase: ArtefactPhase) -> Result<()> {
        debug!(key = %wrapper.key(), phase = %phase, "Applying document");
        self.executor.execute(&wrapper.artefact, phase).await
    }

    async fn cleanup(&self, artefact: &Artefact, callback: &dyn SynchronizerCallback) -> bool {
        let mut record = artefact.clone();
        let (lifecycle, error) = match self.executor.execute(artefact, ArtefactPhase::Delete).await {
            Ok(()) => (ArtefactLifecycle::Deleted, None),
            Err(e) => {
                warn!(key = %artefact.key, error = %e, "Cleanup failed");
                (artefact.lifecycle, Some(e.to_string()))
            }
        };
        callback
            .register_state(self, &mut record, lifecycle, error)
            .await
            .into_option_logged("document cleanup")
            .is_some_and(|()| record.lifecycle == ArtefactLifecycle::Deleted)
    }

    fn supports(&self, phase: ArtefactPhase) -> bool {
        match phase {
            ArtefactPhase::Start | ArtefactPhase::Stop => self.start_stop,
            _ => true,
        }
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(extension)
}
