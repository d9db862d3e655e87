//! Synchronizer plugin contract and registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::callback::SynchronizerCallback;
use crate::error::Result;
use crate::topology::TopologyWrapper;
use crate::types::{Artefact, ArtefactPhase};

/// What a synchronizer is asked to accept.
#[derive(Debug, Clone, Copy)]
pub enum AcceptTarget<'a> {
    /// A candidate source file found during discovery.
    Path(&'a Path),
    /// An already-typed artefact.
    Type(&'a str),
}

/// Per-artefact-type adapter driven by the processor.
///
/// Each artefact type provides one implementation. The processor never
/// inspects artefact payloads; everything type-specific happens here.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Type tag of the artefacts this synchronizer owns.
    fn artefact_type(&self) -> &str;

    /// Cheap routing predicate.
    fn is_accepted(&self, target: AcceptTarget<'_>) -> bool;

    /// Deserialize raw bytes into zero or more artefacts.
    ///
    /// Assigns location, type and key, and carries over the surrogate id
    /// of an already persisted artefact with the same key.
    ///
    /// # Errors
    ///
    /// Returns `ParseFailed` for structurally invalid content.
    async fn parse(&self, location: &str, content: &[u8]) -> Result<Vec<Artefact>>;

    /// All persisted artefacts of this type under `location`.
    ///
    /// # Errors
    ///
    /// Store failures, which are pass-fatal.
    async fn retrieve(&self, location: &str) -> Result<Vec<Artefact>>;

    /// Persist the lifecycle and error of `artefact`.
    ///
    /// # Errors
    ///
    /// Store failures, which are pass-fatal.
    async fn set_status(&self, artefact: &Artefact) -> Result<()>;

    /// Perform the side effect of `phase` for a wrapper whose dependencies
    /// are satisfied.
    ///
    /// # Errors
    ///
    /// `ApplyFailed` when the side effect could not be performed. The
    /// wrapper stays pending.
    async fn apply(&self, wrapper: &TopologyWrapper, phase: ArtefactPhase) -> Result<()>;

    /// Best-effort removal of an artefact whose own apply could not run
    /// cleanly. Reports its own failure through `callback`.
    ///
    /// Returns whether the artefact reached `DELETED`.
    async fn cleanup(&self, artefact: &Artefact, callback: &dyn SynchronizerCallback) -> bool;

    /// Whether this type takes part in `phase`.
    fn supports(&self, phase: ArtefactPhase) -> bool {
        !matches!(phase, ArtefactPhase::Start | ArtefactPhase::Stop)
    }
}

/// Ordered collection of synchronizers.
///
/// Path routing consults synchronizers in registration order and the
/// first match wins. Type routing is resolved once at registration.
#[derive(Default, Clone)]
pub struct SynchronizerRegistry {
    synchronizers: Vec<Arc<dyn Synchronizer>>,
    by_type: HashMap<String, usize>,
}

impl SynchronizerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronizer after all previously registered ones.
    pub fn register(&mut self, synchronizer: Arc<dyn Synchronizer>) {
        let index = self.synchronizers.len();
        self.by_type
            .entry(synchronizer.artefact_type().to_string())
            .or_insert(index);
        self.synchronizers.push(synchronizer);
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(mut self, synchronizer: Arc<dyn Synchronizer>) -> Self {
        self.register(synchronizer);
        self
    }

    /// First synchronizer accepting the source file at `path`.
    pub fn route_path(&self, path: &Path) -> Option<Arc<dyn Synchronizer>> {
        self.synchronizers
            .iter()
            .find(|s| s.is_accepted(AcceptTarget::Path(path)))
            .cloned()
    }

    /// Synchronizer owning `artefact_type`.
    pub fn route_type(&self, artefact_type: &str) -> Option<Arc<dyn Synchronizer>> {
        self.by_type
            .get(artefact_type)
            .and_then(|index| self.synchronizers.get(*index))
            .filter(|s| s.is_accepted(AcceptTarget::Type(artefact_type)))
            .cloned()
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Synchronizer>> {
        self.synchronizers.iter()
    }

    /// Registered artefact types in registration order.
    pub fn types(&self) -> Vec<&str> {
        self.synchronizers.iter().map(|s| s.artefact_type()).collect()
    }

    /// Get the number of registered synchronizers.
    pub fn len(&self) -> usize {
        self.synchronizers.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.synchronizers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentSynchronizer, NoOpExecutor};
    use crate::store::InMemoryArtefactStore;

    fn document(artefact_type: &str, extension: &str) -> Arc<dyn Synchronizer> {
        Arc::new(DocumentSynchronizer::new(
            artefact_type,
            extension,
            Arc::new(InMemoryArtefactStore::default()),
            Arc::new(NoOpExecutor),
        ))
    }

    #[test]
    fn test_route_path_by_extension() {
        let registry = SynchronizerRegistry::new()
            .with(document("role", "role"))
            .with(document("job", "job"));

        let routed = registry.route_path(Path::new("/p/nightly.job"));
        assert_eq!(routed.map(|s| s.artefact_type().to_string()).as_deref(), Some("job"));
        assert!(registry.route_path(Path::new("/p/readme.md")).is_none());
        assert_eq!(registry.types(), vec!["role", "job"]);
    }

    #[test]
    fn test_first_registered_wins() {
        let registry = SynchronizerRegistry::new()
            .with(document("role", "role"))
            .with(document("legacy-role", "role"));

        let routed = registry.route_path(Path::new("/a.role"));
        assert_eq!(routed.map(|s| s.artefact_type().to_string()).as_deref(), Some("role"));
    }

    #[test]
    fn test_route_type() {
        let registry = SynchronizerRegistry::new().with(document("access", "access"));
        assert!(registry.route_type("access").is_some());
        assert!(registry.route_type("role").is_none());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_default_phase_support() {
        let sync = document("role", "role");
        assert!(sync.supports(ArtefactPhase::Create));
        assert!(sync.supports(ArtefactPhase::Delete));
        assert!(!sync.supports(ArtefactPhase::Start));
    }
}
