//! Dependency-aware reconciliation of declared artefacts.
//!
//! Source definitions (files in a registry) declare artefacts: typed,
//! named objects that may depend on each other by key. Each pass brings
//! the persisted state in line with the sources:
//!
//! - **Discover**: enumerate source entries and route them to the
//!   [`Synchronizer`] that accepts them
//! - **Parse**: turn bytes into [`Artefact`]s
//! - **Diff**: classify against persisted state by key and checksum
//! - **Deplete**: apply CREATE, UPDATE, START, STOP and DELETE in
//!   dependency order with the [`TopologicalDepleter`]
//!
//! Artefact-level failures are recorded through the
//! [`SynchronizerCallback`] and never fail a pass; cycles and missing
//! dependencies end up in the residue of their phase.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use artesync_reconciler::{
//!     DocumentSynchronizer, FileSystemRepository, InMemoryArtefactStore,
//!     NoOpExecutor, ProcessorBuilder,
//! };
//!
//! #[tokio::main]
//! async fn main() -> artesync_reconciler::Result<()> {
//!     let store = Arc::new(InMemoryArtefactStore::default());
//!     let processor = ProcessorBuilder::new()
//!         .with_source(Arc::new(FileSystemRepository::new("registry")))
//!         .with_synchronizer(Arc::new(DocumentSynchronizer::new(
//!             "role", "role", store, Arc::new(NoOpExecutor),
//!         )))
//!         .build()?;
//!
//!     let report = processor.force_pass().await?;
//!     println!("applied {}", report.applied_count());
//!     Ok(())
//! }
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod callback;
pub mod document;
pub mod error;
pub mod r#loop;
pub mod processor;
pub mod source;
pub mod store;
pub mod synchronizer;
pub mod topology;
pub mod types;

// Re-export main types
pub use callback::{CallbackEvent, PassCallback, SynchronizerCallback};
pub use document::{DocumentSynchronizer, NoOpExecutor, PhaseExecutor};
pub use error::{Error, Result};
pub use r#loop::{LoopConfig, LoopStopper, SyncLoop};
pub use processor::{
    PassReport, PassStep, PhaseReport, ProcessorBuilder, ProcessorConfig, SynchronizationProcessor,
};
pub use source::{FileSystemRepository, InMemoryRepository, SourceEntry, SourceRepository};
pub use store::{ArtefactStore, InMemoryArtefactStore, JsonFileArtefactStore};
pub use synchronizer::{AcceptTarget, Synchronizer, SynchronizerRegistry};
pub use topology::{
    DepleterConfig, DepletionOutcome, TopologicalDepleter, TopologicalSorter, TopologyWrapper,
};
pub use types::{
    Artefact, ArtefactId, ArtefactKey, ArtefactLifecycle, ArtefactPhase, ArtefactState,
};
