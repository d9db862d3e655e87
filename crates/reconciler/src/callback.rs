//! Synchronizer callback: the single sink for outcome reporting.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::synchronizer::Synchronizer;
use crate::topology::TopologyWrapper;
use crate::types::{Artefact, ArtefactKey, ArtefactLifecycle, ArtefactState};

/// Receives lifecycle changes and failures from synchronizers and the
/// depleter.
#[async_trait]
pub trait SynchronizerCallback: Send + Sync {
    /// Record a lifecycle transition (and optional error) on `artefact`
    /// and persist it through `synchronizer`.
    ///
    /// # Errors
    ///
    /// Store failures while persisting. These are pass-fatal.
    async fn register_state(
        &self,
        synchronizer: &dyn Synchronizer,
        artefact: &mut Artefact,
        lifecycle: ArtefactLifecycle,
        error: Option<String>,
    ) -> Result<()>;

    /// Append a free-form error to the pass error list.
    fn add_error(&self, message: String);

    /// Record every wrapper that could not be depleted.
    ///
    /// # Errors
    ///
    /// Store failures while persisting. These are pass-fatal.
    async fn register_errors(
        &self,
        wrappers: &mut [TopologyWrapper],
        lifecycle: &str,
        state: ArtefactState,
    ) -> Result<()>;
}

/// One entry of the callback journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// `register_state` was applied.
    StateRegistered {
        key: ArtefactKey,
        lifecycle: ArtefactLifecycle,
        error: Option<String>,
    },
    /// The artefact was left in the residue of a phase.
    Undepleted {
        key: ArtefactKey,
        lifecycle: String,
        state: ArtefactState,
    },
}

impl CallbackEvent {
    /// Key of the artefact this event is about.
    pub fn key(&self) -> &ArtefactKey {
        match self {
            Self::StateRegistered { key, .. } | Self::Undepleted { key, .. } => key,
        }
    }
}

/// Callback scoped to a single pass.
///
/// Collects the error list and an event journal for the pass report.
#[derive(Debug, Default)]
pub struct PassCallback {
    errors: Mutex<Vec<String>>,
    events: Mutex<Vec<CallbackEvent>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PassCallback {
    /// Create an empty callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors collected so far.
    pub fn errors(&self) -> Vec<String> {
        guard(&self.errors).clone()
    }

    /// Events recorded so far, in order.
    pub fn events(&self) -> Vec<CallbackEvent> {
        guard(&self.events).clone()
    }

    /// Number of `register_state` calls recorded for `key`.
    pub fn state_count(&self, key: &ArtefactKey) -> usize {
        guard(&self.events)
            .iter()
            .filter(|e| matches!(e, CallbackEvent::StateRegistered { .. }) && e.key() == key)
            .count()
    }

    fn record(&self, event: CallbackEvent) {
        guard(&self.events).push(event);
    }
}

/// Message recorded for a wrapper left in a phase residue.
pub fn undepleted_message(artefact: &Artefact, lifecycle: &str) -> String {
    format!(
        "Undepleted artefact of type [{}] with key [{}] in phase [{}]",
        artefact.artefact_type, artefact.key, lifecycle
    )
}

#[async_trait]
impl SynchronizerCallback for PassCallback {
    async fn register_state(
        &self,
        synchronizer: &dyn Synchronizer,
        artefact: &mut Artefact,
        lifecycle: ArtefactLifecycle,
        error: Option<String>,
    ) -> Result<()> {
        if !artefact.lifecycle.can_transition_to(lifecycle) {
            warn!(
                key = %artefact.key,
                from = %artefact.lifecycle,
                to = %lifecycle,
                "Ignoring invalid lifecycle transition"
            );
            self.add_error(
                Error::invalid_transition(artefact.key.as_str(), artefact.lifecycle, lifecycle)
                    .to_string(),
            );
            return Ok(());
        }

        artefact.lifecycle = lifecycle;
        artefact.error = error.clone();
        synchronizer.set_status(artefact).await?;

        debug!(key = %artefact.key, lifecycle = %lifecycle, failed = error.is_some(), "Registered state");
        if let Some(message) = &error {
            self.add_error(format!("[{}] {}", artefact.key, message));
        }
        self.record(CallbackEvent::StateRegistered {
            key: artefact.key.clone(),
            lifecycle,
            error,
        });
        Ok(())
    }

    fn add_error(&self, message: String) {
        guard(&self.errors).push(message);
    }

    async fn register_errors(
        &self,
        wrappers: &mut [TopologyWrapper],
        lifecycle: &str,
        state: ArtefactState,
    ) -> Result<()> {
        for wrapper in wrappers.iter_mut() {
            let message = undepleted_message(&wrapper.artefact, lifecycle);
            warn!(key = %wrapper.artefact.key, state = %state, "{message}");

            wrapper.artefact.error = Some(message.clone());
            wrapper.error = Some(message.clone());
            let synchronizer = Arc::clone(&wrapper.synchronizer);
            synchronizer.set_status(&wrapper.artefact).await?;

            self.add_error(message);
            self.record(CallbackEvent::Undepleted {
                key: wrapper.artefact.key.clone(),
                lifecycle: lifecycle.to_string(),
                state,
            });
        }
        Ok(())
    }
}
