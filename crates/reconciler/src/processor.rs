//! Synchronization processor: one pass is
//! DISCOVER, PARSE, DIFF, then CREATE, UPDATE, START, STOP and DELETE
//! depletions, ending in DONE (or an `Err` for pass-fatal failures).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use artesync_core::SyncConfig;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::callback::{PassCallback, SynchronizerCallback};
use crate::error::{Error, Result};
use crate::source::{SourceEntry, SourceRepository};
use crate::synchronizer::{Synchronizer, SynchronizerRegistry};
use crate::topology::{
    DepleterConfig, DepletionOutcome, TopologicalDepleter, TopologicalSorter, TopologyWrapper,
};
use crate::types::{Artefact, ArtefactKey, ArtefactLifecycle, ArtefactPhase};

/// Configuration for the processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Location scope of every pass. Matches whole path segments.
    pub root: String,
    /// Depletion tuning.
    pub depleter: DepleterConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            depleter: DepleterConfig::default(),
        }
    }
}

impl From<&SyncConfig> for ProcessorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            root: config.scope.clone(),
            depleter: DepleterConfig {
                apply_timeout: config.apply_timeout(),
                max_concurrent_applies: config.max_concurrent_applies,
            },
        }
    }
}

/// Step of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassStep {
    Discover,
    Parse,
    Diff,
    Create,
    Update,
    Start,
    Stop,
    Delete,
    Cleanup,
    Done,
    Failed,
}

impl From<ArtefactPhase> for PassStep {
    fn from(phase: ArtefactPhase) -> Self {
        match phase {
            ArtefactPhase::Create => Self::Create,
            ArtefactPhase::Update => Self::Update,
            ArtefactPhase::Delete => Self::Delete,
            ArtefactPhase::Start => Self::Start,
            ArtefactPhase::Stop => Self::Stop,
        }
    }
}

impl fmt::Display for PassStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discover => "DISCOVER",
            Self::Parse => "PARSE",
            Self::Diff => "DIFF",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Delete => "DELETE",
            Self::Cleanup => "CLEANUP",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Outcome of one depleted phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: ArtefactPhase,
    pub completed: Vec<ArtefactKey>,
    pub failed: Vec<ArtefactKey>,
    pub blocked: Vec<ArtefactKey>,
    pub iterations: usize,
}

impl PhaseReport {
    fn new(phase: ArtefactPhase, outcome: &DepletionOutcome) -> Self {
        Self {
            phase,
            completed: outcome.completed_keys(),
            failed: outcome.failed_keys(),
            blocked: outcome.blocked_keys(),
            iterations: outcome.iterations,
        }
    }
}

/// Result of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: Ulid,
    pub state: PassStep,
    /// Step that was running when a pass-fatal error ended the pass.
    pub failed_at: Option<PassStep>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Source entries routed to a synchronizer.
    pub discovered: usize,
    /// Artefacts produced by parsing.
    pub parsed: usize,
    /// Parsed artefacts already in their applied state.
    pub unchanged: usize,
    pub phases: Vec<PhaseReport>,
    /// Keys handed to `cleanup` after the DELETE phase.
    pub cleaned_up: Vec<ArtefactKey>,
    pub errors: Vec<String>,
}

impl PassReport {
    fn new(pass_id: Ulid) -> Self {
        Self {
            pass_id,
            state: PassStep::Discover,
            failed_at: None,
            started_at: Utc::now(),
            duration_ms: 0,
            discovered: 0,
            parsed: 0,
            unchanged: 0,
            phases: Vec::new(),
            cleaned_up: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Report of `phase`, if it had anything to do.
    pub fn phase(&self, phase: ArtefactPhase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Keys completed in `phase`.
    pub fn completed(&self, phase: ArtefactPhase) -> Vec<ArtefactKey> {
        self.phase(phase).map(|p| p.completed.clone()).unwrap_or_default()
    }

    /// Total number of artefacts applied across all phases.
    pub fn applied_count(&self) -> usize {
        self.phases.iter().map(|p| p.completed.len()).sum()
    }

    /// Whether the pass finished without any recorded error.
    pub fn is_clean(&self) -> bool {
        self.state == PassStep::Done && self.errors.is_empty()
    }
}

type Routed = (Artefact, Arc<dyn Synchronizer>);

/// Classified artefacts for one pass.
#[derive(Default)]
struct PassPlan {
    create: Vec<Routed>,
    update: Vec<Routed>,
    delete: Vec<Routed>,
    unchanged: usize,
}

/// Drives passes over the registered synchronizers.
///
/// At most one pass runs at a time. A [`run_pass`](Self::run_pass) call
/// arriving while a pass runs is coalesced into a rerun by the running
/// caller.
pub struct SynchronizationProcessor {
    registry: SynchronizerRegistry,
    source: Arc<dyn SourceRepository>,
    depleter: TopologicalDepleter,
    config: ProcessorConfig,
    pass_lock: Mutex<()>,
    rerun: AtomicBool,
    last_report: std::sync::Mutex<Option<PassReport>>,
}

impl SynchronizationProcessor {
    /// Create a new processor.
    pub fn new(
        registry: SynchronizerRegistry,
        source: Arc<dyn SourceRepository>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            registry,
            source,
            depleter: TopologicalDepleter::new(config.depleter.clone()),
            config,
            pass_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            last_report: std::sync::Mutex::new(None),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Get the registry.
    pub fn registry(&self) -> &SynchronizerRegistry {
        &self.registry
    }

    /// Whether a pass is in flight.
    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Report of the most recent finished pass, including failed ones.
    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, report: &PassReport) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
    }

    /// Run a pass unless one is already running.
    ///
    /// Returns `Ok(None)` when the request was coalesced into the running
    /// pass. Otherwise returns the report of the last pass this call ran,
    /// including reruns requested while it was busy.
    ///
    /// # Errors
    ///
    /// Pass-fatal source or store failures.
    pub async fn run_pass(&self) -> Result<Option<PassReport>> {
        let mut last = None;
        loop {
            let guard = match self.pass_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.rerun.store(true, Ordering::SeqCst);
                    // The owner may have released the lock before seeing the flag.
                    let Ok(guard) = self.pass_lock.try_lock() else {
                        debug!("Pass already running, request coalesced");
                        return Ok(last);
                    };
                    guard
                }
            };
            self.rerun.store(false, Ordering::SeqCst);
            let report = self.execute_pass().await;
            drop(guard);

            last = Some(report?);
            if !self.rerun.load(Ordering::SeqCst) {
                return Ok(last);
            }
            info!("Running coalesced pass");
        }
    }

    /// Wait for any running pass, then run a fresh one.
    ///
    /// # Errors
    ///
    /// Pass-fatal source or store failures.
    pub async fn force_pass(&self) -> Result<PassReport> {
        let _guard = self.pass_lock.lock().await;
        self.execute_pass().await
    }

    async fn execute_pass(&self) -> Result<PassReport> {
        let started = Instant::now();
        let callback = PassCallback::new();
        let mut report = PassReport::new(Ulid::new());

        info!(pass_id = %report.pass_id, root = %self.config.root, "Starting synchronization pass");

        let outcome = self.run_steps(&callback, &mut report).await;
        report.errors = callback.errors();
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if let Err(e) = outcome {
            error!(
                pass_id = %report.pass_id,
                step = %report.state,
                error = %e,
                "Synchronization pass failed"
            );
            report.failed_at = Some(report.state);
            report.state = PassStep::Failed;
            report.errors.push(e.to_string());
            self.remember(&report);
            return Err(e);
        }

        report.state = PassStep::Done;
        self.remember(&report);

        info!(
            pass_id = %report.pass_id,
            discovered = report.discovered,
            parsed = report.parsed,
            unchanged = report.unchanged,
            applied = report.applied_count(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Synchronization pass complete"
        );
        Ok(report)
    }

    fn enter(report: &mut PassReport, step: PassStep) {
        debug!(pass_id = %report.pass_id, step = %step, "Entering step");
        report.state = step;
    }

    async fn run_steps(&self, callback: &PassCallback, report: &mut PassReport) -> Result<()> {
        Self::enter(report, PassStep::Discover);
        let entries = self.discover().await?;
        report.discovered = entries.len();

        Self::enter(report, PassStep::Parse);
        let (parsed, failed_locations) = self.parse(entries, callback).await?;
        report.parsed = parsed.len();

        Self::enter(report, PassStep::Diff);
        let plan = self.diff(parsed, &failed_locations).await?;
        report.unchanged = plan.unchanged;
        info!(
            pass_id = %report.pass_id,
            create = plan.create.len(),
            update = plan.update.len(),
            delete = plan.delete.len(),
            unchanged = plan.unchanged,
            "Diff computed"
        );

        let created = self
            .deplete(ArtefactPhase::Create, plan.create, callback, report)
            .await?;
        let updated = self
            .deplete(ArtefactPhase::Update, plan.update, callback, report)
            .await?;

        let started: Vec<Routed> = created
            .completed
            .into_iter()
            .chain(updated.completed)
            .map(|w| (w.artefact, w.synchronizer))
            .collect();
        self.deplete(ArtefactPhase::Start, started, callback, report)
            .await?;

        self.deplete(ArtefactPhase::Stop, plan.delete.clone(), callback, report)
            .await?;
        let deleted = self
            .deplete(ArtefactPhase::Delete, plan.delete, callback, report)
            .await?;

        Self::cleanup(deleted, callback, report).await;
        Ok(())
    }

    /// Hand the DELETE residue to `cleanup`, dependents first.
    ///
    /// An artefact is kept while a residue artefact depending on it is
    /// still present, so a failed dependent never loses its dependency.
    async fn cleanup(deleted: DepletionOutcome, callback: &PassCallback, report: &mut PassReport) {
        let residue = TopologicalSorter::sort_for(
            deleted.failed.into_iter().chain(deleted.blocked).collect(),
            ArtefactPhase::Delete,
        );
        if residue.is_empty() {
            return;
        }
        Self::enter(report, PassStep::Cleanup);

        let mut surviving: Vec<&TopologyWrapper> = Vec::new();
        for wrapper in &residue {
            if let Some(dependent) = surviving.iter().find(|other| other.depends_on(wrapper.key())) {
                warn!(key = %wrapper.key(), dependent = %dependent.key(), "Skipping cleanup");
                callback.add_error(format!(
                    "Cleanup of [{}] skipped, dependent [{}] still present",
                    wrapper.key(),
                    dependent.key()
                ));
                surviving.push(wrapper);
                continue;
            }

            let removed = wrapper.synchronizer.cleanup(&wrapper.artefact, callback).await;
            report.cleaned_up.push(wrapper.key().clone());
            if !removed {
                surviving.push(wrapper);
            }
        }
    }

    async fn discover(&self) -> Result<Vec<(SourceEntry, Arc<dyn Synchronizer>)>> {
        let entries = self.source.list(&self.config.root).await?;
        let total = entries.len();
        let routed: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| self.registry.route_path(&entry.path).map(|s| (entry, s)))
            .collect();
        debug!(total, routed = routed.len(), "Discovered source entries");
        Ok(routed)
    }

    async fn parse(
        &self,
        entries: Vec<(SourceEntry, Arc<dyn Synchronizer>)>,
        callback: &PassCallback,
    ) -> Result<(Vec<Routed>, HashSet<String>)> {
        let mut parsed: Vec<Routed> = Vec::new();
        let mut seen: HashSet<ArtefactKey> = HashSet::new();
        let mut failed_locations = HashSet::new();

        for (entry, synchronizer) in entries {
            // A read failure is isolated to its entry; only parse-time store failures are fatal.
            let artefacts = match self.source.read(&entry).await {
                Ok(content) => match synchronizer.parse(&entry.location, &content).await {
                    Err(e) if e.is_pass_fatal() => return Err(e),
                    parsed => parsed,
                },
                Err(e) => Err(e),
            };

            match artefacts {
                Ok(artefacts) => {
                    for artefact in artefacts {
                        if !seen.insert(artefact.key.clone()) {
                            warn!(key = %artefact.key, location = %entry.location, "Duplicate artefact key");
                            callback.add_error(format!(
                                "Duplicate artefact key [{}] in [{}]",
                                artefact.key, entry.location
                            ));
                            continue;
                        }
                        parsed.push((artefact, Arc::clone(&synchronizer)));
                    }
                }
                Err(e) => {
                    warn!(location = %entry.location, error = %e, "Skipping unparseable source");
                    callback.add_error(e.to_string());
                    failed_locations.insert(entry.location);
                }
            }
        }
        Ok((parsed, failed_locations))
    }

    async fn diff(&self, parsed: Vec<Routed>, failed_locations: &HashSet<String>) -> Result<PassPlan> {
        let mut persisted: HashMap<ArtefactKey, Routed> = HashMap::new();
        for artefact_type in self.registry.types().into_iter().unique() {
            let Some(synchronizer) = self.registry.route_type(artefact_type) else {
                continue;
            };
            for artefact in synchronizer.retrieve(&self.config.root).await? {
                persisted
                    .entry(artefact.key.clone())
                    .or_insert_with(|| (artefact, Arc::clone(&synchronizer)));
            }
        }

        let mut plan = PassPlan::default();
        for (mut artefact, synchronizer) in parsed {
            let Some((existing, _)) = persisted.remove(&artefact.key) else {
                artefact.lifecycle = ArtefactLifecycle::New;
                plan.create.push((artefact, synchronizer));
                continue;
            };

            artefact.id = existing.id.or(artefact.id);
            artefact.created_by = existing.created_by.clone();
            artefact.created_at = existing.created_at;

            let changed = existing.checksum != artefact.checksum;
            match existing.lifecycle {
                ArtefactLifecycle::Created | ArtefactLifecycle::Updated if !changed => {
                    plan.unchanged += 1;
                }
                ArtefactLifecycle::Created
                | ArtefactLifecycle::Updated
                | ArtefactLifecycle::Modified => {
                    artefact.lifecycle = ArtefactLifecycle::Modified;
                    plan.update.push((artefact, synchronizer));
                }
                ArtefactLifecycle::New | ArtefactLifecycle::Deleted => {
                    artefact.lifecycle = ArtefactLifecycle::New;
                    plan.create.push((artefact, synchronizer));
                }
            }
        }

        let mut orphans: Vec<Routed> = persisted
            .into_values()
            .filter(|(artefact, _)| {
                let protected = failed_locations.contains(&artefact.location);
                if protected {
                    debug!(key = %artefact.key, "Keeping artefact of unparseable source");
                }
                !protected
            })
            .collect();
        orphans.sort_by(|(a, _), (b, _)| a.key.cmp(&b.key));
        plan.delete = orphans;
        Ok(plan)
    }

    async fn deplete(
        &self,
        phase: ArtefactPhase,
        batch: Vec<Routed>,
        callback: &dyn SynchronizerCallback,
        report: &mut PassReport,
    ) -> Result<DepletionOutcome> {
        let wrappers: Vec<TopologyWrapper> = batch
            .into_iter()
            .filter(|(artefact, synchronizer)| {
                phase.accepts(artefact.lifecycle) && synchronizer.supports(phase)
            })
            .map(|(artefact, synchronizer)| TopologyWrapper::new(artefact, synchronizer, phase))
            .collect();

        if wrappers.is_empty() {
            return Ok(DepletionOutcome::default());
        }

        Self::enter(report, PassStep::from(phase));
        let wrappers = TopologicalSorter::sort_for(wrappers, phase);
        let outcome = self.depleter.deplete(wrappers, phase, callback).await?;
        report.phases.push(PhaseReport::new(phase, &outcome));
        Ok(outcome)
    }
}

/// Builder for [`SynchronizationProcessor`].
#[derive(Default)]
pub struct ProcessorBuilder {
    registry: SynchronizerRegistry,
    source: Option<Arc<dyn SourceRepository>>,
    config: ProcessorConfig,
}

impl ProcessorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source repository.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceRepository>) -> Self {
        self.source = Some(source);
        self
    }

    /// Register a synchronizer after the ones already registered.
    #[must_use]
    pub fn with_synchronizer(mut self, synchronizer: Arc<dyn Synchronizer>) -> Self {
        self.registry.register(synchronizer);
        self
    }

    /// Set configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the processor.
    ///
    /// # Errors
    ///
    /// Returns an error if no source repository or no synchronizer is set.
    pub fn build(self) -> Result<SynchronizationProcessor> {
        let source = self
            .source
            .ok_or_else(|| Error::invalid_config("source repository is required"))?;
        if self.registry.is_empty() {
            return Err(Error::invalid_config("at least one synchronizer is required"));
        }
        Ok(SynchronizationProcessor::new(self.registry, source, self.config))
    }
}
