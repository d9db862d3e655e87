//! Dependency-aware application of a phase to a batch of artefacts.
//!
//! The depleter repeatedly applies every pending wrapper whose
//! dependencies are satisfied until a full iteration makes no progress.
//! Cycles and unsatisfiable dependencies never abort the batch; they end
//! up in the residue and are reported through the callback.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use either::Either;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::{debug, info, warn};

use crate::callback::SynchronizerCallback;
use crate::error::{Error, Result};
use crate::synchronizer::Synchronizer;
use crate::types::{Artefact, ArtefactKey, ArtefactPhase};

/// Transient per-phase envelope around an artefact.
#[derive(Clone)]
pub struct TopologyWrapper {
    pub artefact: Artefact,
    pub synchronizer: Arc<dyn Synchronizer>,
    pub phase: ArtefactPhase,
    pub completed: bool,
    pub error: Option<String>,
    /// Apply attempts made during this phase.
    pub attempts: u32,
}

impl TopologyWrapper {
    pub fn new(artefact: Artefact, synchronizer: Arc<dyn Synchronizer>, phase: ArtefactPhase) -> Self {
        Self {
            artefact,
            synchronizer,
            phase,
            completed: false,
            error: None,
            attempts: 0,
        }
    }

    pub fn key(&self) -> &ArtefactKey {
        &self.artefact.key
    }

    pub fn depends_on(&self, key: &ArtefactKey) -> bool {
        self.artefact.dependencies.contains(key)
    }
}

impl fmt::Debug for TopologyWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyWrapper")
            .field("key", &self.artefact.key)
            .field("synchronizer", &self.synchronizer.artefact_type())
            .field("phase", &self.phase)
            .field("completed", &self.completed)
            .field("error", &self.error)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Orders a batch so dependencies come before their dependents.
///
/// Only in-batch dependencies become edges. A cyclic batch is returned in
/// input order; the depleter still handles it correctly, only the dispatch
/// order is less helpful.
pub struct TopologicalSorter;

impl TopologicalSorter {
    pub fn sort(wrappers: Vec<TopologyWrapper>) -> Vec<TopologyWrapper> {
        let mut graph = DiGraph::<usize, ()>::with_capacity(wrappers.len(), 0);
        let nodes = (0..wrappers.len()).map(|i| graph.add_node(i)).collect_vec();
        let index_of: HashMap<&ArtefactKey, usize> = wrappers
            .iter()
            .enumerate()
            .map(|(i, w)| (w.key(), i))
            .collect();

        for (i, wrapper) in wrappers.iter().enumerate() {
            for dependency in &wrapper.artefact.dependencies {
                if let Some(&j) = index_of.get(dependency) {
                    if i != j {
                        graph.add_edge(nodes[j], nodes[i], ());
                    }
                }
            }
        }

        let order = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|n| graph[n]).collect_vec(),
            Err(cycle) => {
                let key = wrappers.get(graph[cycle.node_id()]).map(|w| w.key().to_string());
                debug!(key = ?key, "Batch contains a cycle, keeping input order");
                return wrappers;
            }
        };

        let mut slots = wrappers.into_iter().map(Some).collect_vec();
        order
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .collect()
    }

    /// Sort for `phase`, reversing for phases that tear down.
    pub fn sort_for(wrappers: Vec<TopologyWrapper>, phase: ArtefactPhase) -> Vec<TopologyWrapper> {
        let mut sorted = Self::sort(wrappers);
        if phase.is_reverse() {
            sorted.reverse();
        }
        sorted
    }
}

/// Depleter tuning.
#[derive(Debug, Clone)]
pub struct DepleterConfig {
    /// Time budget for a single apply.
    pub apply_timeout: Duration,
    /// Upper bound on applies running at once within an iteration.
    pub max_concurrent_applies: usize,
}

impl Default for DepleterConfig {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(30),
            max_concurrent_applies: 8,
        }
    }
}

/// Result of depleting one phase.
#[derive(Debug, Default)]
pub struct DepletionOutcome {
    /// Applied successfully, in completion order.
    pub completed: Vec<TopologyWrapper>,
    /// Attempted at least once, never succeeded.
    pub failed: Vec<TopologyWrapper>,
    /// Never became eligible: cycles or dependencies stuck in the batch.
    pub blocked: Vec<TopologyWrapper>,
    /// Iterations run, including the final one without progress.
    pub iterations: usize,
}

impl DepletionOutcome {
    pub fn completed_keys(&self) -> Vec<ArtefactKey> {
        self.completed.iter().map(|w| w.key().clone()).collect()
    }

    pub fn failed_keys(&self) -> Vec<ArtefactKey> {
        self.failed.iter().map(|w| w.key().clone()).collect()
    }

    pub fn blocked_keys(&self) -> Vec<ArtefactKey> {
        self.blocked.iter().map(|w| w.key().clone()).collect()
    }
}

/// Fixed-point retry over a dependency graph.
#[derive(Debug, Clone, Default)]
pub struct TopologicalDepleter {
    config: DepleterConfig,
}

impl TopologicalDepleter {
    pub fn new(config: DepleterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DepleterConfig {
        &self.config
    }

    /// Whether `wrapper` may run given the pending set at iteration start.
    ///
    /// Forward phases wait for in-batch dependencies to complete; keys
    /// outside the batch count as satisfied. Reverse phases wait until no
    /// pending wrapper depends on this one.
    fn is_eligible(
        wrapper: &TopologyWrapper,
        phase: ArtefactPhase,
        pending: &[(usize, TopologyWrapper)],
        batch: &HashSet<ArtefactKey>,
        completed: &HashSet<ArtefactKey>,
    ) -> bool {
        if phase.is_reverse() {
            !pending.iter().any(|(_, other)| other.depends_on(wrapper.key()))
        } else {
            wrapper
                .artefact
                .dependencies
                .iter()
                .all(|d| !batch.contains(d) || completed.contains(d))
        }
    }

    async fn attempt(
        mut wrapper: TopologyWrapper,
        phase: ArtefactPhase,
        timeout: Duration,
    ) -> (TopologyWrapper, Result<()>) {
        wrapper.attempts += 1;
        let synchronizer = Arc::clone(&wrapper.synchronizer);
        let result = match tokio::time::timeout(timeout, synchronizer.apply(&wrapper, phase)).await {
            Ok(result) => result,
            Err(_) => Err(Error::apply_timeout(wrapper.key().as_str(), phase, timeout)),
        };
        (wrapper, result)
    }

    /// Apply `phase` to every wrapper, respecting dependencies.
    ///
    /// Each completed wrapper gets exactly one successful `register_state`.
    /// Each wrapper whose apply kept failing gets exactly one
    /// `register_state` carrying its last error. Wrappers that never
    /// became eligible are reported together through `register_errors`.
    ///
    /// # Errors
    ///
    /// Only store failures raised by the callback; apply failures are data.
    pub async fn deplete(
        &self,
        wrappers: Vec<TopologyWrapper>,
        phase: ArtefactPhase,
        callback: &dyn SynchronizerCallback,
    ) -> Result<DepletionOutcome> {
        let batch: HashSet<ArtefactKey> = wrappers.iter().map(|w| w.key().clone()).collect();
        let mut pending: Vec<(usize, TopologyWrapper)> = wrappers.into_iter().enumerate().collect();
        let mut completed_keys: HashSet<ArtefactKey> = HashSet::new();
        let mut outcome = DepletionOutcome::default();

        while !pending.is_empty() {
            outcome.iterations += 1;

            let (eligible, mut waiting): (Vec<_>, Vec<_>) = {
                let snapshot = &pending;
                let flags = snapshot
                    .iter()
                    .map(|(_, w)| Self::is_eligible(w, phase, snapshot, &batch, &completed_keys))
                    .collect_vec();
                std::mem::take(&mut pending)
                    .into_iter()
                    .zip(flags)
                    .partition_map(|(entry, ok)| {
                        if ok {
                            Either::Left(entry)
                        } else {
                            Either::Right(entry)
                        }
                    })
            };

            debug!(
                phase = %phase,
                iteration = outcome.iterations,
                eligible = eligible.len(),
                waiting = waiting.len(),
                "Depletion iteration"
            );

            if eligible.is_empty() {
                pending = waiting;
                break;
            }

            let timeout = self.config.apply_timeout;
            let results: Vec<(usize, TopologyWrapper, Result<()>)> = stream::iter(eligible)
                .map(|(index, wrapper)| async move {
                    let (wrapper, result) = Self::attempt(wrapper, phase, timeout).await;
                    (index, wrapper, result)
                })
                .buffer_unordered(self.config.max_concurrent_applies.max(1))
                .collect()
                .await;

            let mut progressed = false;
            for (index, mut wrapper, result) in results.into_iter().sorted_by_key(|(i, _, _)| *i) {
                match result {
                    Ok(()) => {
                        progressed = true;
                        debug!(key = %wrapper.key(), state = %phase.success_state(), "Applied");
                        wrapper.completed = true;
                        wrapper.error = None;
                        completed_keys.insert(wrapper.key().clone());

                        let target = phase.target_lifecycle(wrapper.artefact.lifecycle);
                        let synchronizer = Arc::clone(&wrapper.synchronizer);
                        callback
                            .register_state(synchronizer.as_ref(), &mut wrapper.artefact, target, None)
                            .await?;
                        outcome.completed.push(wrapper);
                    }
                    Err(e) => {
                        debug!(key = %wrapper.key(), phase = %phase, error = %e, "Apply failed");
                        wrapper.error = Some(e.to_string());
                        waiting.push((index, wrapper));
                    }
                }
            }

            waiting.sort_by_key(|(i, _)| *i);
            pending = waiting;

            if !progressed {
                break;
            }
        }

        let (failed, mut blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .map(|(_, w)| w)
            .partition(|w| w.attempts > 0);

        for mut wrapper in failed {
            let lifecycle = wrapper.artefact.lifecycle;
            let error = wrapper.error.clone();
            warn!(key = %wrapper.key(), phase = %phase, error = ?error, "Artefact failed to apply");
            let synchronizer = Arc::clone(&wrapper.synchronizer);
            callback
                .register_state(synchronizer.as_ref(), &mut wrapper.artefact, lifecycle, error)
                .await?;
            outcome.failed.push(wrapper);
        }

        if !blocked.is_empty() {
            let label = phase.target_lifecycle(
                blocked
                    .first()
                    .map(|w| w.artefact.lifecycle)
                    .unwrap_or_default(),
            );
            callback
                .register_errors(&mut blocked, &label.to_string(), phase.failure_state())
                .await?;
        }
        outcome.blocked = blocked;

        info!(
            phase = %phase,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            blocked = outcome.blocked.len(),
            iterations = outcome.iterations,
            "Phase depleted"
        );
        Ok(outcome)
    }
}
