//! Depleter property-based tests.
//!
//! Random dependency graphs, shuffled into random input order, must always
//! deplete to a fixed point that respects every in-batch edge.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use artesync_reconciler::{
    Artefact, ArtefactKey, ArtefactPhase, DepleterConfig, DepletionOutcome, DocumentSynchronizer,
    InMemoryArtefactStore, PassCallback, Synchronizer, TopologicalDepleter, TopologicalSorter,
    TopologyWrapper,
};
use common::RecordingExecutor;
use proptest::prelude::*;

/// `n` nodes, an adjacency matrix and an input permutation.
fn graph(max_nodes: usize) -> impl Strategy<Value = (usize, Vec<Vec<bool>>, Vec<usize>)> {
    (1..=max_nodes).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
            Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
        )
    })
}

fn node_key(i: usize) -> ArtefactKey {
    let name = format!("n{i}");
    ArtefactKey::derive("role", &format!("/{name}.role"), &name)
}

fn wrappers(
    n: usize,
    edges: &[Vec<bool>],
    order: &[usize],
    acyclic: bool,
    phase: ArtefactPhase,
) -> Vec<TopologyWrapper> {
    let sync: Arc<dyn Synchronizer> = Arc::new(DocumentSynchronizer::new(
        "role",
        "role",
        Arc::new(InMemoryArtefactStore::default()),
        Arc::new(RecordingExecutor::default()),
    ));

    order
        .iter()
        .map(|&i| {
            let name = format!("n{i}");
            let deps = (0..n).filter(|&j| {
                let edge = edges.get(i).and_then(|row| row.get(j)).copied().unwrap_or(false);
                edge && j != i && (!acyclic || j < i)
            });
            let artefact = deps.fold(
                Artefact::new("role", format!("/{name}.role"), name.as_bytes()),
                |a, j| a.with_dependency(node_key(j)),
            );
            TopologyWrapper::new(artefact, Arc::clone(&sync), phase)
        })
        .collect()
}

fn deplete(batch: Vec<TopologyWrapper>, phase: ArtefactPhase) -> Option<(DepletionOutcome, PassCallback)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .ok()?;
    let depleter = TopologicalDepleter::new(DepleterConfig {
        max_concurrent_applies: 3,
        ..DepleterConfig::default()
    });
    let callback = PassCallback::new();
    let outcome = runtime
        .block_on(depleter.deplete(TopologicalSorter::sort_for(batch, phase), phase, &callback))
        .ok()?;
    Some((outcome, callback))
}

proptest! {
    #[test]
    fn property_acyclic_batch_completes_in_dependency_order((n, edges, order) in graph(8)) {
        let batch = wrappers(n, &edges, &order, true, ArtefactPhase::Create);
        let result = deplete(batch, ArtefactPhase::Create);
        prop_assert!(result.is_some());
        let Some((outcome, callback)) = result else { return Ok(()) };

        prop_assert_eq!(outcome.completed.len(), n);
        prop_assert!(outcome.failed.is_empty());
        prop_assert!(outcome.blocked.is_empty());

        let mut done: HashSet<ArtefactKey> = HashSet::new();
        for wrapper in &outcome.completed {
            for dependency in &wrapper.artefact.dependencies {
                prop_assert!(done.contains(dependency), "{} applied before {}", wrapper.key(), dependency);
            }
            prop_assert_eq!(callback.state_count(wrapper.key()), 1);
            done.insert(wrapper.key().clone());
        }
    }

    #[test]
    fn property_any_batch_reaches_fixed_point((n, edges, order) in graph(8)) {
        let batch = wrappers(n, &edges, &order, false, ArtefactPhase::Create);
        let result = deplete(batch, ArtefactPhase::Create);
        prop_assert!(result.is_some());
        let Some((outcome, callback)) = result else { return Ok(()) };

        prop_assert_eq!(outcome.completed.len() + outcome.failed.len() + outcome.blocked.len(), n);
        prop_assert!(outcome.iterations <= n + 1);

        let completed: HashSet<&ArtefactKey> = outcome.completed.iter().map(TopologyWrapper::key).collect();
        for wrapper in &outcome.blocked {
            let waiting = wrapper.artefact.dependencies.iter().any(|d| !completed.contains(d));
            prop_assert!(waiting, "{} was blocked with all dependencies complete", wrapper.key());
        }
        for wrapper in outcome.completed.iter().chain(outcome.blocked.iter()) {
            prop_assert!(callback.state_count(wrapper.key()) <= 1);
        }
    }

    #[test]
    fn property_delete_never_removes_a_dependency_before_its_dependent((n, edges, order) in graph(8)) {
        let batch = wrappers(n, &edges, &order, true, ArtefactPhase::Delete)
            .into_iter()
            .map(|mut w| {
                w.artefact.lifecycle = artesync_reconciler::ArtefactLifecycle::Created;
                w
            })
            .collect();
        let result = deplete(batch, ArtefactPhase::Delete);
        prop_assert!(result.is_some());
        let Some((outcome, _)) = result else { return Ok(()) };

        prop_assert_eq!(outcome.completed.len(), n);
        let position = |key: &ArtefactKey| outcome.completed.iter().position(|w| w.key() == key);
        for wrapper in &outcome.completed {
            for dependency in &wrapper.artefact.dependencies {
                prop_assert!(position(wrapper.key()) < position(dependency));
            }
        }
    }
}
