//! Parallel executor.
//!
//! This module executes the discovered graph on a thread pool, performing a
//! parallel topological sort where nodes are dispatched as soon as their
//! predecessors are terminal.
//!
//! The algorithm works as follows:
//! 1. Dependency counts are computed for every node, and the nodes with no
//!    pending predecessors are dispatched to the pool.
//! 2. The scheduler thread waits on a results channel.
//! 3. When a node finishes, its outcome is recorded and the dependency
//!    counts of its dependents are decremented.
//! 4. A dependent whose count reaches zero is dispatched immediately, with
//!    a `blocked` flag when any of its predecessors ended in a non-success
//!    state, in which case the worker only evaluates completeness.
//! 5. Once the cancellation token fires, newly ready nodes are recorded as
//!    `Cancelled` instead of being dispatched.
//! 6. The loop ends when every node is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::graph::NodeIndex;
use tracing::info;

use super::{discover, CancelToken, Outcome, RunReport, RunnerConfig};
use crate::task::Task;

pub(crate) fn run(targets: &[Arc<Task>], config: &RunnerConfig, cancel: &CancelToken) -> RunReport {
    let (graph, _) = discover(targets);
    let total = graph.node_count();
    info!(nodes = total, workers = config.workers, "starting parallel run");

    let mut report = RunReport::default();
    if total == 0 {
        return report;
    }

    // Build a map from a dependency to the nodes that depend on it.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|index| {
            (
                index,
                graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let mp = MultiProgress::new();
    let main_pb = mp.add(ProgressBar::new(total as u64));
    main_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("invalid progress bar template")
            .progress_chars("=>-"),
    );
    main_pb.set_message("Running tasks...");

    let spinner_style = ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("invalid progress bar template");

    let mut succeeded: HashMap<NodeIndex, bool> = HashMap::new();
    let retries = config.retries;

    let execute = |scope: &rayon::Scope<'_>| {
        let (result_sender, result_receiver) = unbounded::<(NodeIndex, Outcome)>();

        // A helper closure to dispatch one node onto the pool.
        let dispatch = |scope: &rayon::Scope<'_>, index: NodeIndex, blocked: bool| {
            let node = graph[index].clone();
            let sender = result_sender.clone();
            let mp = mp.clone();
            let style = spinner_style.clone();

            scope.spawn(move |_| {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(style);
                pb.set_message(node.name());
                pb.enable_steady_tick(Duration::from_millis(100));

                let outcome = node.evaluate(blocked, retries);

                pb.finish_and_clear();
                sender
                    .send((index, outcome))
                    .expect("runner result channel closed");
            });
        };

        // Seed the initially ready nodes.
        for index in graph.node_indices() {
            if dependency_counts[&index] == 0 {
                dispatch(scope, index, false);
            }
        }

        // Scheduler loop: the pool executes while this thread bookkeeps.
        // Cancelled nodes never reach a worker; they are recorded here as
        // synthetic events so their dependents still unlock.
        let mut completed = 0usize;
        let mut pending: Vec<(NodeIndex, Outcome)> = Vec::new();
        while completed < total {
            let (index, outcome) = match pending.pop() {
                Some(event) => event,
                None => result_receiver
                    .recv()
                    .expect("runner result channel closed"),
            };
            let node = &graph[index];

            info!(node = %node.name(), outcome = %outcome, "node finished");
            succeeded.insert(index, outcome.is_terminal_success());
            report.insert(node.hash(), node.name(), outcome);
            completed += 1;
            main_pb.inc(1);

            // Unlock dependents.
            if let Some(children) = dependents.get(&index) {
                for &child in children {
                    let count = dependency_counts
                        .get_mut(&child)
                        .expect("dependent missing from dependency counts");
                    *count -= 1;
                    if *count > 0 {
                        continue;
                    }

                    if cancel.is_cancelled() {
                        pending.push((child, Outcome::Cancelled));
                        continue;
                    }

                    let blocked = graph
                        .neighbors_directed(child, petgraph::Direction::Incoming)
                        .any(|parent| !succeeded.get(&parent).copied().unwrap_or(false));
                    dispatch(scope, child, blocked);
                }
            }
        }
    };

    if config.workers == 0 {
        rayon::scope(execute);
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .expect("failed to build runner thread pool");
        pool.scope(execute);
    }

    main_pb.finish_with_message("Run complete");
    report
}
