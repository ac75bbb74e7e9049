//! Topological executors.
//!
//! A runner takes a set of target tasks, discovers the full dependency
//! graph behind them, and drives every node to a terminal state: `Success`,
//! `Skipped` (already complete), `BlockedUpstream`, `Cancelled`, or
//! `Failed`. User-function errors never escape the runner; they are
//! captured and attributed to the failing node, and everything downstream
//! of a failure is blocked without being invoked.

mod parallel;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::{info, warn};

use crate::engine::PersistenceEngine;
use crate::error::{EngineError, TaskError};
use crate::hash::Hash32;
use crate::metadata::DatasetMetadata;
use crate::task::{RunOutcome, Task, Upstream};

/// Cooperative cancellation signal shared between a runner and its caller.
/// Cancelling stops the dispatch of new nodes; in-flight tasks finish on
/// their own terms.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Terminal state of one node in a run.
#[derive(Debug)]
pub enum Outcome {
    /// The task's function ran and its output is complete.
    Success,
    /// The output was already complete; nothing ran.
    Skipped,
    /// A predecessor did not reach `Success`/`Skipped`; the function was
    /// never invoked.
    BlockedUpstream,
    /// The run was cancelled before this node was dispatched.
    Cancelled,
    Failed(TaskError),
}

impl Outcome {
    /// Did this node end in a state its dependents can build on?
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Skipped)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Skipped => f.write_str("skipped (already complete)"),
            Outcome::BlockedUpstream => f.write_str("blocked upstream"),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::Failed(error) => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug)]
pub struct NodeReport {
    pub name: String,
    pub outcome: Outcome,
}

/// Per-node outcomes of one run, keyed by dataset hash.
#[derive(Debug, Default)]
pub struct RunReport {
    nodes: BTreeMap<Hash32, NodeReport>,
}

impl RunReport {
    pub fn outcome_of(&self, metadata: &DatasetMetadata) -> Option<&Outcome> {
        self.nodes.get(&metadata.hash()).map(|node| &node.outcome)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&Hash32, &NodeReport)> {
        self.nodes.iter()
    }

    /// True when every node ended in `Success` or `Skipped`.
    pub fn is_success(&self) -> bool {
        self.nodes
            .values()
            .all(|node| node.outcome.is_terminal_success())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn count(&self, matcher: impl Fn(&Outcome) -> bool) -> usize {
        self.nodes
            .values()
            .filter(|node| matcher(&node.outcome))
            .count()
    }

    fn insert(&mut self, hash: Hash32, name: String, outcome: Outcome) {
        self.nodes.insert(hash, NodeReport { name, outcome });
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run of {} nodes:", self.nodes.len())?;
        writeln!(f, "    {} succeeded", self.count(|o| matches!(o, Outcome::Success)))?;
        writeln!(
            f,
            "    {} skipped as already complete",
            self.count(|o| matches!(o, Outcome::Skipped))
        )?;
        writeln!(
            f,
            "    {} blocked by an upstream failure",
            self.count(|o| matches!(o, Outcome::BlockedUpstream))
        )?;
        writeln!(f, "    {} cancelled", self.count(|o| matches!(o, Outcome::Cancelled)))?;
        writeln!(f, "    {} failed", self.count(|o| matches!(o, Outcome::Failed(_))))?;

        let mut failed: Vec<&NodeReport> = self
            .nodes
            .values()
            .filter(|node| matches!(node.outcome, Outcome::Failed(_)))
            .collect();
        failed.sort_by(|a, b| a.name.cmp(&b.name));
        for node in failed {
            writeln!(f, "        {}: {}", node.name, node.outcome)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Worker threads for the parallel runner; `0` uses the global pool.
    pub workers: usize,
    /// How many times a task failing with a transient engine error is
    /// retried before the failure sticks.
    pub retries: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            workers: 0,
            retries: 0,
        }
    }
}

/// One node of the discovered execution graph: a task constructed in this
/// run, or a stored dataset the graph assumes to exist (a leaf assumption).
#[derive(Clone)]
pub(crate) enum Node {
    Task(Arc<Task>),
    Assumption {
        metadata: DatasetMetadata,
        engine: Arc<dyn PersistenceEngine>,
    },
}

impl Node {
    pub(crate) fn name(&self) -> String {
        match self {
            Node::Task(task) => task.name().to_string(),
            Node::Assumption { metadata, .. } => metadata.name().to_string(),
        }
    }

    pub(crate) fn hash(&self) -> Hash32 {
        match self {
            Node::Task(task) => task.output().hash(),
            Node::Assumption { metadata, .. } => metadata.hash(),
        }
    }

    /// Resolve this node to a terminal outcome. `blocked` is whether some
    /// predecessor ended in a non-success state; completion is evaluated
    /// first regardless, so an already-complete node downstream of a
    /// failure is still a clean skip.
    pub(crate) fn evaluate(&self, blocked: bool, retries: usize) -> Outcome {
        match self {
            Node::Assumption { metadata, engine } => {
                evaluate_assumption(metadata, engine.as_ref())
            }
            Node::Task(task) => match task.complete() {
                Err(error) => Outcome::Failed(error),
                Ok(true) => Outcome::Skipped,
                Ok(false) if blocked => Outcome::BlockedUpstream,
                Ok(false) => run_with_retry(task, retries),
            },
        }
    }
}

/// A leaf assumption is satisfied when its dataset exists and, for series
/// data, holds any rows at all. That is the irregular notion of completeness,
/// since nothing in this run owns a checker for it.
fn evaluate_assumption(metadata: &DatasetMetadata, engine: &dyn PersistenceEngine) -> Outcome {
    match engine.exists(metadata) {
        Err(error) => Outcome::Failed(error.into()),
        Ok(false) => Outcome::Failed(TaskError::Incomplete(format!(
            "assumed dataset '{}' does not exist in engine '{}'",
            metadata.name(),
            engine.engine_id(),
        ))),
        Ok(true) if metadata.is_static() => Outcome::Skipped,
        Ok(true) => match engine.range(metadata) {
            Err(error) => Outcome::Failed(error.into()),
            Ok(Some(_)) => Outcome::Skipped,
            Ok(None) => Outcome::Failed(TaskError::Incomplete(format!(
                "assumed dataset '{}' exists but holds no data",
                metadata.name(),
            ))),
        },
    }
}

fn run_with_retry(task: &Arc<Task>, retries: usize) -> Outcome {
    let started = Instant::now();
    let mut attempt = 0;

    let outcome = loop {
        match task.run() {
            RunOutcome::Success | RunOutcome::AlreadyComplete => break Outcome::Success,
            RunOutcome::Incomplete(reason) => {
                break Outcome::Failed(TaskError::Incomplete(reason))
            }
            RunOutcome::Failed(TaskError::Engine(EngineError::Transient {
                reason,
                retry_after,
            })) if attempt < retries => {
                attempt += 1;
                warn!(
                    task = task.name(),
                    attempt,
                    reason = %reason,
                    "transient engine failure, retrying"
                );
                if let Some(delay) = retry_after {
                    std::thread::sleep(delay);
                }
            }
            RunOutcome::Failed(error) => break Outcome::Failed(error),
        }
    };

    // Timeouts are detected on completion; the runner never interrupts a
    // user function mid-flight.
    if let Some(timeout) = task.timeout() {
        if started.elapsed() > timeout {
            return Outcome::Failed(TaskError::Timeout(timeout));
        }
    }

    outcome
}

/// Walk the targets' dependencies into a DAG. Edges point from a
/// dependency to its dependent. Nodes are deduplicated by dataset hash, so
/// diamonds collapse and each dataset is evaluated once.
pub(crate) fn discover(targets: &[Arc<Task>]) -> (DiGraph<Node, ()>, HashMap<Hash32, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut indices: HashMap<Hash32, NodeIndex> = HashMap::new();
    let mut frontier: Vec<Arc<Task>> = Vec::new();

    for target in targets {
        let hash = target.output().hash();
        if !indices.contains_key(&hash) {
            let index = graph.add_node(Node::Task(target.clone()));
            indices.insert(hash, index);
            frontier.push(target.clone());
        }
    }

    while let Some(task) = frontier.pop() {
        let task_index = indices[&task.output().hash()];

        for dependency in task.dependencies().values() {
            let upstream = dependency.upstream();
            let upstream_hash = upstream.metadata().hash();

            let upstream_index = match indices.get(&upstream_hash) {
                Some(index) => *index,
                None => {
                    let node = match upstream {
                        Upstream::Task(parent) => {
                            frontier.push(parent.clone());
                            Node::Task(parent.clone())
                        }
                        Upstream::Stored { metadata, engine } => Node::Assumption {
                            metadata: metadata.clone(),
                            engine: engine.clone(),
                        },
                    };
                    let index = graph.add_node(node);
                    indices.insert(upstream_hash, index);
                    index
                }
            };

            graph.update_edge(upstream_index, task_index, ());
        }
    }

    (graph, indices)
}

/// Deterministic topological order: Kahn's algorithm with the ready set
/// ordered by dataset hash, so identical graphs run in identical order.
pub(crate) fn topo_order(graph: &DiGraph<Node, ()>) -> Vec<NodeIndex> {
    let mut pending: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|index| {
            (
                index,
                graph.neighbors_directed(index, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut ready: BTreeMap<Hash32, NodeIndex> = graph
        .node_indices()
        .filter(|index| pending[index] == 0)
        .map(|index| (graph[index].hash(), index))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some((&hash, &index)) = ready.iter().next() {
        ready.remove(&hash);
        order.push(index);

        for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
            let count = pending
                .get_mut(&dependent)
                .expect("dependent missing from pending counts");
            *count -= 1;
            if *count == 0 {
                ready.insert(graph[dependent].hash(), dependent);
            }
        }
    }

    // The graph is built from value-embedded metadata, which cannot be
    // cyclic; every node is therefore reachable.
    debug_assert_eq!(order.len(), graph.node_count());
    order
}

/// Scheduler over a set of target tasks.
#[derive(Debug, Default)]
pub struct Runner {
    config: RunnerConfig,
    cancel: CancelToken,
}

impl Runner {
    pub fn new() -> Self {
        Runner::default()
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Runner {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// A token that can cancel this runner from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute the graph serially, in deterministic topological order.
    pub fn run(&self, targets: &[Arc<Task>]) -> RunReport {
        let (graph, _) = discover(targets);
        let order = topo_order(&graph);
        info!(nodes = order.len(), "starting serial run");

        let mut succeeded: HashMap<NodeIndex, bool> = HashMap::new();
        let mut report = RunReport::default();

        for index in order {
            let node = &graph[index];

            let outcome = if self.cancel.is_cancelled() {
                Outcome::Cancelled
            } else {
                let blocked = graph
                    .neighbors_directed(index, Direction::Incoming)
                    .any(|parent| !succeeded[&parent]);
                node.evaluate(blocked, self.config.retries)
            };

            info!(node = %node.name(), outcome = %outcome, "node finished");
            succeeded.insert(index, outcome.is_terminal_success());
            report.insert(node.hash(), node.name(), outcome);
        }

        report
    }

    /// Execute the graph on a worker pool; see [`parallel`].
    pub fn run_parallel(&self, targets: &[Arc<Task>]) -> RunReport {
        parallel::run(targets, &self.config, &self.cancel)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use anyhow::anyhow;

    use super::*;
    use crate::context::Context;
    use crate::engine::MemoryEngine;
    use crate::series::{Frame, Payload};
    use crate::task::{Dependency, TaskArgs};
    use crate::time::{TimeRange, Timestamp};

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn target() -> TimeRange {
        TimeRange::new(ts("2020-01-01T00:00:00Z"), ts("2020-01-10T00:00:00Z")).unwrap()
    }

    fn context(engine: &Arc<MemoryEngine>) -> Context {
        Context::new()
            .with_version("1")
            .with_engine(engine.clone() as Arc<dyn PersistenceEngine>)
            .with_target_range(target())
    }

    fn emit(counter: &Arc<AtomicUsize>) -> impl Fn(&TaskArgs) -> anyhow::Result<Payload> + Send + Sync + 'static {
        let counter = counter.clone();
        move |args: &TaskArgs| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            let window = args.time_range().expect("time-series window");
            Ok(Frame::single("value", vec![(window.start(), 1.0)])?.into())
        }
    }

    #[test]
    fn upstream_failure_blocks_the_whole_chain() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let b_calls = Arc::new(AtomicUsize::new(0));
        let c_calls = Arc::new(AtomicUsize::new(0));

        let a = ctx
            .time_series_task("a", |_args: &TaskArgs| Err(anyhow!("source is down")))
            .build()
            .unwrap();
        let b = ctx
            .time_series_task("b", emit(&b_calls))
            .input("a", &a)
            .build()
            .unwrap();
        let c = ctx
            .time_series_task("c", emit(&c_calls))
            .input("b", &b)
            .build()
            .unwrap();

        let report = Runner::new().run(&[c.clone()]);

        assert!(matches!(
            report.outcome_of(a.output()),
            Some(Outcome::Failed(TaskError::UserFunction(_)))
        ));
        assert!(matches!(
            report.outcome_of(b.output()),
            Some(Outcome::BlockedUpstream)
        ));
        assert!(matches!(
            report.outcome_of(c.output()),
            Some(Outcome::BlockedUpstream)
        ));

        // The blocked functions were never invoked.
        assert_eq!(b_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(c_calls.load(AtomicOrdering::SeqCst), 0);
        assert!(!report.is_success());

        let rendered = report.to_string();
        assert!(rendered.contains("1 failed"));
        assert!(rendered.contains("a: failed"));
    }

    #[test]
    fn complete_nodes_are_skipped_without_writes() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let calls = Arc::new(AtomicUsize::new(0));
        let task = ctx.time_series_task("bars", emit(&calls)).build().unwrap();

        let first = Runner::new().run(&[task.clone()]);
        assert!(matches!(
            first.outcome_of(task.output()),
            Some(Outcome::Success)
        ));

        let second = Runner::new().run(&[task.clone()]);
        assert!(matches!(
            second.outcome_of(task.output()),
            Some(Outcome::Skipped)
        ));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn diamond_runs_the_shared_parent_once_in_parallel() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let source_calls = Arc::new(AtomicUsize::new(0));
        let source = ctx
            .time_series_task("source", emit(&source_calls))
            .build()
            .unwrap();

        let passthrough = |name: &str| {
            ctx.time_series_task(name, |args: &TaskArgs| {
                Ok(args.series("source")?.clone().into())
            })
            .input("source", &source)
            .build()
            .unwrap()
        };
        let left = passthrough("left");
        let right = passthrough("right");

        let sink = ctx
            .time_series_task("sink", |args: &TaskArgs| {
                let left = args.series("left")?;
                args.series("right")?;
                Ok(left.clone().into())
            })
            .input("left", &left)
            .input("right", &right)
            .build()
            .unwrap();

        let report = Runner::new().run_parallel(&[sink.clone()]);

        assert!(report.is_success(), "report was:\n{report}");
        assert_eq!(report.len(), 4);
        assert_eq!(source_calls.load(AtomicOrdering::SeqCst), 1);
        assert!(matches!(
            report.outcome_of(sink.output()),
            Some(Outcome::Success)
        ));
    }

    #[test]
    fn stored_upstreams_are_leaf_assumptions() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let stored_md = crate::metadata::DatasetMetadata::builder("external.bars")
            .version("1")
            .engine(engine.engine_id().clone())
            .build()
            .unwrap();
        let frame = Frame::single("close", vec![(ts("2020-01-02T00:00:00Z"), 1.0)]).unwrap();
        engine.append(&stored_md, frame.into()).unwrap();

        let consumer_calls = Arc::new(AtomicUsize::new(0));
        let consumer = ctx
            .time_series_task("consumer", emit(&consumer_calls))
            .dependency(
                "bars",
                Dependency::stored(
                    stored_md.clone(),
                    engine.clone() as Arc<dyn PersistenceEngine>,
                )
                .unwrap(),
            )
            .build()
            .unwrap();

        let report = Runner::new().run(&[consumer.clone()]);
        assert!(matches!(
            report.outcome_of(&stored_md),
            Some(Outcome::Skipped)
        ));
        assert!(matches!(
            report.outcome_of(consumer.output()),
            Some(Outcome::Success)
        ));

        // A missing assumption blocks its consumer instead.
        let missing_md = crate::metadata::DatasetMetadata::builder("external.missing")
            .version("1")
            .engine(engine.engine_id().clone())
            .build()
            .unwrap();
        let blocked_calls = Arc::new(AtomicUsize::new(0));
        let blocked = ctx
            .time_series_task("blocked", emit(&blocked_calls))
            .dependency(
                "bars",
                Dependency::stored(
                    missing_md.clone(),
                    engine.clone() as Arc<dyn PersistenceEngine>,
                )
                .unwrap(),
            )
            .build()
            .unwrap();

        let report = Runner::new().run(&[blocked.clone()]);
        assert!(matches!(
            report.outcome_of(&missing_md),
            Some(Outcome::Failed(_))
        ));
        assert!(matches!(
            report.outcome_of(blocked.output()),
            Some(Outcome::BlockedUpstream)
        ));
        assert_eq!(blocked_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn cancelled_runs_dispatch_nothing() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let calls = Arc::new(AtomicUsize::new(0));
        let task = ctx.time_series_task("bars", emit(&calls)).build().unwrap();

        let runner = Runner::new();
        runner.cancel_token().cancel();
        let report = runner.run(&[task.clone()]);

        assert!(matches!(
            report.outcome_of(task.output()),
            Some(Outcome::Cancelled)
        ));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn serial_order_is_deterministic() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let a = ctx
            .time_series_task("a", |_args: &TaskArgs| Ok(Frame::default().into()))
            .build()
            .unwrap();
        let b = ctx
            .time_series_task("b", |_args: &TaskArgs| Ok(Frame::default().into()))
            .build()
            .unwrap();

        let (graph, _) = discover(&[a.clone(), b.clone()]);
        let first: Vec<Hash32> = topo_order(&graph).iter().map(|i| graph[*i].hash()).collect();

        let (graph2, _) = discover(&[b, a]);
        let second: Vec<Hash32> = topo_order(&graph2)
            .iter()
            .map(|i| graph2[*i].hash())
            .collect();

        // Target order does not matter; the hash tie-break decides.
        assert_eq!(first, second);
    }
}
