//! Runtime graph nodes.
//!
//! A [`Task`] pairs a user function with a dataset identity, a set of
//! dependencies, a completion checker and a persistence engine. Tasks are
//! logically immutable after construction: `output()` is computed once and
//! never changes, and `run()` is idempotent: an already-complete task
//! performs no work and no writes.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use chrono::Duration;
use tracing::{debug, info};

use crate::check::CompletionChecker;
use crate::engine::PersistenceEngine;
use crate::error::{MetadataError, TaskError};
use crate::metadata::DatasetMetadata;
use crate::params::{Parameter, Params};
use crate::series::{Frame, Payload};
use crate::time::TimeRange;

/// The inputs handed to a user function: dependency payloads keyed by the
/// name they were registered under, scalar parameters, and the fetch
/// window for this invocation.
pub struct TaskArgs {
    inputs: BTreeMap<String, Payload>,
    params: Params,
    time_range: Option<TimeRange>,
}

impl TaskArgs {
    pub(crate) fn new(
        inputs: BTreeMap<String, Payload>,
        params: Params,
        time_range: Option<TimeRange>,
    ) -> Self {
        TaskArgs {
            inputs,
            params,
            time_range,
        }
    }

    /// The payload of the dependency registered under `name`.
    pub fn input(&self, name: &str) -> anyhow::Result<&Payload> {
        self.inputs
            .get(name)
            .ok_or_else(|| anyhow!("no dependency registered under '{name}'"))
    }

    /// A dependency's payload as a time series.
    pub fn series(&self, name: &str) -> anyhow::Result<&Frame> {
        self.input(name)?
            .as_series()
            .ok_or_else(|| anyhow!("dependency '{name}' is static, not a time series"))
    }

    /// A dependency's payload as a static value.
    pub fn scalar(&self, name: &str) -> anyhow::Result<&serde_json::Value> {
        self.input(name)?
            .as_scalar()
            .ok_or_else(|| anyhow!("dependency '{name}' is a time series, not static"))
    }

    pub fn param(&self, name: &str) -> anyhow::Result<&Parameter> {
        self.params
            .get(name)
            .ok_or_else(|| anyhow!("no parameter named '{name}'"))
    }

    pub fn int(&self, name: &str) -> anyhow::Result<i64> {
        match self.param(name)? {
            Parameter::Int(value) => Ok(*value),
            other => Err(anyhow!("parameter '{name}' is not an integer: {other:?}")),
        }
    }

    pub fn float(&self, name: &str) -> anyhow::Result<f64> {
        match self.param(name)? {
            Parameter::Float(value) => Ok(*value),
            Parameter::Int(value) => Ok(*value as f64),
            other => Err(anyhow!("parameter '{name}' is not a number: {other:?}")),
        }
    }

    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        match self.param(name)? {
            Parameter::Str(value) => Ok(value),
            other => Err(anyhow!("parameter '{name}' is not a string: {other:?}")),
        }
    }

    /// The window this invocation is being asked to produce, lookbacks not
    /// included. `None` for static tasks.
    pub fn time_range(&self) -> Option<&TimeRange> {
        self.time_range.as_ref()
    }
}

/// A unit of user computation.
pub type TaskFn = Arc<dyn Fn(&TaskArgs) -> anyhow::Result<Payload> + Send + Sync>;

/// Where a dependency's data comes from: a task constructed in this run,
/// or a dataset assumed to already exist in some engine.
#[derive(Clone)]
pub enum Upstream {
    Task(Arc<Task>),
    Stored {
        metadata: DatasetMetadata,
        engine: Arc<dyn PersistenceEngine>,
    },
}

impl Upstream {
    pub fn metadata(&self) -> &DatasetMetadata {
        match self {
            Upstream::Task(task) => task.output(),
            Upstream::Stored { metadata, .. } => metadata,
        }
    }

    /// The engine that owns the upstream's data. Reads always go through
    /// this engine, not the engine of whichever task consumes the data:
    /// the engine follows the metadata.
    pub fn engine(&self) -> &Arc<dyn PersistenceEngine> {
        match self {
            Upstream::Task(task) => task.engine(),
            Upstream::Stored { engine, .. } => engine,
        }
    }

    pub fn checker(&self) -> Option<&Arc<dyn CompletionChecker>> {
        match self {
            Upstream::Task(task) => task.checker(),
            Upstream::Stored { .. } => None,
        }
    }

    fn is_time_series(&self) -> bool {
        !self.metadata().is_static()
    }
}

impl Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Task(task) => write!(f, "Upstream::Task({})", task.name()),
            Upstream::Stored { metadata, .. } => {
                write!(f, "Upstream::Stored({})", metadata.name())
            }
        }
    }
}

/// An edge from a consuming task to one of its inputs, carrying the
/// lookback window and the completion-inheritance flag.
#[derive(Clone, Debug)]
pub struct Dependency {
    upstream: Upstream,
    lookback: Duration,
    inherit_frequency: bool,
}

impl Dependency {
    /// Wrap a task with no lookback, inheriting its completion cadence.
    /// This is the lifting applied wherever a bare task is given.
    pub fn new(task: &Arc<Task>) -> Self {
        Dependency {
            upstream: Upstream::Task(task.clone()),
            lookback: Duration::zero(),
            inherit_frequency: true,
        }
    }

    /// Depend on a dataset that no task in this run produces. The engine
    /// must be the one the metadata names.
    pub fn stored(
        metadata: DatasetMetadata,
        engine: Arc<dyn PersistenceEngine>,
    ) -> Result<Self, MetadataError> {
        if metadata.engine_id() != engine.engine_id() {
            return Err(MetadataError::EngineMismatch {
                expected: metadata.engine_id().to_string(),
                found: engine.engine_id().to_string(),
            });
        }
        Ok(Dependency {
            upstream: Upstream::Stored { metadata, engine },
            lookback: Duration::zero(),
            inherit_frequency: true,
        })
    }

    pub fn lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn inherit_frequency(mut self, inherit: bool) -> Self {
        self.inherit_frequency = inherit;
        self
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub(crate) fn lookback_duration(&self) -> Duration {
        self.lookback
    }

    pub(crate) fn inherits_frequency(&self) -> bool {
        self.inherit_frequency
    }

    /// The window to pull from this dependency for a given child target:
    /// the target extended backward by the lookback.
    pub fn fetch_range(&self, child_target: &TimeRange) -> TimeRange {
        child_target.with_lookback(self.lookback)
    }

    fn fetch(&self, child_target: &TimeRange) -> Result<Payload, TaskError> {
        let metadata = self.upstream.metadata();
        let engine = self.upstream.engine();

        if self.upstream.is_time_series() {
            let window = self.fetch_range(child_target);
            Ok(engine.read(metadata, Some(&window))?)
        } else {
            Ok(engine.read(metadata, None)?)
        }
    }

    fn fetch_full(&self) -> Result<Payload, TaskError> {
        Ok(self.upstream.engine().read(self.upstream.metadata(), None)?)
    }
}

pub(crate) enum Shape {
    TimeSeries {
        target_range: TimeRange,
        checker: Arc<dyn CompletionChecker>,
    },
    Static,
}

/// The terminal states of [`Task::run`].
#[derive(Debug)]
pub enum RunOutcome {
    /// The function ran and the output is now complete.
    Success,
    /// Nothing to do; no engine writes were performed.
    AlreadyComplete,
    /// The function ran and wrote its output, but the completion checker
    /// still reports the dataset incomplete.
    Incomplete(String),
    Failed(TaskError),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success | RunOutcome::AlreadyComplete)
    }
}

/// A node in the runtime graph.
pub struct Task {
    name: String,
    params: Params,
    dependencies: BTreeMap<String, Dependency>,
    shape: Shape,
    engine: Arc<dyn PersistenceEngine>,
    function: TaskFn,
    timeout: Option<StdDuration>,
    output: DatasetMetadata,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        name: String,
        params: Params,
        dependencies: BTreeMap<String, Dependency>,
        shape: Shape,
        engine: Arc<dyn PersistenceEngine>,
        function: TaskFn,
        timeout: Option<StdDuration>,
        output: DatasetMetadata,
    ) -> Self {
        Task {
            name,
            params,
            dependencies,
            shape,
            engine,
            function,
            timeout,
            output,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The dataset identity this task produces. Deterministic and stable:
    /// computed once at construction.
    pub fn output(&self) -> &DatasetMetadata {
        &self.output
    }

    pub fn engine(&self) -> &Arc<dyn PersistenceEngine> {
        &self.engine
    }

    pub fn dependencies(&self) -> &BTreeMap<String, Dependency> {
        &self.dependencies
    }

    pub fn is_static(&self) -> bool {
        matches!(self.shape, Shape::Static)
    }

    pub fn target_range(&self) -> Option<&TimeRange> {
        match &self.shape {
            Shape::TimeSeries { target_range, .. } => Some(target_range),
            Shape::Static => None,
        }
    }

    pub fn checker(&self) -> Option<&Arc<dyn CompletionChecker>> {
        match &self.shape {
            Shape::TimeSeries { checker, .. } => Some(checker),
            Shape::Static => None,
        }
    }

    pub fn timeout(&self) -> Option<StdDuration> {
        self.timeout
    }

    /// Is the persisted output up to date for the target range?
    pub fn complete(&self) -> Result<bool, TaskError> {
        match &self.shape {
            Shape::Static => Ok(self.engine.exists(&self.output)?),
            Shape::TimeSeries {
                target_range,
                checker,
            } => {
                let existing = self.engine.range(&self.output)?;
                Ok(checker.is_complete(target_range, existing.as_ref())?)
            }
        }
    }

    /// Run the task if its output is not already complete. Idempotent.
    pub fn run(&self) -> RunOutcome {
        match self.try_run() {
            Ok(outcome) => outcome,
            Err(TaskError::Incomplete(reason)) => RunOutcome::Incomplete(reason),
            Err(error) => RunOutcome::Failed(error),
        }
    }

    /// The stored output over the target range.
    pub fn read(&self) -> Result<Payload, TaskError> {
        Ok(self.engine.read(&self.output, self.target_range())?)
    }

    fn try_run(&self) -> Result<RunOutcome, TaskError> {
        if self.complete()? {
            debug!(task = %self.name, "output already complete, skipping");
            return Ok(RunOutcome::AlreadyComplete);
        }

        match &self.shape {
            Shape::Static => self.run_static(),
            Shape::TimeSeries { target_range, .. } => self.run_series(*target_range),
        }
    }

    fn run_static(&self) -> Result<RunOutcome, TaskError> {
        let mut inputs = BTreeMap::new();
        for (name, dependency) in &self.dependencies {
            inputs.insert(name.clone(), dependency.fetch_full()?);
        }

        let args = TaskArgs::new(inputs, self.params.clone(), None);
        let result = (self.function)(&args).map_err(TaskError::UserFunction)?;

        self.engine.replace(&self.output, result)?;
        info!(task = %self.name, "static task completed");
        Ok(RunOutcome::Success)
    }

    fn run_series(&self, target: TimeRange) -> Result<RunOutcome, TaskError> {
        let existing = self.engine.range(&self.output)?;

        // Only the part of the target past the end of the stored data needs
        // to be produced, and only when the stored data is a prefix of the
        // target; anything else recomputes the whole window.
        let missing = match existing {
            Some(stored)
                if stored.intersects(&target)
                    && stored.start() <= target.start()
                    && stored.end() < target.end() =>
            {
                target.since(stored.end())
            }
            _ => target,
        };

        debug!(task = %self.name, %missing, "computing missing range");

        let mut inputs = BTreeMap::new();
        for (name, dependency) in &self.dependencies {
            inputs.insert(name.clone(), dependency.fetch(&missing)?);
        }

        let args = TaskArgs::new(inputs, self.params.clone(), Some(missing));
        let result = (self.function)(&args).map_err(TaskError::UserFunction)?;

        let Payload::Series(frame) = result else {
            return Err(TaskError::UserFunction(anyhow!(
                "time-series task '{}' returned a static payload",
                self.name
            )));
        };

        // A time-series task never writes outside its target range.
        let frame = frame.view(&target);

        match existing {
            None => self.engine.append(&self.output, frame.into())?,
            Some(stored) => {
                let strictly_extends = frame
                    .first()
                    .map(|first| first >= stored.end())
                    .unwrap_or(true);
                if strictly_extends {
                    self.engine.append(&self.output, frame.into())?;
                } else {
                    self.engine.merge(&self.output, frame.into())?;
                }
            }
        }

        if !self.complete()? {
            return Err(TaskError::Incomplete(format!(
                "task '{}' ran and wrote its output, but the completion checker still \
                 reports it incomplete",
                self.name
            )));
        }

        info!(task = %self.name, "task completed");
        Ok(RunOutcome::Success)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("static", &self.is_static())
            .field("dependencies", &self.dependencies.keys())
            .field("output", &self.output.hash())
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        // Tasks are equal when they produce the same dataset.
        self.output == other.output
    }
}

impl Eq for Task {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::DailyCalendar;
    use crate::check::CalendarChecker;
    use crate::context::Context;
    use crate::engine::MemoryEngine;
    use crate::time::{TimeOfDay, Timestamp};

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(ts(start), ts(end)).unwrap()
    }

    fn day(d: u32) -> Timestamp {
        ts(&format!("2020-02-{d:02}T00:00:00Z"))
    }

    fn echo_window() -> TaskFn {
        // Emits a midnight row for each February day in the fetch window.
        Arc::new(|args: &TaskArgs| {
            let window = args.time_range().expect("time-series window");
            let points: Vec<_> = (1..=28u32)
                .map(day)
                .filter(|t| window.contains_point(*t))
                .map(|t| (t, 1.0))
                .collect();
            Ok(Frame::single("value", points)?.into())
        })
    }

    fn midnight_checker() -> CalendarChecker {
        CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("00:00").unwrap()))
    }

    fn context(engine: &Arc<MemoryEngine>) -> Context {
        Context::new()
            .with_version("1")
            .with_engine(engine.clone() as Arc<dyn PersistenceEngine>)
            .with_target_range(range("2020-02-01T00:00:00Z", "2020-02-05T00:00:00Z"))
    }

    #[test]
    fn lookback_extends_the_fetch_window_backwards() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);
        let parent = ctx.time_series_task("bars", {
            let f = echo_window();
            move |args| f(args)
        });
        let parent = parent.build().unwrap();

        let dep = Dependency::new(&parent).lookback(Duration::days(30));
        let target = range("2020-02-01T00:00:00Z", "2020-02-05T00:00:00Z");
        let window = dep.fetch_range(&target);

        assert_eq!(window.start(), ts("2020-01-02T00:00:00Z"));
        assert_eq!(window.end(), target.end());
    }

    #[test]
    fn run_is_idempotent_and_incremental() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let task = ctx
            .time_series_task("bars", {
                let f = echo_window();
                move |args| f(args)
            })
            .build()
            .unwrap();

        assert!(matches!(task.run(), RunOutcome::Success));
        let written = engine.range(task.output()).unwrap().unwrap();
        assert_eq!(written.start(), day(1));

        // Second run performs no work.
        assert!(matches!(task.run(), RunOutcome::AlreadyComplete));
    }

    #[test]
    fn incremental_run_appends_only_the_missing_suffix() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let narrow = ctx
            .time_series_task("bars", {
                let f = echo_window();
                move |args| f(args)
            })
            .checker(midnight_checker())
            .target_range(range("2020-02-01T00:00:00Z", "2020-02-03T00:00:00Z"))
            .build()
            .unwrap();
        assert!(matches!(narrow.run(), RunOutcome::Success));

        // Same identity, wider target: only the suffix is recomputed.
        let wide = ctx
            .time_series_task("bars", {
                let f = echo_window();
                move |args| f(args)
            })
            .checker(midnight_checker())
            .target_range(range("2020-02-01T00:00:00Z", "2020-02-05T00:00:00Z"))
            .build()
            .unwrap();
        assert_eq!(wide.output().hash(), narrow.output().hash());
        assert!(matches!(wide.run(), RunOutcome::Success));

        let frame = wide.read().unwrap();
        let index = frame.as_series().unwrap().index().to_vec();
        assert_eq!(index, vec![day(1), day(2), day(3), day(4)]);
    }

    #[test]
    fn engine_follows_the_metadata_not_the_consumer() {
        let parent_engine = Arc::new(MemoryEngine::new());
        let child_engine = Arc::new(MemoryEngine::new());

        let parent = context(&parent_engine)
            .time_series_task("bars", {
                let f = echo_window();
                move |args| f(args)
            })
            .build()
            .unwrap();
        assert!(matches!(parent.run(), RunOutcome::Success));

        let child = context(&child_engine)
            .time_series_task("signal", |args: &TaskArgs| {
                let bars = args.series("bars")?;
                Ok(bars.clone().into())
            })
            .input("bars", &parent)
            .build()
            .unwrap();

        assert_eq!(child.output().engine_id(), child_engine.engine_id());
        assert!(matches!(child.run(), RunOutcome::Success));

        // The child's output landed in its own engine only; the parent's
        // data was read from the parent's engine.
        assert!(child_engine.exists(child.output()).unwrap());
        assert!(!parent_engine.exists(child.output()).unwrap());
        assert!(parent_engine.exists(parent.output()).unwrap());
        assert!(!child_engine.exists(parent.output()).unwrap());
    }

    #[test]
    fn static_tasks_replace_their_output() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let universe = ctx
            .static_task("universe", |_args: &TaskArgs| {
                Ok(serde_json::json!(["ES", "NQ"]).into())
            })
            .build()
            .unwrap();

        assert!(matches!(universe.run(), RunOutcome::Success));
        assert!(universe.complete().unwrap());
        assert!(matches!(universe.run(), RunOutcome::AlreadyComplete));

        let value = universe.read().unwrap();
        assert_eq!(value.as_scalar().unwrap(), &serde_json::json!(["ES", "NQ"]));
    }

    #[test]
    fn user_function_errors_are_captured() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = context(&engine);

        let failing = ctx
            .time_series_task("broken", |_args: &TaskArgs| Err(anyhow!("no data source")))
            .build()
            .unwrap();

        match failing.run() {
            RunOutcome::Failed(TaskError::UserFunction(error)) => {
                assert!(error.to_string().contains("no data source"));
            }
            other => panic!("expected a user-function failure, got {other:?}"),
        }
        assert!(!engine.exists(failing.output()).unwrap());
    }
}
