//! Task construction.
//!
//! A [`Context`] carries graph-wide defaults (code version, persistence
//! engine, target range) and a namespace, so individual tasks only state
//! what is specific to them. Its factories hand out [`TaskBuilder`]s that
//! lift bare tasks into dependencies, derive a completion checker from the
//! inheriting parents, and resolve the dataset identity once at build time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::check::{CompletionChecker, CompositeChecker, IrregularChecker, Strategy};
use crate::engine::PersistenceEngine;
use crate::error::MetadataError;
use crate::metadata::DatasetMetadata;
use crate::params::{Parameter, Params};
use crate::task::{Dependency, Shape, Task, TaskArgs, TaskFn};
use crate::series::Payload;
use crate::time::TimeRange;

/// Graph-wide defaults injected into tasks that do not override them.
#[derive(Clone, Default)]
struct Defaults {
    version: Option<String>,
    engine: Option<Arc<dyn PersistenceEngine>>,
    target_range: Option<TimeRange>,
}

/// Factory for tasks sharing a namespace and a set of defaults.
#[derive(Clone, Default)]
pub struct Context {
    defaults: Defaults,
    namespace: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.defaults.version = Some(version.into());
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn PersistenceEngine>) -> Self {
        self.defaults.engine = Some(engine);
        self
    }

    pub fn with_target_range(mut self, target_range: TimeRange) -> Self {
        self.defaults.target_range = Some(target_range);
        self
    }

    /// A copy of this context whose task names gain another namespace
    /// segment: `research` extended by `momentum` names tasks
    /// `research.momentum.<name>`.
    pub fn extend_namespace(&self, namespace: impl AsRef<str>) -> Self {
        let namespace = match &self.namespace {
            Some(current) => format!("{current}.{}", namespace.as_ref()),
            None => namespace.as_ref().to_string(),
        };
        Context {
            defaults: self.defaults.clone(),
            namespace: Some(namespace),
        }
    }

    /// Start building a time-series task.
    pub fn time_series_task<F>(&self, name: impl Into<String>, function: F) -> TaskBuilder
    where
        F: Fn(&TaskArgs) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        self.builder(name.into(), Arc::new(function), false)
    }

    /// Start building a static (scalar-output) task.
    pub fn static_task<F>(&self, name: impl Into<String>, function: F) -> TaskBuilder
    where
        F: Fn(&TaskArgs) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        self.builder(name.into(), Arc::new(function), true)
    }

    fn builder(&self, name: String, function: TaskFn, is_static: bool) -> TaskBuilder {
        let name = match &self.namespace {
            Some(namespace) => format!("{namespace}.{name}"),
            None => name,
        };
        TaskBuilder {
            defaults: self.defaults.clone(),
            name,
            function,
            is_static,
            version: None,
            time_level: None,
            params: Params::new(),
            dependencies: BTreeMap::new(),
            checker: None,
            engine: None,
            target_range: None,
            timeout: None,
        }
    }
}

/// Builder handed out by [`Context`] factories.
pub struct TaskBuilder {
    defaults: Defaults,
    name: String,
    function: TaskFn,
    is_static: bool,
    version: Option<String>,
    time_level: Option<String>,
    params: Params,
    dependencies: BTreeMap<String, Dependency>,
    checker: Option<Arc<dyn CompletionChecker>>,
    engine: Option<Arc<dyn PersistenceEngine>>,
    target_range: Option<TimeRange>,
    timeout: Option<StdDuration>,
}

impl TaskBuilder {
    /// A scalar parameter, passed to the function and mixed into the
    /// dataset identity.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Parameter>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// A bare task as input, lifted to a dependency with no lookback that
    /// inherits the parent's completion cadence.
    pub fn input(self, name: impl Into<String>, task: &Arc<Task>) -> Self {
        self.dependency(name, Dependency::new(task))
    }

    /// An explicit dependency edge.
    pub fn dependency(mut self, name: impl Into<String>, dependency: Dependency) -> Self {
        self.dependencies.insert(name.into(), dependency);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn time_level(mut self, level: impl Into<String>) -> Self {
        self.time_level = Some(level.into());
        self
    }

    pub fn checker(mut self, checker: impl CompletionChecker + 'static) -> Self {
        self.checker = Some(Arc::new(checker));
        self
    }

    pub fn engine(mut self, engine: Arc<dyn PersistenceEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn target_range(mut self, target_range: TimeRange) -> Self {
        self.target_range = Some(target_range);
        self
    }

    /// Wall-clock limit for one run of this task.
    pub fn timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Arc<Task>, MetadataError> {
        let engine = self
            .engine
            .or(self.defaults.engine)
            .ok_or_else(|| missing("persistence_engine"))?;
        let version = self
            .version
            .or(self.defaults.version)
            .ok_or_else(|| missing("version"))?;

        for (name, dependency) in &self.dependencies {
            if dependency.lookback_duration() < Duration::zero() {
                return Err(MetadataError::InvalidParameter {
                    name: name.clone(),
                    reason: "lookback must be non-negative".to_string(),
                });
            }
        }

        let shape = if self.is_static {
            Shape::Static
        } else {
            let target_range = self
                .target_range
                .or(self.defaults.target_range)
                .ok_or_else(|| missing("target_range"))?;
            let checker = match self.checker {
                Some(checker) => checker,
                None => derive_checker(&self.dependencies),
            };
            Shape::TimeSeries {
                target_range,
                checker,
            }
        };

        let mut metadata = DatasetMetadata::builder(self.name.clone())
            .version(version)
            .params(self.params.clone())
            .engine(engine.engine_id().clone());
        if self.is_static {
            metadata = metadata.static_data();
        }
        if let Some(level) = &self.time_level {
            metadata = metadata.time_level(level.clone());
        }
        for (name, dependency) in &self.dependencies {
            metadata =
                metadata.predecessor(name.clone(), dependency.upstream().metadata().clone());
        }
        let output = metadata.build()?;

        Ok(Arc::new(Task::assemble(
            self.name,
            self.params,
            self.dependencies,
            shape,
            engine,
            self.function,
            self.timeout,
            output,
        )))
    }
}

fn missing(name: &str) -> MetadataError {
    MetadataError::InvalidParameter {
        name: name.to_string(),
        reason: "not set on the task and no context default available".to_string(),
    }
}

/// The default completion checker of a task that does not declare one:
/// inherit from the parents flagged `inherit_frequency`. No inheriting
/// parent means no expectation (irregular); several mean all of them must
/// be satisfied.
fn derive_checker(dependencies: &BTreeMap<String, Dependency>) -> Arc<dyn CompletionChecker> {
    let mut inherited: Vec<Arc<dyn CompletionChecker>> = Vec::new();
    for dependency in dependencies.values() {
        if !dependency.inherits_frequency() {
            continue;
        }
        if let Some(checker) = dependency.upstream().checker() {
            inherited.push(checker.clone());
        }
    }

    match inherited.len() {
        0 => Arc::new(IrregularChecker),
        1 => inherited.remove(0),
        _ => Arc::new(CompositeChecker::new(Strategy::Strictest, inherited)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::DailyCalendar;
    use crate::check::CalendarChecker;
    use crate::engine::MemoryEngine;
    use crate::time::{TimeOfDay, Timestamp};

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(ts(start), ts(end)).unwrap()
    }

    fn noop() -> impl Fn(&TaskArgs) -> anyhow::Result<Payload> + Send + Sync + 'static {
        |_args: &TaskArgs| Ok(crate::series::Frame::default().into())
    }

    fn base_context(engine: &Arc<MemoryEngine>) -> Context {
        Context::new()
            .with_version("1")
            .with_engine(engine.clone() as Arc<dyn PersistenceEngine>)
            .with_target_range(range("2020-01-01T00:00:00Z", "2020-02-01T00:00:00Z"))
    }

    #[test]
    fn defaults_are_injected_and_overridable() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine);

        let task = ctx.time_series_task("bars", noop()).build().unwrap();
        assert_eq!(task.output().version(), "1");
        assert_eq!(task.output().engine_id(), engine.engine_id());
        assert_eq!(
            task.target_range().unwrap().start(),
            ts("2020-01-01T00:00:00Z")
        );

        let pinned = ctx
            .time_series_task("bars", noop())
            .version("2")
            .build()
            .unwrap();
        assert_eq!(pinned.output().version(), "2");
        assert_ne!(pinned.output().hash(), task.output().hash());
    }

    #[test]
    fn missing_defaults_are_construction_errors() {
        let err = Context::new().time_series_task("bars", noop()).build();
        assert!(matches!(err, Err(MetadataError::InvalidParameter { .. })));
    }

    #[test]
    fn namespaces_nest_with_dots() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine).extend_namespace("research");
        let momentum = ctx.extend_namespace("momentum");

        let task = momentum.time_series_task("signal", noop()).build().unwrap();
        assert_eq!(task.name(), "research.momentum.signal");
        assert_eq!(task.output().name(), "research.momentum.signal");
    }

    #[test]
    fn negative_lookback_is_rejected() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine);
        let parent = ctx.time_series_task("bars", noop()).build().unwrap();

        let err = ctx
            .time_series_task("signal", noop())
            .dependency(
                "bars",
                Dependency::new(&parent).lookback(Duration::days(-1)),
            )
            .build();
        assert!(matches!(err, Err(MetadataError::InvalidParameter { .. })));
    }

    #[test]
    fn checker_inheritance_is_transparent() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine);

        let close = CalendarChecker::new(DailyCalendar::business(
            TimeOfDay::parse("16:30 [-05:00]").unwrap(),
        ));
        let parent = ctx
            .time_series_task("bars", noop())
            .checker(close)
            .build()
            .unwrap();

        let child = ctx
            .time_series_task("signal", noop())
            .input("bars", &parent)
            .build()
            .unwrap();

        let target = range("2020-03-01T00:00:00Z", "2020-03-07T00:00:00Z");
        let parent_checker = parent.checker().unwrap();
        let child_checker = child.checker().unwrap();
        assert_eq!(
            child_checker.expected_last(&target).unwrap(),
            parent_checker.expected_last(&target).unwrap(),
        );
    }

    #[test]
    fn non_inheriting_parents_leave_the_child_irregular() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine);

        let close = CalendarChecker::new(DailyCalendar::business(
            TimeOfDay::parse("16:30").unwrap(),
        ));
        let parent = ctx
            .time_series_task("bars", noop())
            .checker(close)
            .build()
            .unwrap();

        let child = ctx
            .time_series_task("signal", noop())
            .dependency(
                "bars",
                Dependency::new(&parent).inherit_frequency(false),
            )
            .build()
            .unwrap();

        let target = range("2020-03-01T00:00:00Z", "2020-03-07T00:00:00Z");
        assert_eq!(
            child.checker().unwrap().expected_last(&target).unwrap(),
            None
        );
    }

    #[test]
    fn several_inherited_checkers_compose_strictest() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine);

        let at_15 = CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("15:00").unwrap()));
        let at_17 = CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("17:00").unwrap()));

        let fast = ctx
            .time_series_task("fast", noop())
            .checker(at_15)
            .build()
            .unwrap();
        let slow = ctx
            .time_series_task("slow", noop())
            .checker(at_17)
            .build()
            .unwrap();

        let child = ctx
            .time_series_task("spread", noop())
            .input("fast", &fast)
            .input("slow", &slow)
            .build()
            .unwrap();

        let target = range("2020-03-01T00:00:00Z", "2020-03-02T18:00:00Z");
        assert_eq!(
            child.checker().unwrap().expected_last(&target).unwrap(),
            Some(ts("2020-03-02T15:00:00Z"))
        );
    }

    #[test]
    fn identical_construction_yields_identical_identity() {
        let engine = Arc::new(MemoryEngine::new());
        let ctx = base_context(&engine);

        let build = || {
            ctx.time_series_task("bars", noop())
                .param("symbol", "ES")
                .param("window", 20i64)
                .build()
                .unwrap()
        };

        assert_eq!(build().output().hash(), build().output().hash());
    }
}
