#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod calendar;
mod check;
mod context;
mod engine;
mod error;
mod hash;
mod metadata;
mod params;
mod runner;
mod series;
mod task;
mod time;

pub use crate::calendar::{
    Calendar, DailyCalendar, ExplicitCalendar, IntervalCalendar, UnionCalendar, UnionOrLeaf,
    BUSINESS_DAYS,
};
pub use crate::check::{
    CalendarChecker, CompletionChecker, CompositeChecker, IrregularChecker, Strategy,
};
pub use crate::context::{Context, TaskBuilder};
pub use crate::engine::{DocumentStore, MemoryEngine, PersistenceEngine};
pub use crate::error::{
    CompletionError, EngineError, FrameError, MetadataError, TaskError, TimeError,
};
pub use crate::hash::Hash32;
pub use crate::metadata::{DatasetMetadata, DatasetMetadataStub, EngineId, MetadataBuilder};
pub use crate::params::{Parameter, Params};
pub use crate::runner::{
    CancelToken, NodeReport, Outcome, RunReport, Runner, RunnerConfig,
};
pub use crate::series::{Column, Frame, Payload};
pub use crate::task::{Dependency, RunOutcome, Task, TaskArgs, TaskFn, Upstream};
pub use crate::time::{resolution, TimeOfDay, TimeRange, Timestamp};
