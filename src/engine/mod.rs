//! Pluggable persistence engines.
//!
//! The model here is that the data is the state: any number of engine
//! values pointing at the same backing store are functionally identical,
//! and a dataset lives wherever its metadata's `engine_id` says it does.
//! Engines are compared by id, never by content: the same dataset written
//! to two engines is two datasets.
//!
//! Implementations must make every operation on a single metadata
//! linearisable against other writes to the same metadata, and readers must
//! never observe a torn payload. Writes to different metadata are
//! independent; the graph runner guarantees that no dataset is ever written
//! by two tasks at once.

mod docstore;
mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::error::EngineError;
use crate::hash::Hash32;
use crate::metadata::{DatasetMetadata, DatasetMetadataStub, EngineId};
use crate::params::Params;
use crate::series::{Frame, Payload};
use crate::time::TimeRange;

pub use docstore::DocumentStore;
pub use memory::MemoryEngine;

pub trait PersistenceEngine: Debug + Send + Sync {
    /// The identity this engine stamps into the metadata it owns.
    fn engine_id(&self) -> &EngineId;

    /// Pure observation: is there stored data for this metadata?
    fn exists(&self, metadata: &DatasetMetadata) -> Result<bool, EngineError>;

    /// The stub form of `metadata`; hashes identically to the full form.
    fn get_stub(&self, metadata: &DatasetMetadata) -> Result<DatasetMetadataStub, EngineError> {
        Ok(metadata.stub())
    }

    /// The immediate predecessors of a stored dataset, as stubs. This is
    /// what lets a stub's ancestors be walked without materialising the
    /// whole graph up front.
    fn predecessors_of(
        &self,
        hash: Hash32,
    ) -> Result<BTreeMap<String, DatasetMetadataStub>, EngineError>;

    /// Stored payload, optionally restricted to `range`. `NotFound` when
    /// absent; restricting a static dataset is an error.
    fn read(
        &self,
        metadata: &DatasetMetadata,
        range: Option<&TimeRange>,
    ) -> Result<Payload, EngineError>;

    /// Extent of the stored index; `None` when nothing is stored. An error
    /// for static datasets, which have no index.
    fn range(&self, metadata: &DatasetMetadata) -> Result<Option<TimeRange>, EngineError>;

    /// Append rows strictly after the stored data. The smallest new index
    /// must be strictly greater than the largest existing one; anything
    /// else is `AppendOverlap`, never silently merged. Inserts when
    /// nothing is stored yet.
    fn append(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError>;

    /// Merge with existing-wins semantics on overlapping cells
    /// (combine-first). Inserts when nothing is stored yet.
    fn merge(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError>;

    /// Replace the stored payload atomically: a concurrent reader sees the
    /// old payload or the new one, never a splice.
    fn replace(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError>;

    /// Write only when nothing is stored; returns whether a dataset
    /// already existed.
    fn idempotent_insert(
        &self,
        metadata: &DatasetMetadata,
        payload: Payload,
    ) -> Result<bool, EngineError> {
        if self.exists(metadata)? {
            return Ok(true);
        }
        self.replace(metadata, payload)?;
        Ok(false)
    }

    /// Drop the rows within `range`, or the whole dataset when `range` is
    /// `None`.
    fn delete(
        &self,
        metadata: &DatasetMetadata,
        range: Option<&TimeRange>,
    ) -> Result<(), EngineError>;

    /// Stubs of stored datasets matching the filters. `params` keys may be
    /// dotted (`"bars.source"`) to match on an upstream's parameter, and
    /// the identity fields `name`, `version`, `static` and `time_level`
    /// are addressable like parameters.
    fn query(
        &self,
        name: Option<&str>,
        params: Option<&Params>,
    ) -> Result<Vec<DatasetMetadataStub>, EngineError>;
}

/// Definitionally correct append: every engine must replicate this
/// behaviour, whether or not it goes through this helper.
pub(crate) fn append_frames(existing: &Frame, new: &Frame) -> Result<Frame, EngineError> {
    let (Some(existing_range), Some(new_first)) = (existing.time_range(), new.first()) else {
        // One side is empty; nothing can overlap.
        return Ok(existing.concat(new)?);
    };

    if new_first < existing_range.end() {
        return Err(EngineError::AppendOverlap {
            new_start: new_first,
            existing_end: existing_range.end(),
        });
    }

    Ok(existing.concat(new)?)
}

/// Definitionally correct merge: existing cells win, everything else is
/// filled from the new payload.
pub(crate) fn merge_frames(existing: &Frame, new: &Frame) -> Frame {
    existing.combine_first(new)
}

/// Write-side guard shared by engines: a dataset may only be written to
/// the engine its metadata names.
pub(crate) fn check_ownership(
    engine_id: &EngineId,
    metadata: &DatasetMetadata,
) -> Result<(), EngineError> {
    if metadata.engine_id() != engine_id {
        return Err(EngineError::Conflict(format!(
            "dataset '{}' belongs to engine '{}', not '{}'",
            metadata.name(),
            metadata.engine_id(),
            engine_id,
        )));
    }
    Ok(())
}

/// Does a stored metadata match a query filter, resolving dotted keys
/// through `lookup`?
pub(crate) fn matches_query(
    metadata: &DatasetMetadata,
    name: Option<&str>,
    params: Option<&Params>,
) -> bool {
    if let Some(name) = name {
        if metadata.name() != name {
            return false;
        }
    }
    match params {
        None => true,
        Some(params) => params
            .iter()
            .all(|(path, expected)| metadata.parameter(path).as_ref() == Some(expected)),
    }
}
