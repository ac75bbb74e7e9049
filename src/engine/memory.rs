//! Hash-backed in-memory engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::{append_frames, check_ownership, matches_query, merge_frames, PersistenceEngine};
use crate::error::EngineError;
use crate::hash::Hash32;
use crate::metadata::{DatasetMetadata, DatasetMetadataStub, EngineId};
use crate::params::Params;
use crate::series::{Frame, Payload};
use crate::time::TimeRange;

static NEXT_ENGINE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct Stored {
    metadata: DatasetMetadata,
    payload: Payload,
}

/// In-memory engine backed by a map from metadata hash to dataset. The
/// outer map lock only guards key lookup and insertion; each dataset sits
/// behind its own reader-writer lock, so writes to different datasets never
/// contend.
#[derive(Debug)]
pub struct MemoryEngine {
    id: EngineId,
    cache: RwLock<HashMap<Hash32, Arc<RwLock<Stored>>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
        MemoryEngine {
            id: EngineId::new(format!("memory:{n}")),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, hash: Hash32) -> Option<Arc<RwLock<Stored>>> {
        self.cache.read().get(&hash).cloned()
    }

    fn entry_or_insert(
        &self,
        metadata: &DatasetMetadata,
        empty: impl FnOnce() -> Payload,
    ) -> Arc<RwLock<Stored>> {
        let mut cache = self.cache.write();
        cache
            .entry(metadata.hash())
            .or_insert_with(|| {
                Arc::new(RwLock::new(Stored {
                    metadata: metadata.clone(),
                    payload: empty(),
                }))
            })
            .clone()
    }

    fn existing_series<'a>(
        stored: &'a Stored,
        op: &'static str,
    ) -> Result<&'a Frame, EngineError> {
        stored
            .payload
            .as_series()
            .ok_or(EngineError::StaticDataset(op))
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        MemoryEngine::new()
    }
}

impl PersistenceEngine for MemoryEngine {
    fn engine_id(&self) -> &EngineId {
        &self.id
    }

    fn exists(&self, metadata: &DatasetMetadata) -> Result<bool, EngineError> {
        Ok(self.cache.read().contains_key(&metadata.hash()))
    }

    fn predecessors_of(
        &self,
        hash: Hash32,
    ) -> Result<BTreeMap<String, DatasetMetadataStub>, EngineError> {
        let entry = self.entry(hash).ok_or(EngineError::NotFound(hash))?;
        let stored = entry.read();
        Ok(stored
            .metadata
            .predecessors()
            .iter()
            .map(|(key, predecessor)| (key.clone(), predecessor.stub()))
            .collect())
    }

    fn read(
        &self,
        metadata: &DatasetMetadata,
        range: Option<&TimeRange>,
    ) -> Result<Payload, EngineError> {
        let entry = self
            .entry(metadata.hash())
            .ok_or(EngineError::NotFound(metadata.hash()))?;
        let stored = entry.read();

        match (&stored.payload, range) {
            (payload, None) => Ok(payload.clone()),
            (Payload::Series(frame), Some(range)) => Ok(frame.view(range).into()),
            (Payload::Scalar(_), Some(_)) => Err(EngineError::StaticDataset("read with range")),
        }
    }

    fn range(&self, metadata: &DatasetMetadata) -> Result<Option<TimeRange>, EngineError> {
        let Some(entry) = self.entry(metadata.hash()) else {
            return Ok(None);
        };
        let stored = entry.read();
        match &stored.payload {
            Payload::Series(frame) => Ok(frame.time_range()),
            Payload::Scalar(_) => Err(EngineError::StaticDataset("range")),
        }
    }

    fn append(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;
        let Payload::Series(new) = payload else {
            return Err(EngineError::StaticDataset("append"));
        };

        let entry = self.entry_or_insert(metadata, || Frame::default().into());
        let mut stored = entry.write();
        let combined = append_frames(Self::existing_series(&stored, "append")?, &new)?;
        stored.payload = combined.into();
        Ok(())
    }

    fn merge(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;
        let Payload::Series(new) = payload else {
            return Err(EngineError::StaticDataset("merge"));
        };

        let entry = self.entry_or_insert(metadata, || Frame::default().into());
        let mut stored = entry.write();
        let combined = merge_frames(Self::existing_series(&stored, "merge")?, &new);
        stored.payload = combined.into();
        Ok(())
    }

    fn replace(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;
        let entry = self.entry_or_insert(metadata, || payload.clone());
        let mut stored = entry.write();
        stored.payload = payload;
        Ok(())
    }

    fn delete(
        &self,
        metadata: &DatasetMetadata,
        range: Option<&TimeRange>,
    ) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;
        match range {
            None => {
                self.cache.write().remove(&metadata.hash());
                Ok(())
            }
            Some(range) => {
                let entry = self
                    .entry(metadata.hash())
                    .ok_or(EngineError::NotFound(metadata.hash()))?;
                let mut stored = entry.write();
                let remaining = match &stored.payload {
                    Payload::Series(frame) => frame.without(range),
                    Payload::Scalar(_) => {
                        return Err(EngineError::StaticDataset("delete with range"))
                    }
                };
                stored.payload = remaining.into();
                Ok(())
            }
        }
    }

    fn query(
        &self,
        name: Option<&str>,
        params: Option<&Params>,
    ) -> Result<Vec<DatasetMetadataStub>, EngineError> {
        let cache = self.cache.read();
        let mut stubs: Vec<DatasetMetadataStub> = cache
            .values()
            .filter_map(|entry| {
                let stored = entry.read();
                matches_query(&stored.metadata, name, params).then(|| stored.metadata.stub())
            })
            .collect();
        stubs.sort_by_key(DatasetMetadataStub::hash);
        Ok(stubs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_engine_gets_a_distinct_identity() {
        let a = MemoryEngine::new();
        let b = MemoryEngine::new();

        assert_ne!(a.engine_id(), b.engine_id());
    }

    #[test]
    fn same_content_in_two_engines_is_two_datasets() {
        let a = MemoryEngine::new();
        let b = MemoryEngine::new();

        let build = |engine: &MemoryEngine| {
            DatasetMetadata::builder("bars")
                .version("1")
                .engine(engine.engine_id().clone())
                .build()
                .unwrap()
        };

        assert_ne!(build(&a).hash(), build(&b).hash());
    }
}
