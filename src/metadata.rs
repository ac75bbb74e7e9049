//! Content-addressed dataset identity.
//!
//! A [`DatasetMetadata`] is the complete description of a dataset node: its
//! name, code version, parameters, the metadata of every predecessor, and
//! the id of the engine that owns the stored output. Predecessors are
//! embedded by value, so the whole ancestor graph is part of the identity
//! and two nodes are equal exactly when their entire histories are. Shared
//! subtrees are deduplicated behind [`Arc`], which keeps diamond-shaped
//! graphs cheap to clone.
//!
//! The content hash is a SHA-256 digest over a canonical serialisation. It
//! only ever consumes predecessor *hashes*, never their bodies, which is
//! what makes [`DatasetMetadataStub`] (the identity fields plus a
//! precomputed hash, without materialised ancestors) hash identically to
//! the full form.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MetadataError;
use crate::hash::Hash32;
use crate::params::{digest_str, Parameter, Params};

/// Opaque identifier of a persistence engine. Engines are compared by id,
/// never by content: two engines holding identical data are still two
/// different places, and the same dataset stored in both is two datasets.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        EngineId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineId({})", self.0)
    }
}

struct Inner {
    name: String,
    version: String,
    is_static: bool,
    time_level: Option<String>,
    params: Params,
    predecessors: BTreeMap<String, DatasetMetadata>,
    engine_id: EngineId,
    hash: Hash32,
}

/// Immutable, hashable identity of a dataset node.
#[derive(Clone)]
pub struct DatasetMetadata {
    inner: Arc<Inner>,
}

impl DatasetMetadata {
    pub fn builder(name: impl Into<String>) -> MetadataBuilder {
        MetadataBuilder {
            name: name.into(),
            version: None,
            is_static: false,
            time_level: None,
            params: Params::new(),
            predecessors: BTreeMap::new(),
            engine_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn is_static(&self) -> bool {
        self.inner.is_static
    }

    pub fn time_level(&self) -> Option<&str> {
        self.inner.time_level.as_deref()
    }

    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    pub fn predecessors(&self) -> &BTreeMap<String, DatasetMetadata> {
        &self.inner.predecessors
    }

    pub fn engine_id(&self) -> &EngineId {
        &self.inner.engine_id
    }

    /// Stable content hash, computed once at construction.
    pub fn hash(&self) -> Hash32 {
        self.inner.hash
    }

    /// The stub form: identity fields plus the hash, no ancestors.
    pub fn stub(&self) -> DatasetMetadataStub {
        DatasetMetadataStub {
            name: self.inner.name.clone(),
            version: self.inner.version.clone(),
            is_static: self.inner.is_static,
            time_level: self.inner.time_level.clone(),
            params: self.inner.params.clone(),
            engine_id: self.inner.engine_id.clone(),
            hash: self.inner.hash,
        }
    }

    /// Depth-first post-order traversal of the predecessor graph, visiting
    /// each distinct node (by hash) once. `self` is the final element.
    pub fn walk(&self) -> Vec<DatasetMetadata> {
        let mut seen = std::collections::HashSet::new();
        let mut order = Vec::new();
        self.walk_into(&mut seen, &mut order);
        order
    }

    fn walk_into(&self, seen: &mut std::collections::HashSet<Hash32>, order: &mut Vec<Self>) {
        if !seen.insert(self.hash()) {
            return;
        }
        for predecessor in self.inner.predecessors.values() {
            predecessor.walk_into(seen, order);
        }
        order.push(self.clone());
    }

    /// Functional update of one predecessor; `self` is unchanged.
    pub fn replace_predecessor(
        &self,
        key: &str,
        replacement: DatasetMetadata,
    ) -> Result<DatasetMetadata, MetadataError> {
        if !self.inner.predecessors.contains_key(key) {
            return Err(MetadataError::NoSuchPredecessor(key.to_string()));
        }

        let mut predecessors = self.inner.predecessors.clone();
        predecessors.insert(key.to_string(), replacement);

        DatasetMetadata::build(
            self.inner.name.clone(),
            self.inner.version.clone(),
            self.inner.is_static,
            self.inner.time_level.clone(),
            self.inner.params.clone(),
            predecessors,
            self.inner.engine_id.clone(),
        )
    }

    /// Look up a parameter, walking predecessors on dots: `"bars.source"`
    /// reads parameter `source` of the predecessor registered as `bars`.
    /// The identity fields `name`, `version`, `static` and `time_level` are
    /// addressable like parameters, mirroring how queries match them.
    pub fn parameter(&self, path: &str) -> Option<Parameter> {
        let mut node = self;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                return node.own_parameter(segment);
            }
            node = node.inner.predecessors.get(segment)?;
        }
        None
    }

    fn own_parameter(&self, name: &str) -> Option<Parameter> {
        match name {
            "name" => Some(Parameter::Str(self.inner.name.clone())),
            "version" => Some(Parameter::Str(self.inner.version.clone())),
            "static" => Some(Parameter::Bool(self.inner.is_static)),
            "time_level" => Some(match &self.inner.time_level {
                Some(level) => Parameter::Str(level.clone()),
                None => Parameter::Null,
            }),
            _ => self.inner.params.get(name).cloned(),
        }
    }

    fn build(
        name: String,
        version: String,
        is_static: bool,
        time_level: Option<String>,
        params: Params,
        predecessors: BTreeMap<String, DatasetMetadata>,
        engine_id: EngineId,
    ) -> Result<DatasetMetadata, MetadataError> {
        if is_static && time_level.is_some() {
            return Err(MetadataError::TimeLevelOnStatic);
        }
        for (key, value) in &params {
            value.validate(key)?;
        }

        let hash = identity_hash(
            &name,
            &version,
            is_static,
            time_level.as_deref(),
            &params,
            predecessors
                .iter()
                .map(|(key, predecessor)| (key.as_str(), predecessor.hash())),
            &engine_id,
        );

        Ok(DatasetMetadata {
            inner: Arc::new(Inner {
                name,
                version,
                is_static,
                time_level,
                params,
                predecessors,
                engine_id,
                hash,
            }),
        })
    }
}

impl PartialEq for DatasetMetadata {
    fn eq(&self, other: &Self) -> bool {
        // The hash covers every identity field including the full
        // predecessor subgraph.
        self.inner.hash == other.inner.hash
    }
}

impl Eq for DatasetMetadata {}

impl Hash for DatasetMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash.hash(state);
    }
}

impl Debug for DatasetMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetMetadata")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("static", &self.inner.is_static)
            .field("predecessors", &self.inner.predecessors.keys())
            .field("engine", &self.inner.engine_id)
            .field("hash", &self.inner.hash)
            .finish()
    }
}

/// Builder for [`DatasetMetadata`].
pub struct MetadataBuilder {
    name: String,
    version: Option<String>,
    is_static: bool,
    time_level: Option<String>,
    params: Params,
    predecessors: BTreeMap<String, DatasetMetadata>,
    engine_id: Option<EngineId>,
}

impl MetadataBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Mark this node as static: a single opaque value rather than a
    /// time-indexed series.
    pub fn static_data(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn time_level(mut self, level: impl Into<String>) -> Self {
        self.time_level = Some(level.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Parameter>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn predecessor(mut self, key: impl Into<String>, metadata: DatasetMetadata) -> Self {
        self.predecessors.insert(key.into(), metadata);
        self
    }

    pub fn engine(mut self, engine_id: EngineId) -> Self {
        self.engine_id = Some(engine_id);
        self
    }

    pub fn build(self) -> Result<DatasetMetadata, MetadataError> {
        let engine_id = self.engine_id.ok_or_else(|| MetadataError::InvalidParameter {
            name: "engine".to_string(),
            reason: "metadata requires an owning engine id".to_string(),
        })?;

        DatasetMetadata::build(
            self.name,
            self.version.unwrap_or_else(|| "0".to_string()),
            self.is_static,
            self.time_level,
            self.params,
            self.predecessors,
            engine_id,
        )
    }
}

/// Same identity fields as [`DatasetMetadata`] with the hash precomputed.
/// Pulling a stub out of an engine does not materialise the ancestor graph;
/// predecessors are fetched lazily through the engine when needed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadataStub {
    name: String,
    version: String,
    #[serde(rename = "static")]
    is_static: bool,
    time_level: Option<String>,
    params: Params,
    engine_id: EngineId,
    hash: Hash32,
}

impl DatasetMetadataStub {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        is_static: bool,
        time_level: Option<String>,
        params: Params,
        engine_id: EngineId,
        hash: Hash32,
    ) -> Self {
        DatasetMetadataStub {
            name: name.into(),
            version: version.into(),
            is_static,
            time_level,
            params,
            engine_id,
            hash,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn time_level(&self) -> Option<&str> {
        self.time_level.as_deref()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn engine_id(&self) -> &EngineId {
        &self.engine_id
    }

    /// Equals the hash of the full metadata this stub refers to.
    pub fn hash(&self) -> Hash32 {
        self.hash
    }
}

impl Hash for DatasetMetadataStub {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Eq for DatasetMetadataStub {}

impl Debug for DatasetMetadataStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetMetadataStub")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("hash", &self.hash)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
fn identity_hash<'a>(
    name: &str,
    version: &str,
    is_static: bool,
    time_level: Option<&str>,
    params: &Params,
    predecessors: impl Iterator<Item = (&'a str, Hash32)>,
    engine_id: &EngineId,
) -> Hash32 {
    let mut hasher = Sha256::new();

    digest_str(&mut hasher, name);
    digest_str(&mut hasher, version);
    hasher.update([is_static as u8]);
    match time_level {
        Some(level) => {
            hasher.update([1u8]);
            digest_str(&mut hasher, level);
        }
        None => hasher.update([0u8]),
    }

    hasher.update((params.len() as u64).to_be_bytes());
    for (key, value) in params {
        digest_str(&mut hasher, key);
        value.digest_into(&mut hasher);
    }

    let entries: Vec<(&str, Hash32)> = predecessors.collect();
    hasher.update((entries.len() as u64).to_be_bytes());
    for (key, hash) in entries {
        digest_str(&mut hasher, key);
        hasher.update(hash.as_bytes());
    }

    digest_str(&mut hasher, engine_id.as_str());

    Hash32::from_hasher(hasher)
}

/// Recompute the hash a stub record claims, given its predecessor hashes.
/// Used by engines to verify integrity when deserialising.
pub(crate) fn stub_identity_hash(
    stub: &DatasetMetadataStub,
    predecessors: &BTreeMap<String, Hash32>,
) -> Hash32 {
    identity_hash(
        &stub.name,
        &stub.version,
        stub.is_static,
        stub.time_level.as_deref(),
        &stub.params,
        predecessors
            .iter()
            .map(|(key, hash)| (key.as_str(), *hash)),
        &stub.engine_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EngineId {
        EngineId::new("memory:test")
    }

    fn leaf(name: &str) -> DatasetMetadata {
        DatasetMetadata::builder(name)
            .version("1")
            .param("source", "exchange")
            .engine(engine())
            .build()
            .unwrap()
    }

    #[test]
    fn hash_ignores_param_insertion_order() {
        let forward = DatasetMetadata::builder("bars")
            .version("1")
            .param("a", 1i64)
            .param("b", 2i64)
            .engine(engine())
            .build()
            .unwrap();

        let backward = DatasetMetadata::builder("bars")
            .version("1")
            .param("b", 2i64)
            .param("a", 1i64)
            .engine(engine())
            .build()
            .unwrap();

        assert_eq!(forward, backward);
        assert_eq!(forward.hash(), backward.hash());
    }

    #[test]
    fn every_identity_field_matters() {
        let base = leaf("bars");

        let renamed = DatasetMetadata::builder("ticks")
            .version("1")
            .param("source", "exchange")
            .engine(engine())
            .build()
            .unwrap();
        assert_ne!(base.hash(), renamed.hash());

        let reversioned = DatasetMetadata::builder("bars")
            .version("2")
            .param("source", "exchange")
            .engine(engine())
            .build()
            .unwrap();
        assert_ne!(base.hash(), reversioned.hash());

        let moved = DatasetMetadata::builder("bars")
            .version("1")
            .param("source", "exchange")
            .engine(EngineId::new("memory:other"))
            .build()
            .unwrap();
        assert_ne!(base.hash(), moved.hash());
    }

    #[test]
    fn predecessor_identity_is_recursive() {
        let parent_a = leaf("bars");
        let parent_b = DatasetMetadata::builder("bars")
            .version("1")
            .param("source", "vendor")
            .engine(engine())
            .build()
            .unwrap();

        let child = |parent: DatasetMetadata| {
            DatasetMetadata::builder("returns")
                .version("1")
                .predecessor("bars", parent)
                .engine(engine())
                .build()
                .unwrap()
        };

        assert_ne!(child(parent_a).hash(), child(parent_b).hash());
    }

    #[test]
    fn stub_hash_equals_full_hash() {
        let parent = leaf("bars");
        let child = DatasetMetadata::builder("returns")
            .version("1")
            .predecessor("bars", parent)
            .engine(engine())
            .build()
            .unwrap();

        assert_eq!(child.stub().hash(), child.hash());
        assert_eq!(child.predecessors()["bars"].stub().hash(), child.predecessors()["bars"].hash());
    }

    #[test]
    fn static_with_time_level_is_rejected() {
        let err = DatasetMetadata::builder("universe")
            .static_data()
            .time_level("ts")
            .engine(engine())
            .build();

        assert!(matches!(err, Err(MetadataError::TimeLevelOnStatic)));
    }

    #[test]
    fn nan_parameter_is_rejected() {
        let err = DatasetMetadata::builder("bars")
            .param("alpha", f64::NAN)
            .engine(engine())
            .build();

        assert!(matches!(
            err,
            Err(MetadataError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn walk_is_post_order_and_deduplicated() {
        let source = leaf("bars");
        let left = DatasetMetadata::builder("fast")
            .version("1")
            .predecessor("bars", source.clone())
            .engine(engine())
            .build()
            .unwrap();
        let right = DatasetMetadata::builder("slow")
            .version("1")
            .predecessor("bars", source.clone())
            .engine(engine())
            .build()
            .unwrap();
        let diamond = DatasetMetadata::builder("signal")
            .version("1")
            .predecessor("fast", left)
            .predecessor("slow", right)
            .engine(engine())
            .build()
            .unwrap();

        let order = diamond.walk();
        let names: Vec<&str> = order.iter().map(|m| m.name()).collect();

        // The shared source appears exactly once, ahead of both consumers.
        assert_eq!(names, vec!["bars", "fast", "slow", "signal"]);
        assert_eq!(order.last().unwrap().hash(), diamond.hash());
    }

    #[test]
    fn replace_predecessor_is_functional() {
        let original_parent = leaf("bars");
        let new_parent = DatasetMetadata::builder("bars")
            .version("2")
            .param("source", "exchange")
            .engine(engine())
            .build()
            .unwrap();

        let child = DatasetMetadata::builder("returns")
            .version("1")
            .predecessor("bars", original_parent.clone())
            .engine(engine())
            .build()
            .unwrap();

        let updated = child.replace_predecessor("bars", new_parent.clone()).unwrap();

        assert_eq!(child.predecessors()["bars"], original_parent);
        assert_eq!(updated.predecessors()["bars"], new_parent);
        assert_ne!(child.hash(), updated.hash());

        assert!(matches!(
            child.replace_predecessor("missing", new_parent),
            Err(MetadataError::NoSuchPredecessor(_))
        ));
    }

    #[test]
    fn dotted_parameter_lookup() {
        let parent = leaf("bars");
        let child = DatasetMetadata::builder("returns")
            .version("3")
            .param("window", 20i64)
            .predecessor("bars", parent)
            .engine(engine())
            .build()
            .unwrap();

        assert_eq!(child.parameter("window"), Some(Parameter::Int(20)));
        assert_eq!(child.parameter("version"), Some(Parameter::Str("3".into())));
        assert_eq!(
            child.parameter("bars.source"),
            Some(Parameter::Str("exchange".into()))
        );
        assert_eq!(child.parameter("bars.missing"), None);
        assert_eq!(child.parameter("nope.source"), None);
    }
}
