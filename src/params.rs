//! Dataset parameter values.
//!
//! Parameters are part of a dataset's identity, so they have to hash the
//! same way in every process. The [`Parameter`] enum is the closed set of
//! value kinds we accept: primitives, tuples, string-keyed maps, and
//! references to other datasets. Maps are key-sorted by construction and
//! list-likes become tuples, so a value is always in canonical form by the
//! time it is stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MetadataError;
use crate::hash::Hash32;

/// Alias for a parameter map in canonical (key-sorted) form.
pub type Params = BTreeMap<String, Parameter>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Parameter>),
    Map(Params),
    /// Reference to another dataset by content hash.
    DatasetRef(Hash32),
}

impl Parameter {
    /// Reject values with no canonical form. `NaN` has no stable identity
    /// (it is not equal to itself), and non-finite floats do not survive
    /// the persisted record format.
    pub(crate) fn validate(&self, name: &str) -> Result<(), MetadataError> {
        match self {
            Parameter::Float(f) if !f.is_finite() => Err(MetadataError::InvalidParameter {
                name: name.to_string(),
                reason: format!("{f} has no canonical form"),
            }),
            Parameter::Tuple(items) => items.iter().try_for_each(|item| item.validate(name)),
            Parameter::Map(map) => map.values().try_for_each(|value| value.validate(name)),
            _ => Ok(()),
        }
    }

    /// Feed the canonical serialisation of this value into a digest. Each
    /// variant is framed with a tag byte and, where variable-length, a
    /// big-endian length prefix, so distinct structures never collide by
    /// concatenation.
    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        match self {
            Parameter::Null => hasher.update([0u8]),
            Parameter::Bool(b) => {
                hasher.update([1u8, *b as u8]);
            }
            Parameter::Int(i) => {
                hasher.update([2u8]);
                hasher.update(i.to_be_bytes());
            }
            Parameter::Float(f) => {
                hasher.update([3u8]);
                // -0.0 and 0.0 are equal, so they must hash identically.
                let canonical = if *f == 0.0 { 0.0f64 } else { *f };
                hasher.update(canonical.to_bits().to_be_bytes());
            }
            Parameter::Str(s) => {
                hasher.update([4u8]);
                digest_str(hasher, s);
            }
            Parameter::Tuple(items) => {
                hasher.update([5u8]);
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    item.digest_into(hasher);
                }
            }
            Parameter::Map(map) => {
                hasher.update([6u8]);
                hasher.update((map.len() as u64).to_be_bytes());
                for (key, value) in map {
                    digest_str(hasher, key);
                    value.digest_into(hasher);
                }
            }
            Parameter::DatasetRef(hash) => {
                hasher.update([7u8]);
                hasher.update(hash.as_bytes());
            }
        }
    }
}

pub(crate) fn digest_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Parameter::Bool(value)
    }
}

impl From<i64> for Parameter {
    fn from(value: i64) -> Self {
        Parameter::Int(value)
    }
}

impl From<i32> for Parameter {
    fn from(value: i32) -> Self {
        Parameter::Int(value.into())
    }
}

impl From<u32> for Parameter {
    fn from(value: u32) -> Self {
        Parameter::Int(value.into())
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::Float(value)
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Parameter::Str(value.to_string())
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Parameter::Str(value)
    }
}

impl<T: Into<Parameter>> From<Vec<T>> for Parameter {
    fn from(value: Vec<T>) -> Self {
        Parameter::Tuple(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Parameter>, const N: usize> From<[T; N]> for Parameter {
    fn from(value: [T; N]) -> Self {
        Parameter::Tuple(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Parameter>> From<BTreeMap<String, T>> for Parameter {
    fn from(value: BTreeMap<String, T>) -> Self {
        Parameter::Map(
            value
                .into_iter()
                .map(|(key, item)| (key, item.into()))
                .collect(),
        )
    }
}

impl<T: Into<Parameter>> From<Option<T>> for Parameter {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Parameter::Null,
        }
    }
}
