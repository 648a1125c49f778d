//! Entity descriptors and the provided-by index.
//!
//! Queries declare which abstract entities their result depends on
//! (`provides`), mutations declare which entities they change
//! (`invalidates`). The [`ProvidedIndex`] links the two: it maps every
//! `type` / `id` pair to the cache keys whose latest result provided it.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::ser::{Serialize, Serializer};
use serde::{Deserialize, Serialize as SerializeDerive};
use serde_json::Value;

use crate::error::QueryError;
use crate::key::CacheKey;

/// Identifier of one entity within its type.
///
/// Ids compare by their rendered form, so `1` and `"1"` name the same entity.
#[derive(Debug, Clone, SerializeDerive, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// A numeric id, such as a database primary key.
    Int(i64),
    /// Any other id, such as a slug or a uuid.
    Str(String),
}

impl EntityId {
    /// The form ids are compared and hashed by.
    #[must_use]
    pub fn canonical(&self) -> Cow<'_, str> {
        match self {
            Self::Int(id) => Cow::Owned(id.to_string()),
            Self::Str(id) => Cow::Borrowed(id),
        }
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            _ => self.canonical() == other.canonical(),
        }
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => id.fmt(f),
            Self::Str(id) => f.write_str(id),
        }
    }
}

macro_rules! entity_id_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for EntityId {
            fn from(id: $t) -> Self {
                Self::Int(i64::from(id))
            }
        })*
    };
}

entity_id_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::Str(id)
    }
}

/// An abstract data dependency: an entity type, optionally narrowed to one id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDerive, Deserialize)]
pub struct EntityDescriptor {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
}

impl EntityDescriptor {
    /// Describes every entity of `entity_type`.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: None,
        }
    }

    /// Describes the single entity `entity_type` / `id`.
    pub fn with_id(entity_type: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: Some(id.into()),
        }
    }
}

impl From<&str> for EntityDescriptor {
    fn from(entity_type: &str) -> Self {
        Self::new(entity_type)
    }
}

impl fmt::Display for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.entity_type),
            None => f.write_str(&self.entity_type),
        }
    }
}

/// The allow-list of entity types declared at setup.
///
/// An empty list disables the check.
#[derive(Debug, Clone, Default)]
pub struct EntityTypes(HashSet<String>);

impl EntityTypes {
    /// Declares the entity types an API uses.
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str) -> bool {
        self.0.contains(entity_type)
    }

    /// Warns about descriptors whose type was never declared. Unknown types are
    /// still used.
    pub fn assert(&self, descriptor: &EntityDescriptor) {
        if !self.0.is_empty() && !self.0.contains(&descriptor.entity_type) {
            tracing::warn!(
                entity_type = %descriptor.entity_type,
                "Entity type was not declared in the API's entity types"
            );
        }
    }
}

pub(crate) type DescribeFn =
    Arc<dyn Fn(Option<&Value>, Option<&QueryError>, &Value) -> Vec<EntityDescriptor> + Send + Sync>;

/// A `provides` / `invalidates` declaration: a fixed list, or a function of
/// `(result, error, argument)`.
#[derive(Clone)]
pub(crate) enum ResultDescription {
    Static(Vec<EntityDescriptor>),
    Dynamic(DescribeFn),
}

impl fmt::Debug for ResultDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(list) => f.debug_tuple("Static").field(list).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Resolves a description into concrete descriptors, checking their types.
pub(crate) fn calculate_provided_by(
    description: Option<&ResultDescription>,
    result: Option<&Value>,
    error: Option<&QueryError>,
    arg: &Value,
    entity_types: &EntityTypes,
) -> Vec<EntityDescriptor> {
    let descriptors = match description {
        Some(ResultDescription::Static(list)) => list.clone(),
        Some(ResultDescription::Dynamic(describe)) => describe(result, error, arg),
        None => Vec::new(),
    };
    for descriptor in &descriptors {
        entity_types.assert(descriptor);
    }
    descriptors
}

/// Mapping from entity type, then id (or the type-wide slot), to the cache
/// keys that currently provide it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvidedIndex {
    by_type: HashMap<String, HashMap<Option<EntityId>, BTreeSet<CacheKey>>>,
    by_key: HashMap<CacheKey, Vec<EntityDescriptor>>,
}

impl ProvidedIndex {
    /// Replaces everything `key` provides with `descriptors`.
    pub(crate) fn replace(&mut self, key: &CacheKey, descriptors: &[EntityDescriptor]) {
        self.remove_key(key);
        if descriptors.is_empty() {
            return;
        }
        for descriptor in descriptors {
            self.by_type
                .entry(descriptor.entity_type.clone())
                .or_default()
                .entry(descriptor.id.clone())
                .or_default()
                .insert(key.clone());
        }
        self.by_key.insert(key.clone(), descriptors.to_vec());
    }

    /// Forgets every provision made by `key`.
    pub(crate) fn remove_key(&mut self, key: &CacheKey) {
        let Some(previous) = self.by_key.remove(key) else {
            return;
        };
        for descriptor in previous {
            let Some(ids) = self.by_type.get_mut(&descriptor.entity_type) else {
                continue;
            };
            if let Some(keys) = ids.get_mut(&descriptor.id) {
                keys.remove(key);
                if keys.is_empty() {
                    ids.remove(&descriptor.id);
                }
            }
            if ids.is_empty() {
                self.by_type.remove(&descriptor.entity_type);
            }
        }
    }

    /// Collects the keys affected by invalidating `descriptors`.
    ///
    /// A descriptor with an id matches that id exactly; a descriptor without
    /// one matches every key providing any entity of the type.
    #[must_use]
    pub fn keys_for(&self, descriptors: &[EntityDescriptor]) -> BTreeSet<CacheKey> {
        let mut keys = BTreeSet::new();
        for descriptor in descriptors {
            let Some(ids) = self.by_type.get(&descriptor.entity_type) else {
                continue;
            };
            match &descriptor.id {
                Some(_) => {
                    if let Some(found) = ids.get(&descriptor.id) {
                        keys.extend(found.iter().cloned());
                    }
                }
                None => {
                    for found in ids.values() {
                        keys.extend(found.iter().cloned());
                    }
                }
            }
        }
        keys
    }

    /// The descriptors provided by `key`'s latest fulfilled result.
    #[must_use]
    pub fn provided_by(&self, key: &CacheKey) -> &[EntityDescriptor] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl Serialize for ProvidedIndex {
    /// Serialized as `{ type: { id | "*": [keys] } }` with deterministic ordering.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let view: BTreeMap<&str, BTreeMap<String, &BTreeSet<CacheKey>>> = self
            .by_type
            .iter()
            .map(|(entity_type, ids)| {
                let ids = ids
                    .iter()
                    .map(|(id, keys)| (id.as_ref().map_or_else(|| "*".to_string(), ToString::to_string), keys))
                    .collect();
                (entity_type.as_str(), ids)
            })
            .collect();
        view.serialize(serializer)
    }
}
