//! Reversible structural edits of cached JSON values.
//!
//! A recipe mutates a working copy of a value; [`diff`] then compares the
//! copy against the original and records both the forward patches and the
//! inverse patches that undo them. Optimistic updates apply the forward set
//! and keep the inverse set for rollback.
//!
//! # Example
//!
//! ```
//! use cloudburst::patch::{apply_patches, produce_with_patches};
//! use serde_json::json;
//!
//! let base = json!({ "title": "draft", "tags": ["a"] });
//! let (next, collection) = produce_with_patches(&base, |draft| {
//!     draft["title"] = json!("published");
//!     draft["tags"].as_array_mut().unwrap().push(json!("b"));
//! });
//! assert_eq!(next, json!({ "title": "published", "tags": ["a", "b"] }));
//!
//! let mut restored = next.clone();
//! apply_patches(&mut restored, &collection.inverse_patches).unwrap();
//! assert_eq!(restored, base);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One step of a path into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => index.fmt(f),
            Self::Key(key) => f.write_str(key),
        }
    }
}

/// A single structural edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Inserts into an object, or into an array shifting later items right.
    Add { path: Vec<PathSegment>, value: Value },
    /// Removes from an object, or from an array shifting later items left.
    Remove { path: Vec<PathSegment> },
    /// Overwrites the value at `path`. An empty path replaces the whole entry.
    Replace { path: Vec<PathSegment>, value: Value },
}

impl Patch {
    #[must_use]
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }
}

/// Forward patches together with the patches that undo them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchCollection {
    pub patches: Vec<Patch>,
    pub inverse_patches: Vec<Patch>,
}

impl PatchCollection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.inverse_patches.is_empty()
    }
}

/// Error applying a patch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Path `{0}` does not exist")]
    MissingPath(String),

    #[error("Index {index} is out of bounds at `{path}`")]
    OutOfBounds { path: String, index: usize },

    #[error("Cannot patch a nested path of an entry without data")]
    NoData,
}

fn render(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("/{}", parts.join("/"))
}

/// Computes the patches turning `before` into `after`, and their inverse.
#[must_use]
pub fn diff(before: &Value, after: &Value) -> PatchCollection {
    let mut patches = Vec::new();
    let mut inverse_patches = Vec::new();
    diff_at(&mut Vec::new(), before, after, &mut patches, &mut inverse_patches);
    // Each inverse undoes its forward patch, so they replay in reverse order.
    inverse_patches.reverse();
    PatchCollection {
        patches,
        inverse_patches,
    }
}

fn diff_at(
    path: &mut Vec<PathSegment>,
    before: &Value,
    after: &Value,
    forward: &mut Vec<Patch>,
    inverse: &mut Vec<Patch>,
) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                if new.contains_key(key) {
                    continue;
                }
                let mut child = path.clone();
                child.push(PathSegment::Key(key.clone()));
                forward.push(Patch::Remove { path: child.clone() });
                inverse.push(Patch::Add {
                    path: child,
                    value: old_value.clone(),
                });
            }
            for (key, new_value) in new {
                path.push(PathSegment::Key(key.clone()));
                match old.get(key) {
                    Some(old_value) => diff_at(path, old_value, new_value, forward, inverse),
                    None => {
                        forward.push(Patch::Add {
                            path: path.clone(),
                            value: new_value.clone(),
                        });
                        inverse.push(Patch::Remove { path: path.clone() });
                    }
                }
                path.pop();
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for index in 0..common {
                path.push(PathSegment::Index(index));
                diff_at(path, &old[index], &new[index], forward, inverse);
                path.pop();
            }
            // Growth appends in ascending order; shrinking trims from the end.
            for (index, value) in new.iter().enumerate().skip(common) {
                path.push(PathSegment::Index(index));
                forward.push(Patch::Add {
                    path: path.clone(),
                    value: value.clone(),
                });
                inverse.push(Patch::Remove { path: path.clone() });
                path.pop();
            }
            for (index, value) in old.iter().enumerate().skip(common).rev() {
                path.push(PathSegment::Index(index));
                forward.push(Patch::Remove { path: path.clone() });
                inverse.push(Patch::Add {
                    path: path.clone(),
                    value: value.clone(),
                });
                path.pop();
            }
        }
        _ => {
            forward.push(Patch::Replace {
                path: path.clone(),
                value: after.clone(),
            });
            inverse.push(Patch::Replace {
                path: path.clone(),
                value: before.clone(),
            });
        }
    }
}

/// Runs `recipe` against a copy of `base` and returns the result with the
/// patches describing the change.
pub fn produce_with_patches(base: &Value, recipe: impl FnOnce(&mut Value)) -> (Value, PatchCollection) {
    let mut draft = base.clone();
    recipe(&mut draft);
    let collection = diff(base, &draft);
    (draft, collection)
}

/// Applies `patches` in order. Either all of them apply or `target` is left
/// unchanged.
///
/// # Errors
///
/// Returns [`PatchError`] if a patch addresses a path that does not exist.
pub fn apply_patches(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    let mut working = target.clone();
    for patch in patches {
        apply_one(&mut working, patch)?;
    }
    *target = working;
    Ok(())
}

/// Applies `patches` to optional cached data. A root `remove` clears the data
/// and a root `add`/`replace` sets it.
pub(crate) fn apply_to_slot(slot: &mut Option<Value>, patches: &[Patch]) -> Result<(), PatchError> {
    let mut working = slot.clone();
    for patch in patches {
        if patch.path().is_empty() {
            working = match patch {
                Patch::Remove { .. } => None,
                Patch::Add { value, .. } | Patch::Replace { value, .. } => Some(value.clone()),
            };
            continue;
        }
        let Some(value) = working.as_mut() else {
            return Err(PatchError::NoData);
        };
        apply_one(value, patch)?;
    }
    *slot = working;
    Ok(())
}

fn apply_one(target: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let path = patch.path();
    let Some((last, parents)) = path.split_last() else {
        *target = match patch {
            Patch::Remove { .. } => Value::Null,
            Patch::Add { value, .. } | Patch::Replace { value, .. } => value.clone(),
        };
        return Ok(());
    };

    let mut parent = target;
    for (depth, segment) in parents.iter().enumerate() {
        let next = match (parent, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
            _ => None,
        };
        parent = next.ok_or_else(|| PatchError::MissingPath(render(&path[..=depth])))?;
    }

    match (parent, last, patch) {
        (Value::Object(map), PathSegment::Key(key), Patch::Add { value, .. } | Patch::Replace { value, .. }) => {
            map.insert(key.clone(), value.clone());
        }
        (Value::Object(map), PathSegment::Key(key), Patch::Remove { .. }) => {
            map.remove(key).ok_or_else(|| PatchError::MissingPath(render(path)))?;
        }
        (Value::Array(items), PathSegment::Index(index), patch) => {
            let index = *index;
            let in_bounds = match patch {
                Patch::Add { .. } => index <= items.len(),
                Patch::Remove { .. } | Patch::Replace { .. } => index < items.len(),
            };
            if !in_bounds {
                return Err(PatchError::OutOfBounds {
                    path: render(parents),
                    index,
                });
            }
            match patch {
                Patch::Add { value, .. } => items.insert(index, value.clone()),
                Patch::Replace { value, .. } => items[index] = value.clone(),
                Patch::Remove { .. } => {
                    items.remove(index);
                }
            }
        }
        _ => return Err(PatchError::MissingPath(render(path))),
    }
    Ok(())
}
