//! Domain identifiers (strongly-typed IDs).
//!
//! Tasks and subjects are identified by ULIDs wrapped in a phantom-typed
//! `Id<T>`, so a `TaskId` can never be passed where a `SubjectId` is expected.
//! ULIDs sort by creation time.
//!
//! Configs are not in this module: their identity is derived from their
//! content (see [`crate::domain::config::ConfigId`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID kind.
///
/// Provides the prefix used by `Display` ("task-", "subject-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` only exists at compile time (`PhantomData`), so `Id<T>` has the same
/// size as a `Ulid`.
#[repr(transparent)]
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

// Manual impls: derives would put bounds on `T`, which is an uninhabited marker.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Storage form: the bare ULID string, without the display prefix.
    pub fn to_storage(&self) -> String {
        self.ulid.to_string()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {value}")]
pub struct ParseIdError {
    kind: &'static str,
    value: String,
}

/// Accepts both the display form (`task-01H…`) and the bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::prefix().trim_end_matches('-'),
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {}

impl IdMarker for Subject {
    fn prefix() -> &'static str {
        "subject-"
    }
}

/// Identifier of a Task (one subject processed under one config).
pub type TaskId = Id<Task>;

/// Identifier of a Subject (one recording in the media registry).
pub type SubjectId = Id<Subject>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefix_follows_the_kind() {
        let ulid = Ulid::new();

        assert_eq!(TaskId::from(ulid).to_string(), format!("task-{ulid}"));
        assert_eq!(SubjectId::from(ulid).to_string(), format!("subject-{ulid}"));
    }

    #[test]
    fn ids_order_by_creation_time() {
        let older = TaskId::from_ulid(Ulid::from_parts(1_000, u128::MAX >> 48));
        let newer = TaskId::from_ulid(Ulid::from_parts(1_001, 0));

        assert!(older < newer);
    }

    #[test]
    fn parse_accepts_display_and_storage_forms() {
        let id = TaskId::from_ulid(Ulid::new());

        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert_eq!(id.to_storage().parse::<TaskId>().unwrap(), id);
        assert!("task-nope".parse::<TaskId>().is_err());
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let id = SubjectId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&id).unwrap();

        assert_eq!(json, format!("\"{}\"", id.to_storage()));
        assert_eq!(serde_json::from_str::<SubjectId>(&json).unwrap(), id);
    }
}
