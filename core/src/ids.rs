//! Entity identification, source references and versioning types.
//!
//! This module defines strong types for entity identification (`EntityId`),
//! external source linkage (`SourceRef`) and optimistic-concurrency control
//! (`Version`).

use crate::entity::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Namespace for every deterministic (v5) identifier syncflow derives.
pub const SYNCFLOW_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_3e0a_9b7d_4c52_8a41_d2e5_07b3_94af);

/// Error type for `EntityId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid entity ID: {0}")]
pub struct ParseEntityIdError(String);

/// Unique identifier for an entity record in the store.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// Use `FromStr` when parsing envelope fields. Use `new()` or `From` when
/// constructing ids from application-controlled data.
///
/// # Examples
///
/// ```
/// use syncflow_core::ids::EntityId;
///
/// let id = EntityId::new("course-12345");
/// assert_eq!(id.as_str(), "course-12345");
///
/// let parsed: EntityId = "member-abc".parse().unwrap();
/// assert_eq!(parsed, EntityId::new("member-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new `EntityId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a deterministic id for an entity first seen through a source reference.
    ///
    /// Two workers synthesizing the same entity derive the same key, so the
    /// conditional create lets exactly one of them win.
    ///
    /// # Examples
    ///
    /// ```
    /// use syncflow_core::entity::EntityKind;
    /// use syncflow_core::ids::{EntityId, SourceRef};
    ///
    /// let source = SourceRef::new("CIRCLE", "42");
    /// assert_eq!(
    ///     EntityId::derive(EntityKind::Member, &source),
    ///     EntityId::derive(EntityKind::Member, &source),
    /// );
    /// ```
    #[must_use]
    pub fn derive(kind: EntityKind, source: &SourceRef) -> Self {
        let name = format!("{}:{source}", kind.as_str());
        Self(Uuid::new_v5(&SYNCFLOW_NAMESPACE, name.as_bytes()).to_string())
    }

    /// Get the entity ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `EntityId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = ParseEntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseEntityIdError("Entity ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Error type for `SourceRef` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid source reference '{input}': {reason}")]
pub struct ParseSourceRefError {
    input: String,
    reason: &'static str,
}

/// Reference to a record in an external source-of-truth system.
///
/// Rendered as `SOURCE#id`, e.g. `KAJABI#1234` or `CIRCLE#member-9`. An entity
/// may carry one reference per external platform.
///
/// # Examples
///
/// ```
/// use syncflow_core::ids::SourceRef;
///
/// let source: SourceRef = "KAJABI#1234".parse().unwrap();
/// assert_eq!(source.source(), "KAJABI");
/// assert_eq!(source.id(), "1234");
/// assert_eq!(source.to_string(), "KAJABI#1234");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceRef {
    source: String,
    id: String,
}

impl SourceRef {
    /// Separator between the source system and its record id.
    pub const SEPARATOR: char = '#';

    /// Create a reference from trusted parts.
    #[must_use]
    pub fn new(source: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
        }
    }

    /// The external system name.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The record id inside the external system.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.source, Self::SEPARATOR, self.id)
    }
}

impl FromStr for SourceRef {
    type Err = ParseSourceRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseSourceRefError {
            input: s.to_string(),
            reason,
        };
        let (source, id) = s
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| err("missing '#' separator"))?;
        if source.is_empty() {
            return Err(err("empty source"));
        }
        if id.is_empty() {
            return Err(err("empty id"));
        }
        Ok(Self::new(source, id))
    }
}

impl TryFrom<String> for SourceRef {
    type Error = ParseSourceRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceRef> for String {
    fn from(value: SourceRef) -> Self {
        value.to_string()
    }
}

/// Record version number for optimistic concurrency control.
///
/// A record is created at version 1 and every effective update advances it by
/// one. Conditional updates name the version they were decided against:
///
/// - If the record's current version doesn't match, the write fails
/// - The losing writer re-resolves and decides again
///
/// # Examples
///
/// ```
/// use syncflow_core::ids::Version;
///
/// let v1 = Version::FIRST;
/// assert_eq!(v1.next(), Version::new(2));
/// assert_eq!(Version::new(5).value(), 5);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version a freshly created record carries.
    pub const FIRST: Self = Self(1);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the version of a freshly created record.
    #[must_use]
    pub const fn is_first(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}
