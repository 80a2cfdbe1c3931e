//! Conflict reporting for version-gated writes.

use thiserror::Error;

/// A write was rejected because its version did not exceed the stored one.
///
/// The map is unchanged when this error is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "version conflict on key {key:?}: existing version {existing}, attempted version {attempted}"
)]
pub struct VersionConflict<K> {
    /// The key the write targeted.
    pub key: K,
    /// The version stored in the map when the write was rejected.
    pub existing: u64,
    /// The version the caller tried to write. Never greater than `existing`.
    pub attempted: u64,
}

/// The pair of values behind a rejected write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict<V> {
    /// The value in the map that caused the rejection.
    pub existing: V,
    /// The value the caller tried to install, handed back untouched.
    pub attempted: V,
}

impl<V: crate::Versioned> Conflict<V> {
    /// Converts into the caller-facing error for `key`.
    pub fn into_error<K>(self, key: K) -> VersionConflict<K> {
        VersionConflict {
            key,
            existing: self.existing.version(),
            attempted: self.attempted.version(),
        }
    }
}

/// Result of a version-gated write, without the error wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<V> {
    /// The write landed. Carries the live value it displaced, if any.
    Accepted(Option<V>),
    /// The version gate refused the write.
    Conflict(Conflict<V>),
}

impl<V> WriteOutcome<V> {
    /// True if the write landed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteOutcome::Accepted(_))
    }

    /// The displaced value on acceptance, `None` on conflict.
    pub fn accepted(self) -> Option<Option<V>> {
        match self {
            WriteOutcome::Accepted(prior) => Some(prior),
            WriteOutcome::Conflict(_) => None,
        }
    }

    /// Translates to the `Result` surface used by [`OccMap::put`](crate::OccMap::put).
    pub fn into_result<K>(self, key: K) -> Result<Option<V>, VersionConflict<K>>
    where
        V: crate::Versioned,
    {
        match self {
            WriteOutcome::Accepted(prior) => Ok(prior),
            WriteOutcome::Conflict(c) => Err(c.into_error(key)),
        }
    }
}
