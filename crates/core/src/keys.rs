//! Validated string keys and per-run counters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum allowed length for a [`WorkflowId`].
const WORKFLOW_ID_MAX_LEN: usize = 64;

/// Maximum allowed length for a [`WorkerId`].
const WORKER_ID_MAX_LEN: usize = 128;

/// Length of a hex-encoded SHA-256 digest.
const EFFECT_ID_LEN: usize = 64;

/// Errors from constructing a validated key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The input was empty or contained only whitespace.
    #[error("{kind} cannot be empty")]
    Empty {
        /// Which key type was being built.
        kind: &'static str,
    },
    /// The input contains characters outside the allowed set.
    #[error("{kind} contains invalid characters: {value:?}")]
    InvalidCharacters {
        /// Which key type was being built.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
    /// The input exceeds the maximum length.
    #[error("{kind} exceeds maximum length of {max} characters")]
    TooLong {
        /// Which key type was being built.
        kind: &'static str,
        /// The limit that was exceeded.
        max: usize,
    },
}

/// Name of a registered workflow, e.g. `refund_flow`.
///
/// Must be non-empty, at most 64 characters, and contain only `a-z`, `0-9`,
/// `_`, `-` and `.`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Validate and wrap a workflow name.
    pub fn new(raw: &str) -> Result<Self, KeyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty { kind: "workflow id" });
        }
        if trimmed.len() > WORKFLOW_ID_MAX_LEN {
            return Err(KeyError::TooLong {
                kind: "workflow id",
                max: WORKFLOW_ID_MAX_LEN,
            });
        }
        if !trimmed
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'.'))
        {
            return Err(KeyError::InvalidCharacters {
                kind: "workflow id",
                value: trimmed.to_owned(),
            });
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Return the inner string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of a dispatcher worker holding run claims.
///
/// Printable ASCII without whitespace, at most 128 characters.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Validate and wrap a worker name.
    pub fn new(raw: &str) -> Result<Self, KeyError> {
        if raw.is_empty() {
            return Err(KeyError::Empty { kind: "worker id" });
        }
        if raw.len() > WORKER_ID_MAX_LEN {
            return Err(KeyError::TooLong {
                kind: "worker id",
                max: WORKER_ID_MAX_LEN,
            });
        }
        if !raw.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(KeyError::InvalidCharacters {
                kind: "worker id",
                value: raw.to_owned(),
            });
        }
        Ok(Self(raw.to_owned()))
    }

    /// Return the inner string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Deterministic fingerprint of a side-effecting action.
///
/// Always a lowercase hex-encoded 256-bit digest. Produced by the effect key
/// deriver in `spire-execution`; constructing one by hand only validates shape.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EffectId(String);

impl EffectId {
    /// Wrap a hex digest, checking its shape.
    pub fn from_hex(raw: &str) -> Result<Self, KeyError> {
        if raw.is_empty() {
            return Err(KeyError::Empty { kind: "effect id" });
        }
        if raw.len() != EFFECT_ID_LEN
            || !raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(KeyError::InvalidCharacters {
                kind: "effect id",
                value: raw.to_owned(),
            });
        }
        Ok(Self(raw.to_owned()))
    }

    /// Hex-encode a raw digest.
    #[must_use]
    pub fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }

    /// Return the inner string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_key_impls {
    ($ty:ident, $ctor:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::$ctor(s)
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = KeyError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::$ctor(value)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = KeyError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::$ctor(&value)
            }
        }

        impl From<$ty> for String {
            fn from(key: $ty) -> Self {
                key.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<&str> for $ty {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_key_impls!(WorkflowId, new);
string_key_impls!(WorkerId, new);
string_key_impls!(EffectId, from_hex);

/// Position of a checkpoint within its run. Starts at 1 and only grows.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(u64);

impl CheckpointId {
    /// The first checkpoint of every run.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The checkpoint that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Position of an event within its run's timeline. Starts at 1.
#[derive(
    Debug, Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// "Before the first event"; reading after `ZERO` returns the whole timeline.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The sequence that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
