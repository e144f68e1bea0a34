use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Stable identity of an aggregate root.
    ///
    /// Wraps a UUID so aggregate ids cannot be mixed up with batch ids or
    /// other UUID-based identifiers.
    AggregateId
}

uuid_id! {
    /// Identifies one atomically committed batch of events.
    BatchId
}

/// Per-aggregate event index.
///
/// The first event an aggregate ever emits has sequence number 0. The number
/// is assigned at emission time from the aggregate's current replay position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Sequence number of an aggregate's first event.
    pub const FIRST: Self = Self(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// The sequence number following `last`, or [`SequenceNumber::FIRST`]
    /// when nothing has been applied yet.
    pub fn after(last: Option<SequenceNumber>) -> Self {
        last.map_or(Self::FIRST, |s| s.next())
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SequenceNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Log-wide position of a committed event.
///
/// Assigned only at commit time, strictly increasing and unique across the
/// whole log. The first committed event has position 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GlobalSequenceNumber(i64);

impl GlobalSequenceNumber {
    /// Position of the first event in an empty log.
    pub const FIRST: Self = Self(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the position `offset` slots after this one.
    pub fn offset(&self, offset: usize) -> Self {
        Self(self.0 + offset as i64)
    }
}

impl std::fmt::Display for GlobalSequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GlobalSequenceNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Upper bound on the global positions visible to a read.
///
/// `Unbounded` means "current state" and doubles as the cache key for
/// ordinary loads inside a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Cutoff {
    #[default]
    Unbounded,
    /// Events up to and including this position are visible.
    At(GlobalSequenceNumber),
}

impl Cutoff {
    pub fn at(position: GlobalSequenceNumber) -> Self {
        Cutoff::At(position)
    }

    /// Returns true if an event committed at `position` is visible.
    pub fn admits(&self, position: GlobalSequenceNumber) -> bool {
        match self {
            Cutoff::Unbounded => true,
            Cutoff::At(limit) => position <= *limit,
        }
    }

    /// Returns true if a snapshot valid from `valid_from` may seed a read
    /// at this cutoff. The comparison is strict.
    pub fn allows_snapshot(&self, valid_from: GlobalSequenceNumber) -> bool {
        match self {
            Cutoff::Unbounded => true,
            Cutoff::At(limit) => valid_from < *limit,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Cutoff::Unbounded)
    }
}

impl std::fmt::Display for Cutoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cutoff::Unbounded => write!(f, "unbounded"),
            Cutoff::At(position) => write!(f, "{position}"),
        }
    }
}
