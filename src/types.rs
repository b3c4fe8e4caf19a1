//! Core value types shared by the consensus and scan halves of the store.

use core::cmp::Ordering;
use core::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque key identity. Two keys are equal iff their bytes are equal.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Bytes);

impl Key {
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0.escape_ascii())
    }
}

impl From<&'static str> for Key {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

/// Opaque value payload. Once chosen for a key, immutable forever.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Value(pub Bytes);

impl Value {
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.0.escape_ascii())
    }
}

impl From<&'static str> for Value {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

/// Monotonic transaction clock.
pub type Time = u64;

/// Archive generation stamped into close records.
pub type Generation = u64;

/// Peer identity within the cluster.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{}", self.0)
    }
}

/// A `(key, time)` pair.
///
/// Identifies one decree of the versioned store, and doubles as the cursor
/// position for scans. The total order is key ascending, then time
/// **descending**, so that the newest version of a key sorts first — the
/// store's natural scan order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub key: Key,
    pub time: Time,
}

impl Position {
    #[must_use]
    pub fn new(key: impl Into<Key>, time: Time) -> Self {
        Self {
            key: key.into(),
            time,
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.key.cmp(&other.key)).then(other.time.cmp(&self.time))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<(&'static str, Time)> for Position {
    fn from((key, time): (&'static str, Time)) -> Self {
        Self::new(key, time)
    }
}

/// Totally ordered proposal identifier: `(ordinal, host)` lexicographic.
///
/// The host id breaks ties between proposers that pick the same ordinal.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BallotNumber {
    pub ordinal: u64,
    pub host: HostId,
}

impl BallotNumber {
    pub const ZERO: Self = Self {
        ordinal: 0,
        host: HostId(0),
    };

    #[must_use]
    pub fn new(ordinal: u64, host: HostId) -> Self {
        Self { ordinal, host }
    }
}

impl fmt::Display for BallotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.ordinal, self.host)
    }
}

/// The highest `(ballot, value)` pair an acceptor has accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub ballot: BallotNumber,
    pub value: Value,
}

impl Proposal {
    #[must_use]
    pub fn new(ballot: BallotNumber, value: Value) -> Self {
        Self { ballot, value }
    }

    /// Prefer the proposal with the larger ballot; `None` is dominated by any
    /// `Some`.
    #[must_use]
    pub fn max(a: Option<Proposal>, b: Option<Proposal>) -> Option<Proposal> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.ballot > a.ballot { b } else { a }),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

/// One version of one key, as produced by a scan. `value: None` is a
/// tombstone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub key: Key,
    pub time: Time,
    pub value: Option<Value>,
}

impl Cell {
    #[must_use]
    pub fn new(key: impl Into<Key>, time: Time, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            time,
            value,
        }
    }

    /// The cell's position under the store ordering. Values do not
    /// participate in ordering.
    #[must_use]
    pub fn position(&self) -> Position {
        Position {
            key: self.key.clone(),
            time: self.time,
        }
    }

    /// The store's natural cell order: key ascending, time descending.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        (self.key.cmp(&other.key)).then(other.time.cmp(&self.time))
    }
}
