//! Durable Paxos acceptor for one decree.
//!
//! One fiber per `(key, time)`. The fiber serializes every input, persists
//! its commitments through the record log, and replies to proposers only
//! once the corresponding record is durable.

use core::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::messages::AcceptorWire;
use crate::types::{BallotNumber, HostId, Position, Proposal, Value};

mod runner;

pub(crate) use runner::fiber;

/// The requested operation is not available in the acceptor's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalState;

impl fmt::Display for IllegalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation is illegal in the acceptor's current state")
    }
}

impl core::error::Error for IllegalState {}

/// Snapshot of an acceptor for migration and recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActiveStatus {
    /// The archive lookup is still in flight.
    Restoring { at: Position, default: Value },
    /// The working state, with the highest promised ballot and accepted
    /// proposal.
    Deliberating {
        at: Position,
        default: Value,
        ballot: BallotNumber,
        proposal: Option<Proposal>,
    },
    /// The decree is decided.
    Closed { at: Position, chosen: Value },
}

impl ActiveStatus {
    /// The decree this status describes.
    #[must_use]
    pub fn at(&self) -> &Position {
        match self {
            ActiveStatus::Restoring { at, .. }
            | ActiveStatus::Deliberating { at, .. }
            | ActiveStatus::Closed { at, .. } => at,
        }
    }

    /// The value this acceptor would fall back to; the chosen value once
    /// closed.
    #[must_use]
    pub fn default_value(&self) -> &Value {
        match self {
            ActiveStatus::Restoring { default, .. }
            | ActiveStatus::Deliberating { default, .. } => default,
            ActiveStatus::Closed { chosen, .. } => chosen,
        }
    }
}

/// Acceptor state recovered from record log replay, used to reseed a fiber
/// after a crash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seed {
    pub default: Value,
    pub ballot: BallotNumber,
    pub proposal: Option<Proposal>,
}

pub(crate) enum AcceptorInput {
    Query {
        from: HostId,
        ballot: u64,
        default: Value,
    },
    Propose {
        from: HostId,
        ballot: u64,
        value: Value,
    },
    Choose {
        value: Value,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<Option<ActiveStatus>, IllegalState>>,
    },
    Shutdown,
}

/// Mailbox handle to one acceptor fiber.
#[derive(Clone)]
pub struct AcceptorHandle {
    tx: mpsc::UnboundedSender<AcceptorInput>,
}

impl AcceptorHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<AcceptorInput>) -> Self {
        Self { tx }
    }

    /// Whether the fiber behind this handle has exited.
    #[must_use]
    pub(crate) fn is_stale(&self) -> bool {
        self.tx.is_closed()
    }

    /// Phase-1 request from `from` at `ballot`, carrying the proposer's
    /// preferred value as this acceptor's default.
    pub fn query(&self, from: HostId, ballot: u64, default: Value) {
        let _ = self.tx.send(AcceptorInput::Query {
            from,
            ballot,
            default,
        });
    }

    /// Phase-2 request from `from` at `ballot`.
    pub fn propose(&self, from: HostId, ballot: u64, value: Value) {
        let _ = self.tx.send(AcceptorInput::Propose {
            from,
            ballot,
            value,
        });
    }

    /// Notification that `value` is decided for this decree.
    pub fn choose(&self, value: Value) {
        let _ = self.tx.send(AcceptorInput::Choose { value });
    }

    /// Snapshot the acceptor for migration or recovery.
    ///
    /// Returns `Ok(None)` once the acceptor has nothing active (shut down,
    /// panicked, or already reclaimed).
    ///
    /// # Errors
    ///
    /// Returns [`IllegalState`] if the acceptor has not received its first
    /// input yet.
    pub async fn checkpoint(&self) -> Result<Option<ActiveStatus>, IllegalState> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AcceptorInput::Checkpoint { reply })
            .is_err()
        {
            return Ok(None);
        }
        rx.await.unwrap_or(Ok(None))
    }

    /// Terminal: all further inputs become no-ops. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(AcceptorInput::Shutdown);
    }

    /// Route an incoming wire request from `from` into the fiber.
    pub(crate) fn deliver(&self, from: HostId, wire: AcceptorWire) {
        match wire {
            AcceptorWire::Query {
                ballot, default, ..
            } => self.query(from, ballot, default),
            AcceptorWire::Propose { ballot, value, .. } => self.propose(from, ballot, value),
            AcceptorWire::Choose { value, .. } => self.choose(value),
        }
    }
}
