//! Proposer for one decree.
//!
//! One fiber per `(key, time)`. Drives a ballot through a quorum of
//! acceptors — query, collect promises, propose, collect accepts, broadcast
//! choose — retrying under a capped randomized exponential backoff.

use core::fmt;

use error_stack::Report;
use tokio::sync::{mpsc, oneshot};

use crate::messages::ProposerWire;
use crate::types::{HostId, Proposal, Value};

mod runner;

pub(crate) use runner::fiber;

/// Why a decree could not be resolved for a learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeError {
    /// The retry budget ran out before a quorum was reached.
    Timeout,
    /// `learn` was called before the proposer was opened.
    IllegalState,
    /// The proposer was shut down before resolving.
    Shutdown,
}

impl fmt::Display for ProposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::Timeout => f.write_str("proposal timed out before reaching quorum"),
            ProposeError::IllegalState => f.write_str("learn is illegal before open"),
            ProposeError::Shutdown => f.write_str("proposer was shut down"),
        }
    }
}

impl core::error::Error for ProposeError {}

pub(crate) type Learner = oneshot::Sender<Result<Value, Report<ProposeError>>>;

pub(crate) enum ProposerInput {
    Open {
        ballot: u64,
        value: Value,
    },
    Learn {
        reply: Learner,
    },
    Refuse {
        from: HostId,
        ballot: u64,
    },
    Promise {
        from: HostId,
        ballot: u64,
        proposal: Option<Proposal>,
    },
    Accept {
        from: HostId,
        ballot: u64,
    },
    Chosen {
        value: Value,
    },
    Shutdown,
}

/// Mailbox handle to one proposer fiber.
#[derive(Clone)]
pub struct ProposerHandle {
    tx: mpsc::UnboundedSender<ProposerInput>,
}

impl ProposerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProposerInput>) -> Self {
        Self { tx }
    }

    /// Whether the fiber behind this handle has exited.
    #[must_use]
    pub(crate) fn is_stale(&self) -> bool {
        self.tx.is_closed()
    }

    /// Begin the decree with an initial ballot and preferred value.
    ///
    /// Ballot zero is implicitly accepted and proposed directly; any other
    /// ballot starts with a query round.
    pub fn open(&self, ballot: u64, value: Value) {
        let _ = self.tx.send(ProposerInput::Open { ballot, value });
    }

    /// Wait for the decree's chosen value.
    ///
    /// # Errors
    ///
    /// [`ProposeError::Timeout`] when the retry budget is exhausted,
    /// [`ProposeError::IllegalState`] before `open`, and
    /// [`ProposeError::Shutdown`] if the proposer goes away first.
    pub async fn learn(&self) -> Result<Value, Report<ProposeError>> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ProposerInput::Learn { reply }).is_err() {
            return Err(Report::new(ProposeError::Shutdown));
        }
        rx.await
            .unwrap_or_else(|_| Err(Report::new(ProposeError::Shutdown)))
    }

    /// Stop the decree; all inputs after this are ignored.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ProposerInput::Shutdown);
    }

    /// Route an incoming wire reply from `from` into the fiber.
    pub(crate) fn deliver(&self, from: HostId, wire: ProposerWire) {
        let input = match wire {
            ProposerWire::Refuse { ballot, .. } => ProposerInput::Refuse { from, ballot },
            ProposerWire::Promise {
                ballot, proposal, ..
            } => ProposerInput::Promise {
                from,
                ballot,
                proposal,
            },
            ProposerWire::Accept { ballot, .. } => ProposerInput::Accept { from, ballot },
            ProposerWire::Chosen { value, .. } => ProposerInput::Chosen { value },
        };
        let _ = self.tx.send(input);
    }
}
