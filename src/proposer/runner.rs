//! Proposer fiber run loop and state machine.

use std::future::Future;

use error_stack::Report;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, instrument, trace};

use super::{Learner, ProposeError, ProposerHandle, ProposerInput};
use crate::config::Backoff;
use crate::gate::Gate;
use crate::messages::{AcceptorWire, Message};
use crate::quorum::QuorumTrack;
use crate::traits::{Atlas, Cluster};
use crate::types::{HostId, Position, Proposal, Value};

/// Whether the fiber keeps running after an input.
#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Open<T> {
    ballot: u64,
    value: Value,
    /// Highest ordinal any acceptor has refused us with; the next retry
    /// ballot is picked above it.
    refused: u64,
    /// Highest accepted proposal reported by any promise. Its value, if any,
    /// must be re-proposed in place of our own.
    proposed: Option<Proposal>,
    /// The value sent in phase 2 and broadcast on choose.
    agreed: Value,
    promised: QuorumTrack<T>,
    accepted: QuorumTrack<T>,
    /// Phase 2 has been entered for the current ballot.
    proposing: bool,
    /// Backoff firings consumed so far.
    attempts: u32,
    learners: Vec<Learner>,
}

enum State<T> {
    Opening,
    Open(Open<T>),
    Closed { ballot: u64, value: Value },
}

struct Fiber<C, T> {
    at: Position,
    cluster: C,
    atlas: T,
    backoff: Backoff,
    closed_lifetime: std::time::Duration,
    rng: StdRng,
    state: State<T>,
    retry_timer: Gate<BoxFuture<'static, ()>>,
    closed_timer: Gate<BoxFuture<'static, ()>>,
}

/// Create a proposer fiber for `at`, returning its handle and the task to
/// spawn.
pub(crate) fn fiber<C, T>(
    at: Position,
    cluster: C,
    atlas: T,
    backoff: Backoff,
    closed_lifetime: std::time::Duration,
) -> (ProposerHandle, impl Future<Output = ()> + Send + 'static)
where
    C: Cluster,
    T: Atlas,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let fiber = Fiber {
        at,
        cluster,
        atlas,
        backoff,
        closed_lifetime,
        rng: StdRng::from_os_rng(),
        state: State::Opening,
        retry_timer: Gate::idle(),
        closed_timer: Gate::idle(),
    };
    (ProposerHandle::new(tx), fiber.run(rx))
}

impl<C, T> Fiber<C, T>
where
    C: Cluster,
    T: Atlas,
{
    #[instrument(skip_all, name = "proposer", fields(at = ?self.at, host = %self.cluster.host()))]
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ProposerInput>) {
        debug!("proposer started");
        loop {
            tokio::select! {
                input = mailbox.recv() => {
                    let Some(input) = input else {
                        debug!("mailbox closed");
                        return;
                    };
                    if self.handle(input) == Flow::Exit {
                        return;
                    }
                }
                () = &mut self.retry_timer, if self.retry_timer.is_armed() => {
                    if self.retry() == Flow::Exit {
                        return;
                    }
                }
                () = &mut self.closed_timer, if self.closed_timer.is_armed() => {
                    debug!("closed lifetime elapsed, reclaiming");
                    return;
                }
            }
        }
    }

    fn handle(&mut self, input: ProposerInput) -> Flow {
        match input {
            ProposerInput::Open { ballot, value } => self.open(ballot, value),
            ProposerInput::Learn { reply } => self.learn(reply),
            ProposerInput::Refuse { from, ballot } => self.refuse(from, ballot),
            ProposerInput::Promise {
                from,
                ballot,
                proposal,
            } => self.promise(from, ballot, proposal),
            ProposerInput::Accept { from, ballot } => self.accept(from, ballot),
            ProposerInput::Chosen { value } => return self.chosen(value),
            ProposerInput::Shutdown => {
                debug!("shut down");
                if let State::Open(open) = &mut self.state {
                    for learner in open.learners.drain(..) {
                        let _ = learner.send(Err(Report::new(ProposeError::Shutdown)));
                    }
                }
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn open(&mut self, ballot: u64, value: Value) {
        if !matches!(self.state, State::Opening) {
            trace!("already open, ignoring");
            return;
        }
        debug!(ballot, "opening");
        let open = Open {
            ballot,
            value: value.clone(),
            refused: ballot,
            proposed: None,
            agreed: value.clone(),
            promised: QuorumTrack::new(self.atlas.clone()),
            accepted: QuorumTrack::new(self.atlas.clone()),
            proposing: ballot == 0,
            attempts: 0,
            learners: Vec::new(),
        };
        // Ballot zero is implicitly accepted; skip the query round.
        if ballot == 0 {
            self.broadcast(AcceptorWire::Propose {
                at: self.at.clone(),
                ballot: 0,
                value,
            });
        } else {
            self.broadcast(AcceptorWire::Query {
                at: self.at.clone(),
                ballot,
                default: value,
            });
        }
        let delay = self.backoff.duration(0, &mut self.rng);
        self.retry_timer.arm(Box::pin(sleep(delay)));
        self.state = State::Open(open);
    }

    fn learn(&mut self, reply: Learner) {
        match &mut self.state {
            State::Opening => {
                let _ = reply.send(Err(Report::new(ProposeError::IllegalState)));
            }
            State::Open(open) => open.learners.push(reply),
            State::Closed { value, .. } => {
                let _ = reply.send(Ok(value.clone()));
            }
        }
    }

    fn refuse(&mut self, from: HostId, ballot: u64) {
        match &mut self.state {
            State::Open(open) => {
                trace!(%from, ballot, "refused");
                open.refused = open.refused.max(ballot);
                open.promised.clear();
                open.accepted.clear();
            }
            State::Closed { .. } => self.converge(from, ballot),
            State::Opening => {}
        }
    }

    fn promise(&mut self, from: HostId, ballot: u64, proposal: Option<Proposal>) {
        match &mut self.state {
            State::Open(open) => {
                if ballot != open.ballot {
                    trace!(ballot, current = open.ballot, "out-of-phase promise");
                    return;
                }
                open.promised.add(from);
                open.proposed = Proposal::max(open.proposed.take(), proposal);
                if open.proposing || !open.promised.quorum() {
                    return;
                }
                // Quorum of promises: propose the adopted value if any
                // acceptor already accepted one, else our own.
                open.proposing = true;
                open.agreed = open
                    .proposed
                    .as_ref()
                    .map_or_else(|| open.value.clone(), |adopted| adopted.value.clone());
                let wire = AcceptorWire::Propose {
                    at: self.at.clone(),
                    ballot: open.ballot,
                    value: open.agreed.clone(),
                };
                debug!(ballot = open.ballot, "promise quorum, proposing");
                self.broadcast(wire);
            }
            State::Closed { .. } => self.converge(from, ballot),
            State::Opening => {}
        }
    }

    fn accept(&mut self, from: HostId, ballot: u64) {
        match &mut self.state {
            State::Open(open) => {
                if ballot != open.ballot {
                    trace!(ballot, current = open.ballot, "out-of-phase accept");
                    return;
                }
                open.accepted.add(from);
                if !open.accepted.quorum() {
                    return;
                }
                let agreed = open.agreed.clone();
                debug!(ballot, "accept quorum, choosing");
                self.broadcast(AcceptorWire::Choose {
                    at: self.at.clone(),
                    value: agreed.clone(),
                });
                self.close(ballot, agreed);
            }
            State::Closed { .. } => self.converge(from, ballot),
            State::Opening => {}
        }
    }

    fn chosen(&mut self, value: Value) -> Flow {
        match &self.state {
            State::Opening => {
                debug!("chosen before open");
                self.close(0, value);
            }
            State::Open(open) => {
                let ballot = open.ballot;
                debug!(ballot, "learned chosen value");
                self.close(ballot, value);
            }
            State::Closed { value: closed, .. } => {
                assert!(
                    *closed == value,
                    "chosen values diverged at {:?}: {:?} != {:?}",
                    self.at,
                    closed,
                    value
                );
                trace!("duplicate chosen");
            }
        }
        Flow::Continue
    }

    /// Resolve all learners and settle into Closed.
    fn close(&mut self, ballot: u64, value: Value) {
        if let State::Open(open) = &mut self.state {
            for learner in open.learners.drain(..) {
                let _ = learner.send(Ok(value.clone()));
            }
        }
        self.retry_timer.disarm();
        self.closed_timer.arm(Box::pin(sleep(self.closed_lifetime)));
        self.state = State::Closed { ballot, value };
    }

    /// A backoff firing: pick a fresh ballot above every refusal and query
    /// again, or give up once the schedule is exhausted.
    fn retry(&mut self) -> Flow {
        let State::Open(open) = &mut self.state else {
            return Flow::Continue;
        };
        if open.attempts >= self.backoff.retries {
            debug!(attempts = open.attempts, "retries exhausted, timing out");
            for learner in open.learners.drain(..) {
                let _ = learner.send(Err(Report::new(ProposeError::Timeout)));
            }
            return Flow::Exit;
        }
        let ballot = open.refused + u64::from(self.rng.random_range(1..17u32));
        open.ballot = ballot;
        open.refused = ballot;
        open.promised.clear();
        open.accepted.clear();
        open.proposing = false;
        open.attempts += 1;
        let attempts = open.attempts;
        let wire = AcceptorWire::Query {
            at: self.at.clone(),
            ballot,
            default: open.value.clone(),
        };
        debug!(ballot, attempts, "retrying");
        self.broadcast(wire);
        let delay = self.backoff.duration(attempts, &mut self.rng);
        self.retry_timer.arm(Box::pin(sleep(delay)));
        Flow::Continue
    }

    /// Late replies to a settled decree get a one-shot choose back, pulling
    /// stragglers toward the chosen value.
    fn converge(&self, to: HostId, ballot: u64) {
        let State::Closed {
            ballot: closed,
            value,
        } = &self.state
        else {
            return;
        };
        if ballot == *closed {
            trace!(%to, "gossiping chosen value");
            self.cluster.send(
                to,
                Message::Acceptor(AcceptorWire::Choose {
                    at: self.at.clone(),
                    value: value.clone(),
                }),
            );
        }
    }

    fn broadcast(&self, wire: AcceptorWire) {
        for peer in self.atlas.peers() {
            self.cluster.send(peer, Message::Acceptor(wire.clone()));
        }
    }
}
