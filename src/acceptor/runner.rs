//! Acceptor fiber run loop and state machine.

use std::collections::BTreeSet;
use std::future::Future;
use std::mem;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, instrument, trace, warn};

use super::{AcceptorHandle, AcceptorInput, ActiveStatus, IllegalState, Seed};
use crate::config::Config;
use crate::gate::Gate;
use crate::messages::{Message, ProposerWire};
use crate::proposer::ProposeError;
use crate::records::Record;
use crate::traits::{Archive, ArchiveError, Cluster, Confirm, Wal, WalError};
use crate::types::{BallotNumber, HostId, Position, Proposal, Value};

/// A log commitment waiting to become durable, with the reply it releases.
struct Post {
    record: Record,
    reply: Option<(HostId, ProposerWire)>,
}

struct Restoring {
    default: Value,
    ballot: BallotNumber,
    proposal: Option<Proposal>,
    proposers: BTreeSet<HostId>,
    /// The most recent commitment deliberation would have issued. A newer
    /// one replaces it; the superseded proposer retries.
    pending: Option<Post>,
}

struct Deliberating {
    default: Value,
    ballot: BallotNumber,
    proposal: Option<Proposal>,
    proposers: BTreeSet<HostId>,
}

enum State {
    Opening,
    Restoring(Restoring),
    Deliberating(Deliberating),
    Closed { chosen: Value },
    Shutdown,
    Panicked,
}

/// Outcome of applying the promise or accept rule.
enum Ruling {
    Refuse(BallotNumber),
    Post(Post),
}

/// Promise rule: refuse ballots below the promised one, otherwise commit to
/// the new ballot and release the current proposal once durable.
fn rule_query(
    at: &Position,
    ballot: &mut BallotNumber,
    proposal: &Option<Proposal>,
    from: HostId,
    ordinal: u64,
) -> Ruling {
    let bid = BallotNumber::new(ordinal, from);
    if bid < *ballot {
        return Ruling::Refuse(*ballot);
    }
    let record = Record::Promise {
        at: at.clone(),
        ballot: bid,
    };
    let reply = ProposerWire::Promise {
        at: at.clone(),
        ballot: ordinal,
        proposal: proposal.clone(),
    };
    *ballot = bid;
    Ruling::Post(Post {
        record,
        reply: Some((from, reply)),
    })
}

/// Accept rule: refuse ballots below the promised one, otherwise adopt the
/// value. Re-accepting the held value needs only the new ballot on disk.
fn rule_propose(
    at: &Position,
    ballot: &mut BallotNumber,
    proposal: &mut Option<Proposal>,
    from: HostId,
    ordinal: u64,
    value: Value,
) -> Ruling {
    let bid = BallotNumber::new(ordinal, from);
    if bid < *ballot {
        return Ruling::Refuse(*ballot);
    }
    let record = if proposal.as_ref().is_some_and(|held| held.value == value) {
        Record::Reaccept {
            at: at.clone(),
            ballot: bid,
        }
    } else {
        Record::Accept {
            at: at.clone(),
            ballot: bid,
            value: value.clone(),
        }
    };
    let reply = ProposerWire::Accept {
        at: at.clone(),
        ballot: ordinal,
    };
    *ballot = bid;
    *proposal = Some(Proposal::new(bid, value));
    Ruling::Post(Post {
        record,
        reply: Some((from, reply)),
    })
}

struct Fiber<W, A, C, F> {
    at: Position,
    wal: W,
    archive: A,
    cluster: C,
    confirm: F,
    config: Config,
    state: State,
    /// Reply owed for the record currently in flight; `None` outer means no
    /// record is in flight.
    inflight_reply: Option<Option<(HostId, ProposerWire)>>,
    /// At most one post waits behind the in-flight record; supersession
    /// replaces it.
    queued: Option<Post>,
    restore: Gate<BoxFuture<'static, Result<Option<Value>, Report<ArchiveError>>>>,
    appending: Gate<BoxFuture<'static, Result<(), Report<WalError>>>>,
    confirming: Gate<BoxFuture<'static, Result<Value, Report<ProposeError>>>>,
    deliberate_timer: Gate<BoxFuture<'static, ()>>,
    closed_timer: Gate<BoxFuture<'static, ()>>,
}

/// Create an acceptor fiber for `at`, returning its handle and the task to
/// spawn. A `seed` starts the fiber restoring with state recovered from log
/// replay instead of waiting for a first input.
pub(crate) fn fiber<W, A, C, F>(
    at: Position,
    seed: Option<Seed>,
    wal: W,
    archive: A,
    cluster: C,
    confirm: F,
    config: Config,
) -> (AcceptorHandle, impl Future<Output = ()> + Send + 'static)
where
    W: Wal,
    A: Archive,
    C: Cluster,
    F: Confirm,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let mut fiber = Fiber {
        at,
        wal,
        archive,
        cluster,
        confirm,
        config,
        state: State::Opening,
        inflight_reply: None,
        queued: None,
        restore: Gate::idle(),
        appending: Gate::idle(),
        confirming: Gate::idle(),
        deliberate_timer: Gate::idle(),
        closed_timer: Gate::idle(),
    };
    if let Some(seed) = seed {
        fiber.begin_restoring(seed.default, seed.ballot, seed.proposal);
    }
    (AcceptorHandle::new(tx), fiber.run(rx))
}

impl<W, A, C, F> Fiber<W, A, C, F>
where
    W: Wal,
    A: Archive,
    C: Cluster,
    F: Confirm,
{
    #[instrument(skip_all, name = "acceptor", fields(at = ?self.at, host = %self.cluster.host()))]
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<AcceptorInput>) {
        debug!("acceptor started");
        loop {
            tokio::select! {
                input = mailbox.recv() => {
                    let Some(input) = input else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.handle(input).await;
                }
                result = &mut self.restore, if self.restore.is_armed() => {
                    self.restored(result);
                }
                result = &mut self.appending, if self.appending.is_armed() => {
                    self.logged(result);
                }
                result = &mut self.confirming, if self.confirming.is_armed() => {
                    self.confirmed(result).await;
                }
                () = &mut self.deliberate_timer, if self.deliberate_timer.is_armed() => {
                    self.deliberate();
                }
                () = &mut self.closed_timer, if self.closed_timer.is_armed() => {
                    debug!("closed lifetime elapsed, reclaiming");
                    return;
                }
            }
        }
    }

    async fn handle(&mut self, input: AcceptorInput) {
        // The first paxos input wakes the acceptor into Restoring and is then
        // replayed into it; the triggering value doubles as the default.
        if matches!(self.state, State::Opening) {
            match &input {
                AcceptorInput::Query { default, .. } => {
                    self.begin_restoring(default.clone(), BallotNumber::ZERO, None);
                }
                AcceptorInput::Propose { value, .. } => {
                    self.begin_restoring(value.clone(), BallotNumber::ZERO, None);
                }
                _ => {}
            }
        }

        match input {
            AcceptorInput::Query {
                from,
                ballot,
                default: _,
            } => self.query(from, ballot),
            AcceptorInput::Propose {
                from,
                ballot,
                value,
            } => self.propose(from, ballot, value),
            AcceptorInput::Choose { value } => self.choose(value).await,
            AcceptorInput::Checkpoint { reply } => {
                let _ = reply.send(self.checkpoint());
            }
            AcceptorInput::Shutdown => self.shutdown(),
        }
    }

    fn begin_restoring(
        &mut self,
        default: Value,
        ballot: BallotNumber,
        proposal: Option<Proposal>,
    ) {
        debug!("restoring");
        self.restore
            .arm(Box::pin(self.archive.load(self.at.clone())));
        self.state = State::Restoring(Restoring {
            default,
            ballot,
            proposal,
            proposers: BTreeSet::new(),
            pending: None,
        });
    }

    fn query(&mut self, from: HostId, ordinal: u64) {
        trace!(%from, ordinal, "query");
        let ruling = match &mut self.state {
            State::Restoring(restoring) => {
                restoring.proposers.insert(from);
                match rule_query(
                    &self.at,
                    &mut restoring.ballot,
                    &restoring.proposal,
                    from,
                    ordinal,
                ) {
                    Ruling::Post(post) => {
                        if restoring.pending.is_some() {
                            trace!("superseding pending post");
                        }
                        restoring.pending = Some(post);
                        return;
                    }
                    refuse => refuse,
                }
            }
            State::Deliberating(deliberating) => {
                deliberating.proposers.insert(from);
                rule_query(
                    &self.at,
                    &mut deliberating.ballot,
                    &deliberating.proposal,
                    from,
                    ordinal,
                )
            }
            State::Closed { chosen } => {
                let chosen = chosen.clone();
                self.send_chosen(from, chosen);
                return;
            }
            State::Opening | State::Shutdown | State::Panicked => return,
        };
        match ruling {
            Ruling::Refuse(ballot) => self.refuse(from, ballot),
            Ruling::Post(post) => self.post(post),
        }
    }

    fn propose(&mut self, from: HostId, ordinal: u64, value: Value) {
        trace!(%from, ordinal, "propose");
        let ruling = match &mut self.state {
            State::Restoring(restoring) => {
                restoring.proposers.insert(from);
                match rule_propose(
                    &self.at,
                    &mut restoring.ballot,
                    &mut restoring.proposal,
                    from,
                    ordinal,
                    value,
                ) {
                    Ruling::Post(post) => {
                        if restoring.pending.is_some() {
                            trace!("superseding pending post");
                        }
                        restoring.pending = Some(post);
                        return;
                    }
                    refuse => refuse,
                }
            }
            State::Deliberating(deliberating) => {
                deliberating.proposers.insert(from);
                rule_propose(
                    &self.at,
                    &mut deliberating.ballot,
                    &mut deliberating.proposal,
                    from,
                    ordinal,
                    value,
                )
            }
            State::Closed { chosen } => {
                let chosen = chosen.clone();
                self.send_chosen(from, chosen);
                return;
            }
            State::Opening | State::Shutdown | State::Panicked => return,
        };
        match ruling {
            Ruling::Refuse(ballot) => self.refuse(from, ballot),
            Ruling::Post(post) => self.post(post),
        }
    }

    async fn choose(&mut self, value: Value) {
        match &self.state {
            State::Opening | State::Restoring(_) | State::Deliberating(_) => {
                match self.archive.store(self.at.clone(), value.clone()).await {
                    Ok(generation) => {
                        let proposers =
                            match mem::replace(&mut self.state, State::Closed {
                                chosen: value.clone(),
                            }) {
                                State::Restoring(restoring) => restoring.proposers,
                                State::Deliberating(deliberating) => deliberating.proposers,
                                _ => BTreeSet::new(),
                            };
                        self.restore.disarm();
                        self.confirming.disarm();
                        self.deliberate_timer.disarm();
                        self.post(Post {
                            record: Record::Close {
                                at: self.at.clone(),
                                chosen: value.clone(),
                                generation,
                            },
                            reply: None,
                        });
                        debug!(generation, "closed");
                        for peer in proposers {
                            self.send_chosen(peer, value.clone());
                        }
                        self.closed_timer
                            .arm(Box::pin(sleep(self.config.closed_lifetime)));
                    }
                    Err(report) => {
                        error!(error = ?report, "archive store failed");
                        self.panicked();
                    }
                }
            }
            State::Closed { chosen } => {
                assert!(
                    *chosen == value,
                    "chosen values diverged at {:?}: {:?} != {:?}",
                    self.at,
                    chosen,
                    value
                );
                trace!("duplicate choose");
            }
            State::Shutdown | State::Panicked => {}
        }
    }

    fn checkpoint(&self) -> Result<Option<ActiveStatus>, IllegalState> {
        match &self.state {
            State::Opening => Err(IllegalState),
            State::Restoring(restoring) => Ok(Some(ActiveStatus::Restoring {
                at: self.at.clone(),
                default: restoring.default.clone(),
            })),
            State::Deliberating(deliberating) => Ok(Some(ActiveStatus::Deliberating {
                at: self.at.clone(),
                default: deliberating.default.clone(),
                ballot: deliberating.ballot,
                proposal: deliberating.proposal.clone(),
            })),
            State::Closed { chosen } => Ok(Some(ActiveStatus::Closed {
                at: self.at.clone(),
                chosen: chosen.clone(),
            })),
            State::Shutdown | State::Panicked => Ok(None),
        }
    }

    fn shutdown(&mut self) {
        if !matches!(self.state, State::Shutdown) {
            debug!("shut down");
        }
        self.state = State::Shutdown;
        self.disarm_all();
    }

    fn panicked(&mut self) {
        error!("acceptor panicked, decree is inert until restart");
        self.state = State::Panicked;
        self.disarm_all();
    }

    fn disarm_all(&mut self) {
        self.restore.disarm();
        self.appending.disarm();
        self.confirming.disarm();
        self.deliberate_timer.disarm();
        self.closed_timer.disarm();
        self.inflight_reply = None;
        self.queued = None;
    }

    /// Completion of the archive lookup that restoring waits on.
    fn restored(&mut self, result: Result<Option<Value>, Report<ArchiveError>>) {
        let found = match result {
            Ok(found) => found,
            Err(report) => {
                error!(error = ?report, "archive load failed");
                self.panicked();
                return;
            }
        };

        self.state = match mem::replace(&mut self.state, State::Opening) {
            State::Restoring(restoring) => {
                let Restoring {
                    default,
                    ballot,
                    proposal,
                    proposers,
                    pending,
                } = restoring;
                if let Some(chosen) = found {
                    debug!("restored a closed decree");
                    for peer in &proposers {
                        self.send_chosen(*peer, chosen.clone());
                    }
                    self.closed_timer
                        .arm(Box::pin(sleep(self.config.closed_lifetime)));
                    State::Closed { chosen }
                } else {
                    debug!("deliberating");
                    self.post(Post {
                        record: Record::Open {
                            at: self.at.clone(),
                            default: default.clone(),
                        },
                        reply: None,
                    });
                    if let Some(pending) = pending {
                        self.post(pending);
                    }
                    self.deliberate_timer
                        .arm(Box::pin(sleep(self.config.deliberating_timeout)));
                    State::Deliberating(Deliberating {
                        default,
                        ballot,
                        proposal,
                        proposers,
                    })
                }
            }
            other => other,
        };
    }

    /// Queue a commitment behind the record log. Only one record may be in
    /// flight; a newer queued post replaces an older one, whose reply is
    /// never sent.
    fn post(&mut self, post: Post) {
        if self.appending.is_armed() {
            if self.queued.is_some() {
                trace!("superseding queued post");
            }
            self.queued = Some(post);
        } else {
            self.appending.arm(Box::pin(self.wal.append(post.record)));
            self.inflight_reply = Some(post.reply);
        }
    }

    /// Completion of the in-flight record append.
    fn logged(&mut self, result: Result<(), Report<WalError>>) {
        match result {
            Ok(()) => {
                if let Some((to, wire)) = self.inflight_reply.take().flatten() {
                    trace!(%to, "record durable, replying");
                    self.cluster.send(to, Message::Proposer(wire));
                }
                if let Some(next) = self.queued.take() {
                    self.appending.arm(Box::pin(self.wal.append(next.record)));
                    self.inflight_reply = Some(next.reply);
                }
            }
            Err(report) => {
                error!(error = ?report, "record log append failed");
                self.panicked();
            }
        }
    }

    /// Deliberation stalled: drive the default through consensus ourselves.
    fn deliberate(&mut self) {
        let State::Deliberating(deliberating) = &self.state else {
            return;
        };
        debug!("deliberation stalled, proposing default");
        self.confirming.arm(Box::pin(
            self.confirm
                .confirm(self.at.clone(), deliberating.default.clone()),
        ));
    }

    /// Completion of the self-initiated default proposal.
    async fn confirmed(&mut self, result: Result<Value, Report<ProposeError>>) {
        match result {
            Ok(value) => self.choose(value).await,
            Err(report) => {
                if matches!(self.state, State::Deliberating(_)) {
                    warn!(error = ?report, "default confirmation failed, rescheduling");
                    self.deliberate_timer
                        .arm(Box::pin(sleep(self.config.deliberating_timeout)));
                }
            }
        }
    }

    fn refuse(&mut self, to: HostId, ballot: BallotNumber) {
        trace!(%to, %ballot, "refusing");
        self.cluster.send(
            to,
            Message::Proposer(ProposerWire::Refuse {
                at: self.at.clone(),
                ballot: ballot.ordinal,
            }),
        );
    }

    fn send_chosen(&self, to: HostId, value: Value) {
        self.cluster.send(
            to,
            Message::Proposer(ProposerWire::Chosen {
                at: self.at.clone(),
                value,
            }),
        );
    }
}
