//! Per-node registries of live acceptor and proposer fibers.
//!
//! Insertion is get-or-create; removal is idempotent — a fiber that has
//! been reclaimed leaves a stale handle behind, replaced on next access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use error_stack::Report;
use futures::future::BoxFuture;
use tokio_util::task::JoinMap;
use tracing::trace;

use crate::acceptor::{self, AcceptorHandle, Seed};
use crate::config::{Backoff, Config};
use crate::messages::Message;
use crate::proposer::{self, ProposeError, ProposerHandle};
use crate::traits::{Archive, Atlas, Cluster, Confirm, Wal};
use crate::types::{HostId, Position, Value};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    Acceptor,
    Proposer,
}

struct Inner<W, A, C, T> {
    wal: W,
    archive: A,
    cluster: C,
    atlas: T,
    config: Config,
    acceptors: Mutex<HashMap<Position, AcceptorHandle>>,
    proposers: Mutex<HashMap<Position, ProposerHandle>>,
    /// Owns every fiber task; dropping the registry aborts them all.
    tasks: Mutex<JoinMap<(Role, Position), ()>>,
}

/// One node's view of the consensus core: the shared collaborators plus the
/// maps of live per-decree fibers.
pub struct Registry<W, A, C, T> {
    inner: Arc<Inner<W, A, C, T>>,
}

impl<W, A, C, T> Clone for Registry<W, A, C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W, A, C, T> Registry<W, A, C, T>
where
    W: Wal,
    A: Archive,
    C: Cluster,
    T: Atlas,
{
    #[must_use]
    pub fn new(wal: W, archive: A, cluster: C, atlas: T, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                wal,
                archive,
                cluster,
                atlas,
                config,
                acceptors: Mutex::new(HashMap::new()),
                proposers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The acceptor fiber for `at`, created on first use.
    pub fn acceptor(&self, at: Position) -> AcceptorHandle {
        acceptor_of(&self.inner, at, None)
    }

    /// Start the acceptor for `at` restoring from state recovered out of the
    /// record log, as after a crash.
    pub fn resume(&self, at: Position, seed: Seed) -> AcceptorHandle {
        acceptor_of(&self.inner, at, Some(seed))
    }

    /// The proposer fiber for `at`, created on first use.
    pub fn proposer(&self, at: Position) -> ProposerHandle {
        proposer_of(&self.inner, at, self.inner.config.proposing_backoff.clone())
    }

    /// Route an incoming wire message from `from` to its fiber.
    ///
    /// Acceptors are created on demand; replies for decrees with no live
    /// proposer belong to an already-resolved decree and are dropped.
    pub fn deliver(&self, from: HostId, message: Message) {
        match message {
            Message::Acceptor(wire) => {
                acceptor_of(&self.inner, wire.at().clone(), None).deliver(from, wire);
            }
            Message::Proposer(wire) => {
                let handle = {
                    let proposers = self.inner.proposers.lock().unwrap();
                    proposers
                        .get(wire.at())
                        .filter(|handle| !handle.is_stale())
                        .cloned()
                };
                match handle {
                    Some(handle) => handle.deliver(from, wire),
                    None => trace!(at = ?wire.at(), "dropping reply for resolved decree"),
                }
            }
        }
    }

    /// Signal every live fiber to stop; idempotent.
    pub fn shutdown(&self) {
        for handle in self.inner.acceptors.lock().unwrap().values() {
            handle.shutdown();
        }
        for handle in self.inner.proposers.lock().unwrap().values() {
            handle.shutdown();
        }
    }
}

fn acceptor_of<W, A, C, T>(
    inner: &Arc<Inner<W, A, C, T>>,
    at: Position,
    seed: Option<Seed>,
) -> AcceptorHandle
where
    W: Wal,
    A: Archive,
    C: Cluster,
    T: Atlas,
{
    let mut acceptors = inner.acceptors.lock().unwrap();
    if let Some(handle) = acceptors.get(&at) {
        if !handle.is_stale() {
            return handle.clone();
        }
        trace!(?at, "replacing reclaimed acceptor");
    }
    let confirm = RegistryConfirm {
        inner: Arc::downgrade(inner),
    };
    let (handle, task) = acceptor::fiber(
        at.clone(),
        seed,
        inner.wal.clone(),
        inner.archive.clone(),
        inner.cluster.clone(),
        confirm,
        inner.config.clone(),
    );
    inner
        .tasks
        .lock()
        .unwrap()
        .spawn((Role::Acceptor, at.clone()), task);
    acceptors.insert(at, handle.clone());
    handle
}

fn proposer_of<W, A, C, T>(
    inner: &Arc<Inner<W, A, C, T>>,
    at: Position,
    backoff: Backoff,
) -> ProposerHandle
where
    W: Wal,
    A: Archive,
    C: Cluster,
    T: Atlas,
{
    let mut proposers = inner.proposers.lock().unwrap();
    if let Some(handle) = proposers.get(&at) {
        if !handle.is_stale() {
            return handle.clone();
        }
        trace!(?at, "replacing reclaimed proposer");
    }
    let (handle, task) = proposer::fiber(
        at.clone(),
        inner.cluster.clone(),
        inner.atlas.clone(),
        backoff,
        inner.config.closed_lifetime,
    );
    inner
        .tasks
        .lock()
        .unwrap()
        .spawn((Role::Proposer, at.clone()), task);
    proposers.insert(at, handle.clone());
    handle
}

/// The registry's implementation of [`Confirm`]: a deliberating acceptor's
/// default is driven through the proposer for its own decree.
struct RegistryConfirm<W, A, C, T> {
    inner: Weak<Inner<W, A, C, T>>,
}

impl<W, A, C, T> Clone for RegistryConfirm<W, A, C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<W, A, C, T> Confirm for RegistryConfirm<W, A, C, T>
where
    W: Wal,
    A: Archive,
    C: Cluster,
    T: Atlas,
{
    type ConfirmFuture = BoxFuture<'static, Result<Value, Report<ProposeError>>>;

    fn confirm(&self, at: Position, default: Value) -> Self::ConfirmFuture {
        let weak = Weak::clone(&self.inner);
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return Err(Report::new(ProposeError::Shutdown));
            };
            let proposer = proposer_of(&inner, at, inner.config.confirming_backoff.clone());
            drop(inner);
            // Ballot zero proposes the default directly; contention is
            // resolved by the proposer's own refuse/backoff loop.
            proposer.open(0, default);
            proposer.learn().await
        })
    }
}
