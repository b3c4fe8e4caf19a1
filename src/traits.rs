//! Contracts for the collaborators the consensus core is built over: the
//! record log, the archive, the atlas, and the cluster transport.

use core::fmt;
use core::future::Future;
use std::collections::BTreeSet;

use error_stack::Report;

use crate::messages::Message;
use crate::records::Record;
use crate::scan::ScanParams;
use crate::types::{Generation, HostId, Position, Value};

/// A record log append failed.
#[derive(Debug)]
pub struct WalError;

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("record log append failed")
    }
}

impl core::error::Error for WalError {}

/// An archive read or write failed.
#[derive(Debug)]
pub struct ArchiveError;

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("archive operation failed")
    }
}

impl core::error::Error for ArchiveError {}

/// Write-ahead record log for acceptor commitments.
///
/// Appends must be durable before the returned future resolves; an acceptor
/// replies to a proposer only after the corresponding record's future
/// completes. The future is owned (not borrowing the log handle) so a fiber
/// can hold one append in flight while continuing to process inputs.
pub trait Wal: Clone + Send + Sync + 'static {
    type AppendFuture: Future<Output = Result<(), Report<WalError>>> + Send + 'static;

    fn append(&self, record: Record) -> Self::AppendFuture;
}

/// Terminal key-value store holding chosen values.
pub trait Archive: Clone + Send + Sync + 'static {
    type LoadFuture: Future<Output = Result<Option<Value>, Report<ArchiveError>>> + Send + 'static;
    type StoreFuture: Future<Output = Result<Generation, Report<ArchiveError>>> + Send + 'static;

    fn load(&self, at: Position) -> Self::LoadFuture;

    /// Stores a chosen value and returns the archive generation stamped into
    /// the close record.
    fn store(&self, at: Position, value: Value) -> Self::StoreFuture;
}

/// Snapshot of replica placement and quorum rules for one key at one moment.
pub trait Atlas: Clone + Send + Sync + 'static {
    /// The peer set addressed for this key.
    fn peers(&self) -> Vec<HostId>;

    /// Whether the replied set forms a quorum.
    fn quorum(&self, have: &BTreeSet<HostId>) -> bool;

    /// Peers addressed but not yet contributing.
    fn awaiting(&self, have: &BTreeSet<HostId>) -> Vec<HostId> {
        self.peers()
            .into_iter()
            .filter(|peer| !have.contains(peer))
            .collect()
    }
}

/// Handle to the cluster transport.
///
/// Delivery is best effort: sends are fire-and-forget and must never block a
/// fiber. Idempotence under loss and duplication is enforced by the consensus
/// state machines, not the transport.
pub trait Cluster: Clone + Send + Sync + 'static {
    /// This process's peer identity.
    fn host(&self) -> HostId;

    fn send(&self, to: HostId, message: Message);
}

/// Request side of the scan deputy RPC. Pages come back on the director's
/// ephemeral port.
pub trait Fanout: Send + Sync + 'static {
    fn scan(&self, to: HostId, params: ScanParams);
}

/// Drives a decree to completion on behalf of a deliberating acceptor.
///
/// Implemented by the registry: it opens (or joins) the proposer for `at`
/// with the acceptor's default and resolves with whatever value the decree
/// settles on.
pub trait Confirm: Clone + Send + Sync + 'static {
    type ConfirmFuture: Future<Output = Result<Value, Report<crate::proposer::ProposeError>>>
        + Send
        + 'static;

    fn confirm(&self, at: Position, default: Value) -> Self::ConfirmFuture;
}
