//! Per-key single-decree Paxos and distributed scan coordination for a
//! replicated, versioned key-value store.
//!
//! # Architecture
//!
//! - **Acceptors** ([`acceptor`]): one durable fiber per decree, persisting
//!   ballot and value commitments through the record log before replying
//! - **Proposers** ([`proposer`]): one fiber per decree, driving a ballot
//!   through a quorum with randomized capped backoff
//! - **ScanDirector** ([`scan`]): quorum-aware k-way merge of ordered cell
//!   streams from remote deputies, with rouse timeouts and body-driven
//!   backpressure
//!
//! The record log, archive, atlas, and cluster transport are external
//! collaborators behind the contracts in [`traits`]; [`memory`] provides
//! in-memory stand-ins.
//!
//! # Quick start
//!
//! ```ignore
//! use strata::{Config, Registry, Position, Value};
//!
//! let registry = Registry::new(wal, archive, cluster, atlas, Config::default());
//!
//! let proposer = registry.proposer(Position::new("key", 1));
//! proposer.open(0, Value::from("v1"));
//! let chosen = proposer.learn().await?;
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod config;
mod gate;
pub mod memory;
pub mod messages;
pub mod proposer;
pub mod quorum;
pub mod records;
mod registry;
pub mod scan;
pub mod traits;
pub mod types;

pub use acceptor::{AcceptorHandle, ActiveStatus, IllegalState, Seed};
pub use config::{Backoff, Config};
pub use messages::{AcceptorWire, Message, ProposerWire};
pub use proposer::{ProposeError, ProposerHandle};
pub use records::{CodecError, Record, Recovered, replay};
pub use registry::Registry;
pub use scan::{ScanDirector, ScanError, ScanPage, ScanParams};
pub use traits::{Archive, ArchiveError, Atlas, Cluster, Confirm, Fanout, Wal, WalError};
pub use types::{BallotNumber, Cell, Generation, HostId, Key, Position, Proposal, Time, Value};
