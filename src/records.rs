//! Durable records appended to the acceptor's write-ahead log.
//!
//! Each record kind carries a stable 32-bit descriptor used for framing on
//! disk; the constants must not change across releases or replay of old logs
//! breaks.

use core::fmt;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::types::{BallotNumber, Generation, Position, Proposal, Value};

/// A record failed to pickle or unpickle.
#[derive(Debug)]
pub struct CodecError;

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("record codec failure")
    }
}

impl core::error::Error for CodecError {}

/// One durable commitment by an acceptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// The acceptor began deliberating with this default.
    Open { at: Position, default: Value },
    /// The acceptor promised not to accept ballots below `ballot`.
    Promise { at: Position, ballot: BallotNumber },
    /// The acceptor accepted `value` at `ballot`.
    Accept {
        at: Position,
        ballot: BallotNumber,
        value: Value,
    },
    /// The acceptor re-accepted its current value at a higher ballot.
    Reaccept { at: Position, ballot: BallotNumber },
    /// The decree closed; `chosen` is durable in the archive at `generation`.
    Close {
        at: Position,
        chosen: Value,
        generation: Generation,
    },
}

impl Record {
    pub const OPEN: u32 = 0x9E45_11A3;
    pub const PROMISE: u32 = 0x2D08_6F4B;
    pub const ACCEPT: u32 = 0xC41E_97D2;
    pub const REACCEPT: u32 = 0x6B7A_30E5;
    pub const CLOSE: u32 = 0x51F2_C88C;

    /// The record's stable framing descriptor.
    #[must_use]
    pub fn descriptor(&self) -> u32 {
        match self {
            Record::Open { .. } => Record::OPEN,
            Record::Promise { .. } => Record::PROMISE,
            Record::Accept { .. } => Record::ACCEPT,
            Record::Reaccept { .. } => Record::REACCEPT,
            Record::Close { .. } => Record::CLOSE,
        }
    }

    /// The decree this record belongs to.
    #[must_use]
    pub fn at(&self) -> &Position {
        match self {
            Record::Open { at, .. }
            | Record::Promise { at, .. }
            | Record::Accept { at, .. }
            | Record::Reaccept { at, .. }
            | Record::Close { at, .. } => at,
        }
    }

    /// Frame the record as `descriptor (LE u32) ++ postcard body`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the body fails to serialize.
    pub fn pickle(&self) -> Result<Bytes, Report<CodecError>> {
        fn body<T: Serialize>(tag: u32, fields: &T) -> Result<Bytes, Report<CodecError>> {
            let buf = postcard::to_extend(fields, tag.to_le_bytes().to_vec())
                .change_context(CodecError)?;
            Ok(Bytes::from(buf))
        }

        match self {
            Record::Open { at, default } => body(Record::OPEN, &(at, default)),
            Record::Promise { at, ballot } => body(Record::PROMISE, &(at, ballot)),
            Record::Accept { at, ballot, value } => body(Record::ACCEPT, &(at, ballot, value)),
            Record::Reaccept { at, ballot } => body(Record::REACCEPT, &(at, ballot)),
            Record::Close {
                at,
                chosen,
                generation,
            } => body(Record::CLOSE, &(at, chosen, generation)),
        }
    }

    /// Parse a framed record.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short frame, an unknown descriptor, or a
    /// malformed body.
    pub fn unpickle(frame: &[u8]) -> Result<Record, Report<CodecError>> {
        fn body<T: DeserializeOwned>(frame: &[u8]) -> Result<T, Report<CodecError>> {
            postcard::from_bytes(frame).change_context(CodecError)
        }

        let (tag, rest) = frame.split_at_checked(4).ok_or(CodecError)?;
        let tag: Result<[u8; 4], _> = tag.try_into();
        let tag = u32::from_le_bytes(tag.change_context(CodecError)?);

        match tag {
            Record::OPEN => {
                let (at, default) = body(rest)?;
                Ok(Record::Open { at, default })
            }
            Record::PROMISE => {
                let (at, ballot) = body(rest)?;
                Ok(Record::Promise { at, ballot })
            }
            Record::ACCEPT => {
                let (at, ballot, value) = body(rest)?;
                Ok(Record::Accept { at, ballot, value })
            }
            Record::REACCEPT => {
                let (at, ballot) = body(rest)?;
                Ok(Record::Reaccept { at, ballot })
            }
            Record::CLOSE => {
                let (at, chosen, generation) = body(rest)?;
                Ok(Record::Close {
                    at,
                    chosen,
                    generation,
                })
            }
            _ => Err(Report::new(CodecError)
                .attach_printable(format!("unknown record descriptor {tag:#x}"))),
        }
    }
}

/// Acceptor state reconstructed from one decree's records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recovered {
    pub default: Option<Value>,
    pub ballot: BallotNumber,
    pub proposal: Option<Proposal>,
    pub chosen: Option<Value>,
}

/// Fold one decree's records, in append order, back into acceptor state.
///
/// The caller groups records by position before replaying; records for other
/// decrees must not be mixed in. Returns `None` for an empty log.
#[must_use]
pub fn replay(records: impl IntoIterator<Item = Record>) -> Option<Recovered> {
    let mut state: Option<Recovered> = None;

    for record in records {
        let folded = state.get_or_insert_with(Recovered::default);
        match record {
            Record::Open { default, .. } => folded.default = Some(default),
            Record::Promise { ballot, .. } => folded.ballot = folded.ballot.max(ballot),
            Record::Accept { ballot, value, .. } => {
                folded.ballot = folded.ballot.max(ballot);
                folded.proposal = Some(Proposal::new(ballot, value));
            }
            Record::Reaccept { ballot, .. } => {
                folded.ballot = folded.ballot.max(ballot);
                if let Some(proposal) = &mut folded.proposal {
                    proposal.ballot = ballot;
                }
            }
            Record::Close { chosen, .. } => folded.chosen = Some(chosen),
        }
    }

    state
}
