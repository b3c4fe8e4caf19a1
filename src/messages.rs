//! Cluster wire messages.
//!
//! Every message carries the decree position `(key, time)`. Ballot fields on
//! the wire are the proposer-chosen ordinal; the receiving acceptor forms the
//! full [`BallotNumber`](crate::types::BallotNumber) by pairing the ordinal
//! with the sender's host id from the transport.
//!
//! Each descriptor has a stable 64-bit id used for wire framing; the
//! constants must stay bit-exact to interoperate with existing peers.

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::records::CodecError;
use crate::types::{Position, Proposal, Value};

/// Requests addressed to an acceptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptorWire {
    /// Phase 1: promise request at `ballot`, carrying the proposer's
    /// preferred value as the acceptor's default.
    Query {
        at: Position,
        ballot: u64,
        default: Value,
    },
    /// Phase 2: accept request for `value` at `ballot`.
    Propose {
        at: Position,
        ballot: u64,
        value: Value,
    },
    /// The decree is decided; commit `value` to the archive.
    Choose { at: Position, value: Value },
}

/// Replies addressed to a proposer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposerWire {
    /// The acceptor has promised a higher ballot (its ordinal is attached).
    Refuse { at: Position, ballot: u64 },
    /// Phase-1 grant, echoing the queried ordinal and the acceptor's highest
    /// accepted proposal, if any.
    Promise {
        at: Position,
        ballot: u64,
        proposal: Option<Proposal>,
    },
    /// Phase-2 grant, echoing the proposed ordinal.
    Accept { at: Position, ballot: u64 },
    /// The decree's chosen value, for gossip convergence.
    Chosen { at: Position, value: Value },
}

impl AcceptorWire {
    /// The decree this request belongs to.
    #[must_use]
    pub fn at(&self) -> &Position {
        match self {
            AcceptorWire::Query { at, .. }
            | AcceptorWire::Propose { at, .. }
            | AcceptorWire::Choose { at, .. } => at,
        }
    }
}

impl ProposerWire {
    /// The decree this reply belongs to.
    #[must_use]
    pub fn at(&self) -> &Position {
        match self {
            ProposerWire::Refuse { at, .. }
            | ProposerWire::Promise { at, .. }
            | ProposerWire::Accept { at, .. }
            | ProposerWire::Chosen { at, .. } => at,
        }
    }
}

/// Any consensus message on the cluster transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Acceptor(AcceptorWire),
    Proposer(ProposerWire),
}

impl Message {
    pub const QUERY: u64 = 0xA7C8_1B52_9E04_D3F6;
    pub const PROPOSE: u64 = 0x3D91_46AF_C25B_7E08;
    pub const CHOOSE: u64 = 0xE852_09B7_1FA4_63CD;
    pub const REFUSE: u64 = 0x5B2F_D7E0_84C1_9A36;
    pub const PROMISE: u64 = 0xC604_3A9D_5EF2_08B1;
    pub const ACCEPT: u64 = 0x1FD8_62C5_B39A_E470;
    pub const CHOSEN: u64 = 0x94E3_FB08_27D6_4C15;

    /// The message's stable framing descriptor.
    #[must_use]
    pub fn descriptor(&self) -> u64 {
        match self {
            Message::Acceptor(AcceptorWire::Query { .. }) => Message::QUERY,
            Message::Acceptor(AcceptorWire::Propose { .. }) => Message::PROPOSE,
            Message::Acceptor(AcceptorWire::Choose { .. }) => Message::CHOOSE,
            Message::Proposer(ProposerWire::Refuse { .. }) => Message::REFUSE,
            Message::Proposer(ProposerWire::Promise { .. }) => Message::PROMISE,
            Message::Proposer(ProposerWire::Accept { .. }) => Message::ACCEPT,
            Message::Proposer(ProposerWire::Chosen { .. }) => Message::CHOSEN,
        }
    }

    /// The decree this message belongs to.
    #[must_use]
    pub fn at(&self) -> &Position {
        match self {
            Message::Acceptor(wire) => wire.at(),
            Message::Proposer(wire) => wire.at(),
        }
    }

    /// Frame the message as `descriptor (LE u64) ++ postcard body`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the body fails to serialize.
    pub fn encode(&self) -> Result<Bytes, Report<CodecError>> {
        fn body<T: Serialize>(tag: u64, fields: &T) -> Result<Bytes, Report<CodecError>> {
            let buf = postcard::to_extend(fields, tag.to_le_bytes().to_vec())
                .change_context(CodecError)?;
            Ok(Bytes::from(buf))
        }

        match self {
            Message::Acceptor(AcceptorWire::Query {
                at,
                ballot,
                default,
            }) => body(Message::QUERY, &(at, ballot, default)),
            Message::Acceptor(AcceptorWire::Propose { at, ballot, value }) => {
                body(Message::PROPOSE, &(at, ballot, value))
            }
            Message::Acceptor(AcceptorWire::Choose { at, value }) => {
                body(Message::CHOOSE, &(at, value))
            }
            Message::Proposer(ProposerWire::Refuse { at, ballot }) => {
                body(Message::REFUSE, &(at, ballot))
            }
            Message::Proposer(ProposerWire::Promise {
                at,
                ballot,
                proposal,
            }) => body(Message::PROMISE, &(at, ballot, proposal)),
            Message::Proposer(ProposerWire::Accept { at, ballot }) => {
                body(Message::ACCEPT, &(at, ballot))
            }
            Message::Proposer(ProposerWire::Chosen { at, value }) => {
                body(Message::CHOSEN, &(at, value))
            }
        }
    }

    /// Parse a framed message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short frame, an unknown descriptor, or a
    /// malformed body.
    pub fn decode(frame: &[u8]) -> Result<Message, Report<CodecError>> {
        fn body<T: DeserializeOwned>(frame: &[u8]) -> Result<T, Report<CodecError>> {
            postcard::from_bytes(frame).change_context(CodecError)
        }

        let (tag, rest) = frame.split_at_checked(8).ok_or(CodecError)?;
        let tag: Result<[u8; 8], _> = tag.try_into();
        let tag = u64::from_le_bytes(tag.change_context(CodecError)?);

        let message = match tag {
            Message::QUERY => {
                let (at, ballot, default) = body(rest)?;
                Message::Acceptor(AcceptorWire::Query {
                    at,
                    ballot,
                    default,
                })
            }
            Message::PROPOSE => {
                let (at, ballot, value) = body(rest)?;
                Message::Acceptor(AcceptorWire::Propose { at, ballot, value })
            }
            Message::CHOOSE => {
                let (at, value) = body(rest)?;
                Message::Acceptor(AcceptorWire::Choose { at, value })
            }
            Message::REFUSE => {
                let (at, ballot) = body(rest)?;
                Message::Proposer(ProposerWire::Refuse { at, ballot })
            }
            Message::PROMISE => {
                let (at, ballot, proposal) = body(rest)?;
                Message::Proposer(ProposerWire::Promise {
                    at,
                    ballot,
                    proposal,
                })
            }
            Message::ACCEPT => {
                let (at, ballot) = body(rest)?;
                Message::Proposer(ProposerWire::Accept { at, ballot })
            }
            Message::CHOSEN => {
                let (at, value) = body(rest)?;
                Message::Proposer(ProposerWire::Chosen { at, value })
            }
            _ => {
                return Err(Report::new(CodecError)
                    .attach_printable(format!("unknown message descriptor {tag:#x}")));
            }
        };
        Ok(message)
    }
}
