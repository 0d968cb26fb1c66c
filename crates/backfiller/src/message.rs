use rb_fifo::WriteToken;

use serde::{Deserialize, Serialize};

use super::{
	atom::{Atom, PreAtom},
	error::ProtocolError,
	key::KeyRange,
	SessionId,
};

/// A backfillee message stamped with its position in the client's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequenced<T> {
	pub token: WriteToken,
	pub message: T,
}

/// Pre-atom hints for `range`, the keys the backfillee changed on its side. May be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAtomsRequest {
	pub range: KeyRange,
	pub pre_atoms: Vec<PreAtom>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoRequest {
	pub session_id: SessionId,
	pub range: KeyRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
	pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckAtomsRequest {
	pub session_id: SessionId,
	pub range: KeyRange,
	pub size: u64,
}

/// What the client actor applies, once the write token ordering let it through.
#[derive(Debug)]
pub(crate) enum ClientMessage {
	PreAtoms(PreAtomsRequest),
	Go(GoRequest),
	Stop(StopRequest),
	AckAtoms(AckAtomsRequest),
}

impl ClientMessage {
	pub(crate) const fn kind(&self) -> &'static str {
		match self {
			Self::PreAtoms(_) => "pre_atoms",
			Self::Go(_) => "go",
			Self::Stop(_) => "stop",
			Self::AckAtoms(_) => "ack_atoms",
		}
	}
}

/// Everything a client sends back to its backfillee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfilleeMessage {
	/// The backfiller's own changed keys for a pre-atoms request.
	PreAtoms {
		range: KeyRange,
		pre_atoms: Vec<PreAtom>,
	},
	/// The store failed while reading pre-atoms for `range`, the request was not queued.
	PreAtomsFailed { range: KeyRange, reason: String },
	/// One batch of a session's stream. Batches of a session cover contiguous spans, the last
	/// one ends where the session range ends.
	Atoms {
		session_id: SessionId,
		range: KeyRange,
		atoms: Vec<Atom>,
	},
	/// The session ended before covering its range, nothing more will be streamed for it.
	SessionTerminated {
		session_id: SessionId,
		reason: String,
	},
	/// The message carrying `token` was refused, or in the case of an overlapping pre-atoms
	/// request, applied with a warning.
	Rejected {
		token: WriteToken,
		error: ProtocolError,
	},
}
