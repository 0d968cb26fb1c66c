use rb_fifo::FifoError;

use std::error::Error as StdError;

use thiserror::Error;

use super::{
	key::{Key, KeyRange, Region},
	SessionId,
};

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionMapError {
	#[error("version map entries overlap: {first} and {second}")]
	Overlapping { first: KeyRange, second: KeyRange },
}

/// Failure reported by the store's read interface.
#[derive(Debug, Error)]
#[error("store read failed: {message}")]
pub struct StoreError {
	pub message: String,
	#[source]
	pub source: Option<BoxedSource>,
}

impl StoreError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			source: None,
		}
	}

	pub fn with_source(message: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
		Self {
			message: message.into(),
			source: Some(source.into()),
		}
	}
}

/// Failure reported by the version lineage reconciliation.
#[derive(Debug, Error)]
#[error("version lineage reconciliation failed: {message}")]
pub struct LineageError {
	pub message: String,
	#[source]
	pub source: Option<BoxedSource>,
}

impl LineageError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			source: None,
		}
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
	#[error("release of {requested} bytes exceeds the {held} bytes held")]
	ReleaseExceedsHeld { requested: u64, held: u64 },
}

/// A message from a backfillee that breaks the protocol. The offending request is rejected and
/// the client keeps serving the next ones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
	#[error(transparent)]
	WriteToken(#[from] FifoError),
	#[error("empty range")]
	EmptyRange,
	#[error("range {range} lies outside the backfill region {region}")]
	RangeOutsideRegion { range: KeyRange, region: Region },
	#[error("pre-atom for a key outside its request range {range}")]
	PreAtomOutsideRange { range: KeyRange },
	#[error("pre-atoms request {requested} partially overlaps pending request {pending}")]
	OverlappingPreAtoms {
		pending: KeyRange,
		requested: KeyRange,
	},
	#[error("range {range} is not covered by queued pre-atoms")]
	RangeNotQueued { range: KeyRange },
	#[error("session <id='{active}'> is still active")]
	SessionAlreadyActive { active: SessionId },
	#[error("no active session <id='{0}'>")]
	UnknownSession(SessionId),
	#[error("acknowledged range {range} lies outside session range {session_range}")]
	AckOutsideSession {
		range: KeyRange,
		session_range: KeyRange,
	},
	#[error("acknowledged range {range} reaches past the streamed span {streamed}")]
	AckBeyondStreamed { range: KeyRange, streamed: KeyRange },
	#[error("acknowledged {requested} bytes but only {held} are held")]
	AckExceedsReservation { requested: u64, held: u64 },
	#[error("acknowledged {requested} bytes in {range} but only {sent} were sent there")]
	AckExceedsSent {
		range: KeyRange,
		requested: u64,
		sent: u64,
	},
}

impl From<ThrottleError> for ProtocolError {
	fn from(e: ThrottleError) -> Self {
		match e {
			ThrottleError::ReleaseExceedsHeld { requested, held } => {
				Self::AckExceedsReservation { requested, held }
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum RegistrationError {
	#[error("intro region {offered} is not served by this backfiller ({served})")]
	IncompatibleRegion { offered: Region, served: Region },
	#[error("reconciled common version does not cover {region}")]
	IncompleteCommonVersion { region: Region },
	#[error(transparent)]
	Lineage(#[from] LineageError),
	#[error("backfiller is shutting down")]
	BackfillerGone,
}

/// Why a session ended without streaming its whole range.
#[derive(Debug, Error)]
pub(crate) enum SessionError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("store yielded {key} after {previous}, atoms must come in ascending key order")]
	OutOfOrder { key: Key, previous: Key },
	#[error("backfillee outbox closed")]
	OutboxClosed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("mailbox closed, the other side is gone")]
pub struct MailboxClosed;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("{knob} must be greater than zero")]
	Zero { knob: &'static str },
	#[error("max_batch_bytes ({batch}) exceeds atom_throttle_bytes ({throttle})")]
	BatchLargerThanThrottle { batch: u64, throttle: u64 },
	#[error("failed to decode backfiller config: {0}")]
	Decode(#[from] serde_json::Error),
}
