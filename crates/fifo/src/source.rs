use std::{
	fmt,
	sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Position of a message in the stream it was issued on.
///
/// Tokens are only comparable between messages stamped by the same [`FifoSource`].
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WriteToken(u64);

impl WriteToken {
	#[must_use]
	pub const fn new(sequence: u64) -> Self {
		Self(sequence)
	}

	#[must_use]
	pub const fn sequence(self) -> u64 {
		self.0
	}

	#[must_use]
	pub(crate) const fn next(self) -> Self {
		Self(self.0 + 1)
	}
}

impl fmt::Display for WriteToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Issues monotonically increasing [`WriteToken`]s, starting at zero.
///
/// Shared by every sender of one logical stream, so it can be cloned behind an `Arc` and stamped
/// from any task.
#[derive(Debug, Default)]
pub struct FifoSource {
	next: AtomicU64,
}

impl FifoSource {
	#[must_use]
	pub const fn new() -> Self {
		Self {
			next: AtomicU64::new(0),
		}
	}

	/// Reserve the next position in the stream. The message carrying this token must eventually
	/// be delivered, otherwise every later message stays held by the sink.
	pub fn enter_write(&self) -> WriteToken {
		WriteToken(self.next.fetch_add(1, Ordering::AcqRel))
	}

	/// Token that the next call to [`FifoSource::enter_write`] will hand out.
	#[must_use]
	pub fn peek(&self) -> WriteToken {
		WriteToken(self.next.load(Ordering::Acquire))
	}
}
