use std::collections::BTreeMap;

use tracing::trace;

use super::{error::Error, source::WriteToken};

/// Reorder buffer keyed by the next expected [`WriteToken`].
///
/// A sink is owned by exactly one consumer, the one applying messages to its state, so it needs no
/// interior synchronization.
///
/// Only tokens within `window` positions of the next expected one are accepted, which bounds how
/// many messages a gap that never closes can pile up.
#[derive(Debug)]
pub struct FifoSink<T> {
	next_expected: WriteToken,
	window: u64,
	held: BTreeMap<WriteToken, T>,
}

impl<T> Default for FifoSink<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> FifoSink<T> {
	/// A sink holding any number of early messages.
	#[must_use]
	pub const fn new() -> Self {
		Self::with_window(u64::MAX)
	}

	/// A sink accepting tokens in `[next_expected, next_expected + window)`. A zero window is
	/// treated as one, the expected token itself is always accepted.
	#[must_use]
	pub const fn with_window(window: u64) -> Self {
		Self {
			next_expected: WriteToken::new(0),
			window: if window == 0 { 1 } else { window },
			held: BTreeMap::new(),
		}
	}

	/// Accept a delivery and return every message that is now in order, starting with the one
	/// just pushed if it was the expected one.
	///
	/// Messages not drained from the returned iterator stay held and come out on the next push.
	pub fn push(&mut self, token: WriteToken, item: T) -> Result<Released<'_, T>, Error> {
		if token < self.next_expected {
			return Err(Error::Stale {
				token,
				next_expected: self.next_expected,
			});
		}

		if token.sequence() - self.next_expected.sequence() >= self.window {
			return Err(Error::TooFarAhead {
				token,
				next_expected: self.next_expected,
				window: self.window,
			});
		}

		if self.held.contains_key(&token) {
			return Err(Error::Duplicate(token));
		}

		if token > self.next_expected {
			trace!(
				%token,
				next_expected = %self.next_expected,
				held = self.held.len() + 1,
				"Holding out of order message"
			);
		}

		self.held.insert(token, item);

		Ok(Released { sink: self })
	}

	#[must_use]
	pub const fn next_expected(&self) -> WriteToken {
		self.next_expected
	}

	/// How many messages are waiting for an earlier token to arrive.
	#[must_use]
	pub fn held_count(&self) -> usize {
		self.held.len()
	}

	fn pop_ready(&mut self) -> Option<T> {
		let item = self.held.remove(&self.next_expected)?;
		self.next_expected = self.next_expected.next();
		Some(item)
	}
}

/// Messages released by a [`FifoSink::push`], in token order.
#[must_use = "released messages must be applied, dropping this iterator only delays them"]
#[derive(Debug)]
pub struct Released<'sink, T> {
	sink: &'sink mut FifoSink<T>,
}

impl<T> Iterator for Released<'_, T> {
	type Item = T;

	fn next(&mut self) -> Option<Self::Item> {
		self.sink.pop_ready()
	}
}
