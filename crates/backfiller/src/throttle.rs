use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use tokio::sync::watch;
use tracing::trace;

use super::error::ThrottleError;

/// Bytes reserved by every throttle sharing this gauge, for observability.
#[derive(Debug, Clone, Default)]
pub struct ReservationGauge(Arc<AtomicU64>);

impl ReservationGauge {
	#[must_use]
	pub fn get(&self) -> u64 {
		self.0.load(Ordering::Acquire)
	}

	fn add(&self, bytes: u64) {
		self.0.fetch_add(bytes, Ordering::AcqRel);
	}

	fn sub(&self, bytes: u64) {
		self.0.fetch_sub(bytes, Ordering::AcqRel);
	}
}

/// Admission control over unacknowledged atom bytes of one session.
///
/// Acquisition succeeds while the bytes in flight stay within capacity. A single acquisition
/// larger than the whole capacity is admitted once nothing else is in flight, otherwise an
/// oversize atom could never be sent.
#[derive(Debug)]
pub struct Throttle {
	capacity: u64,
	in_flight: watch::Sender<u64>,
	gauge: ReservationGauge,
}

impl Throttle {
	#[must_use]
	pub fn new(capacity: u64, gauge: ReservationGauge) -> Self {
		let (in_flight, _) = watch::channel(0);

		Self {
			capacity,
			in_flight,
			gauge,
		}
	}

	#[must_use]
	pub const fn capacity(&self) -> u64 {
		self.capacity
	}

	#[must_use]
	pub fn in_flight(&self) -> u64 {
		*self.in_flight.borrow()
	}

	const fn admits(capacity: u64, held: u64, bytes: u64) -> bool {
		held == 0 || held.saturating_add(bytes) <= capacity
	}

	/// Reserve `bytes` without waiting, `false` if the throttle is saturated.
	pub fn try_acquire(&self, bytes: u64) -> bool {
		let capacity = self.capacity;

		let acquired = self.in_flight.send_if_modified(|held| {
			if Self::admits(capacity, *held, bytes) {
				*held += bytes;
				bytes > 0
			} else {
				false
			}
		}) || bytes == 0;

		if acquired {
			self.gauge.add(bytes);
		}

		acquired
	}

	/// Reserve `bytes`, suspending until enough acknowledgments arrived.
	pub async fn acquire(&self, bytes: u64) {
		let mut changes = self.in_flight.subscribe();

		while !self.try_acquire(bytes) {
			trace!(
				bytes,
				in_flight = self.in_flight(),
				capacity = self.capacity,
				"Throttle saturated, waiting for acknowledgments"
			);

			// The sender lives in `self`, so this can't fail while we're borrowed
			changes.changed().await.ok();
		}
	}

	/// Give back `bytes` acknowledged by the backfillee. Releasing more than is held is refused
	/// and releases nothing.
	pub fn release(&self, bytes: u64) -> Result<(), ThrottleError> {
		let mut outcome = Ok(());

		self.in_flight.send_if_modified(|held| {
			if bytes > *held {
				outcome = Err(ThrottleError::ReleaseExceedsHeld {
					requested: bytes,
					held: *held,
				});
				false
			} else {
				*held -= bytes;
				bytes > 0
			}
		});

		if outcome.is_ok() {
			self.gauge.sub(bytes);
		}

		outcome
	}

	/// Drop every reservation, returns how many bytes were still held.
	pub fn release_all(&self) -> u64 {
		let mut released = 0;

		self.in_flight.send_if_modified(|held| {
			released = std::mem::take(held);
			released > 0
		});

		self.gauge.sub(released);

		released
	}

	/// Suspend until every reserved byte has been acknowledged.
	pub async fn drained(&self) {
		let mut changes = self.in_flight.subscribe();

		// Same as in `acquire`, the sender outlives this borrow
		changes.wait_for(|held| *held == 0).await.ok();
	}
}

impl Drop for Throttle {
	fn drop(&mut self) {
		self.release_all();
	}
}
