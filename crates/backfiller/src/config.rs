use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

pub const DEFAULT_ATOM_THROTTLE_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 64 * 1024;
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;
pub const DEFAULT_REORDER_WINDOW: u64 = 1024;

const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Knobs of a [`Backfiller`](crate::Backfiller), shared by every client it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillerConfig {
	/// Unacknowledged atom bytes a single session may have in flight.
	pub atom_throttle_bytes: u64,
	/// Atoms are grouped into batches of at most this many bytes, an oversize atom travels alone.
	pub max_batch_bytes: u64,
	/// Bound of every mailbox between a backfillee and its client.
	pub mailbox_capacity: usize,
	/// How far past a missing write token a message may arrive before it is rejected.
	pub reorder_window: u64,
	/// How long shutdown waits for a client to wind down before aborting it.
	pub teardown_timeout: Duration,
}

impl Default for BackfillerConfig {
	fn default() -> Self {
		Self {
			atom_throttle_bytes: DEFAULT_ATOM_THROTTLE_BYTES,
			max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
			mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
			reorder_window: DEFAULT_REORDER_WINDOW,
			teardown_timeout: ONE_MINUTE,
		}
	}
}

impl BackfillerConfig {
	/// Decode from JSON, missing knobs take their defaults.
	pub fn from_json(json: &str) -> Result<Self, ConfigError> {
		let config: Self = serde_json::from_str(json)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.atom_throttle_bytes == 0 {
			return Err(ConfigError::Zero {
				knob: "atom_throttle_bytes",
			});
		}
		if self.max_batch_bytes == 0 {
			return Err(ConfigError::Zero {
				knob: "max_batch_bytes",
			});
		}
		if self.mailbox_capacity == 0 {
			return Err(ConfigError::Zero {
				knob: "mailbox_capacity",
			});
		}
		if self.reorder_window == 0 {
			return Err(ConfigError::Zero {
				knob: "reorder_window",
			});
		}
		if self.max_batch_bytes > self.atom_throttle_bytes {
			return Err(ConfigError::BatchLargerThanThrottle {
				batch: self.max_batch_bytes,
				throttle: self.atom_throttle_bytes,
			});
		}

		Ok(())
	}
}
