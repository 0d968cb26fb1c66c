use serde::{Deserialize, Serialize};

use super::{key::Key, version::VersionStamp};

/// Bookkeeping bytes charged per atom on top of its key and value.
pub const ATOM_OVERHEAD_BYTES: u64 = 32;

/// Metadata only descriptor of one key's change, used for diffing before any payload moves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreAtom {
	pub key: Key,
	pub version: VersionStamp,
	pub digest: u64,
}

/// A full change record. A `None` value is a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
	pub key: Key,
	pub version: VersionStamp,
	pub value: Option<Vec<u8>>,
}

impl Atom {
	/// Size in throttle units, also the unit backfillees acknowledge in.
	#[must_use]
	pub fn mem_size(&self) -> u64 {
		let key = self.key.len() as u64;
		let value = self.value.as_ref().map_or(0, |value| value.len() as u64);

		key + value + ATOM_OVERHEAD_BYTES
	}
}
