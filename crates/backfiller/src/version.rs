use std::fmt;

use serde::{Deserialize, Serialize};

use super::{
	error::VersionMapError,
	key::{ranges_cover, Key, KeyRange},
};

/// A point in the write history of a region. Totally ordered, not related to wall clock time.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionStamp(u64);

impl VersionStamp {
	/// Before any write, nothing can be shared below this.
	pub const ZERO: Self = Self(0);

	#[must_use]
	pub const fn new(stamp: u64) -> Self {
		Self(stamp)
	}

	#[must_use]
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for VersionStamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "v{}", self.0)
	}
}

/// Version per disjoint sub-range.
///
/// Entries are kept sorted by their left key and never overlap; the map only answers for the keys
/// its entries cover.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionMap {
	entries: Vec<(KeyRange, VersionStamp)>,
}

impl VersionMap {
	#[must_use]
	pub fn uniform(range: KeyRange, version: VersionStamp) -> Self {
		Self {
			entries: if range.is_empty() {
				vec![]
			} else {
				vec![(range, version)]
			},
		}
	}

	pub fn from_entries(
		entries: impl IntoIterator<Item = (KeyRange, VersionStamp)>,
	) -> Result<Self, VersionMapError> {
		let mut entries = entries
			.into_iter()
			.filter(|(range, _)| !range.is_empty())
			.collect::<Vec<_>>();

		entries.sort_by(|(a, _), (b, _)| a.left.cmp(&b.left));

		for pair in entries.windows(2) {
			let (first, _) = &pair[0];
			let (second, _) = &pair[1];
			if first.overlaps(second) {
				return Err(VersionMapError::Overlapping {
					first: first.clone(),
					second: second.clone(),
				});
			}
		}

		Ok(Self { entries })
	}

	pub fn iter(&self) -> impl Iterator<Item = &(KeyRange, VersionStamp)> {
		self.entries.iter()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	#[must_use]
	pub fn lookup(&self, key: &Key) -> Option<VersionStamp> {
		self.entries
			.iter()
			.find(|(range, _)| range.contains_key(key))
			.map(|(_, version)| *version)
	}

	/// Restrict the map to `range`, clipping entries on its edges.
	#[must_use]
	pub fn mask(&self, range: &KeyRange) -> Self {
		Self {
			entries: self
				.entries
				.iter()
				.map(|(entry, version)| (entry.intersection(range), *version))
				.filter(|(entry, _)| !entry.is_empty())
				.collect(),
		}
	}

	/// Whether every key of `range` has a version in this map.
	#[must_use]
	pub fn covers(&self, range: &KeyRange) -> bool {
		ranges_cover(self.entries.iter().map(|(entry, _)| entry), range)
	}
}
