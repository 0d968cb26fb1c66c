use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

/// A store key, ordered lexicographically by its bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Vec<u8>);

impl Key {
	#[must_use]
	pub const fn empty() -> Self {
		Self(Vec::new())
	}

	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl From<Vec<u8>> for Key {
	fn from(bytes: Vec<u8>) -> Self {
		Self(bytes)
	}
}

impl From<&[u8]> for Key {
	fn from(bytes: &[u8]) -> Self {
		Self(bytes.to_vec())
	}
}

impl From<&str> for Key {
	fn from(s: &str) -> Self {
		Self(s.as_bytes().to_vec())
	}
}

/// Big endian, so integer keys keep their numeric order.
impl From<u64> for Key {
	fn from(n: u64) -> Self {
		Self(n.to_be_bytes().to_vec())
	}
}

impl fmt::Debug for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Key({self})")
	}
}

/// Printable text is quoted, other 8 byte keys are read back as the integer they encode and
/// anything else is hex.
impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match std::str::from_utf8(&self.0) {
			Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s:?}"),
			_ => {
				if let Ok(be) = <[u8; 8]>::try_from(self.0.as_slice()) {
					return write!(f, "#{}", u64::from_be_bytes(be));
				}

				for byte in &self.0 {
					write!(f, "{byte:02x}")?;
				}
				Ok(())
			}
		}
	}
}

/// Exclusive right end of a [`KeyRange`].
///
/// Variant order matters: every `Key` bound sorts before `Unbounded`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RightBound {
	Key(Key),
	Unbounded,
}

impl RightBound {
	/// Whether `key` lies strictly before this bound.
	#[must_use]
	pub fn is_after(&self, key: &Key) -> bool {
		match self {
			Self::Key(bound) => key < bound,
			Self::Unbounded => true,
		}
	}

	fn cmp_key(&self, key: &Key) -> Ordering {
		match self {
			Self::Key(bound) => bound.cmp(key),
			Self::Unbounded => Ordering::Greater,
		}
	}
}

impl fmt::Display for RightBound {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Key(key) => write!(f, "{key}"),
			Self::Unbounded => write!(f, "+inf"),
		}
	}
}

/// Half open key range `[left, right)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
	pub left: Key,
	pub right: RightBound,
}

impl KeyRange {
	#[must_use]
	pub const fn new(left: Key, right: RightBound) -> Self {
		Self { left, right }
	}

	#[must_use]
	pub fn half_open(left: impl Into<Key>, right: impl Into<Key>) -> Self {
		Self {
			left: left.into(),
			right: RightBound::Key(right.into()),
		}
	}

	#[must_use]
	pub fn starting_at(left: impl Into<Key>) -> Self {
		Self {
			left: left.into(),
			right: RightBound::Unbounded,
		}
	}

	/// Every possible key.
	#[must_use]
	pub const fn universe() -> Self {
		Self {
			left: Key::empty(),
			right: RightBound::Unbounded,
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.right.cmp_key(&self.left) != Ordering::Greater
	}

	#[must_use]
	pub fn contains_key(&self, key: &Key) -> bool {
		&self.left <= key && self.right.is_after(key)
	}

	/// An empty range is a subset of anything.
	#[must_use]
	pub fn is_superset(&self, other: &Self) -> bool {
		other.is_empty() || (self.left <= other.left && other.right <= self.right)
	}

	#[must_use]
	pub fn intersection(&self, other: &Self) -> Self {
		Self {
			left: (&self.left).max(&other.left).clone(),
			right: (&self.right).min(&other.right).clone(),
		}
	}

	#[must_use]
	pub fn overlaps(&self, other: &Self) -> bool {
		!self.intersection(other).is_empty()
	}

	/// Overlapping or sharing a boundary, so their union is a single range.
	#[must_use]
	pub fn touches(&self, other: &Self) -> bool {
		if self.is_empty() || other.is_empty() {
			return false;
		}

		let left = (&self.left).max(&other.left);
		let right = (&self.right).min(&other.right);

		right.cmp_key(left) != Ordering::Less
	}

	/// Union of two touching ranges, `None` if a gap would be covered.
	#[must_use]
	pub fn union(&self, other: &Self) -> Option<Self> {
		if other.is_empty() {
			return Some(self.clone());
		}
		if self.is_empty() {
			return Some(other.clone());
		}

		self.touches(other).then(|| Self {
			left: (&self.left).min(&other.left).clone(),
			right: (&self.right).max(&other.right).clone(),
		})
	}

	/// What is left of `self` once `other` is taken out, at most two pieces.
	#[must_use]
	pub fn subtract(&self, other: &Self) -> Vec<Self> {
		if !self.overlaps(other) {
			return if self.is_empty() {
				vec![]
			} else {
				vec![self.clone()]
			};
		}

		let mut pieces = Vec::with_capacity(2);

		let before = Self {
			left: self.left.clone(),
			right: RightBound::Key(other.left.clone()),
		};
		if !before.is_empty() {
			pieces.push(before);
		}

		if let RightBound::Key(other_right) = &other.right {
			let after = Self {
				left: other_right.clone(),
				right: self.right.clone(),
			};
			if !after.is_empty() {
				pieces.push(after);
			}
		}

		pieces
	}
}

impl fmt::Display for KeyRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[{}, {})", self.left, self.right)
	}
}

/// Whether `ranges`, sorted by left key and pairwise disjoint, together cover every key of
/// `range`. Touching ranges chain into each other.
pub(crate) fn ranges_cover<'a>(
	ranges: impl IntoIterator<Item = &'a KeyRange>,
	range: &KeyRange,
) -> bool {
	if range.is_empty() {
		return true;
	}

	let mut cursor = range.left.clone();

	for candidate in ranges {
		if !candidate.contains_key(&cursor) {
			if candidate.left > cursor {
				return false;
			}
			continue;
		}

		match &candidate.right {
			bound if *bound >= range.right => return true,
			RightBound::Key(next) => cursor = next.clone(),
			RightBound::Unbounded => return true,
		}
	}

	false
}

/// The portion of the keyspace a store is responsible for. Fixed for the lifetime of a
/// [`Backfiller`](crate::Backfiller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(KeyRange);

impl Region {
	#[must_use]
	pub const fn new(range: KeyRange) -> Self {
		Self(range)
	}

	#[must_use]
	pub const fn range(&self) -> &KeyRange {
		&self.0
	}

	#[must_use]
	pub fn contains_range(&self, range: &KeyRange) -> bool {
		self.0.is_superset(range)
	}

	#[must_use]
	pub fn contains_region(&self, other: &Self) -> bool {
		self.0.is_superset(&other.0)
	}
}

impl From<KeyRange> for Region {
	fn from(range: KeyRange) -> Self {
		Self(range)
	}
}

impl fmt::Display for Region {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}
