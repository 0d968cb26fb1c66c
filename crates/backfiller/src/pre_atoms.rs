use std::collections::BTreeMap;

use super::{
	atom::PreAtom,
	error::ProtocolError,
	key::{ranges_cover, Key, KeyRange, RightBound},
};

/// Pre-atoms a client holds for its backfillee, with the ranges they were requested for.
///
/// Request ranges stay disjoint and only grow or get replaced, acknowledgments never shrink them.
/// Pre-atoms handed to a session leave the queue and come back through [`PreAtomQueue::requeue`]
/// if the session ends before they were acknowledged.
#[derive(Debug, Default)]
pub(crate) struct PreAtomQueue {
	requests: Vec<KeyRange>,
	queued: BTreeMap<Key, PreAtom>,
}

impl PreAtomQueue {
	/// Queue the pre-atoms of a request over `range`. Every pre-atom key must lie in `range`.
	///
	/// A request identical to a pending one replaces its queued pre-atoms. A request that
	/// partially overlaps pending ones still goes through, the overlapped part of the older
	/// requests and their queued pre-atoms are dropped, but the overlap is reported back.
	pub(crate) fn enqueue(
		&mut self,
		range: KeyRange,
		pre_atoms: impl IntoIterator<Item = PreAtom>,
	) -> Option<ProtocolError> {
		let mut overlap = None;

		if !self.requests.contains(&range) {
			if let Some(pending) = self.requests.iter().find(|pending| pending.overlaps(&range)) {
				overlap = Some(ProtocolError::OverlappingPreAtoms {
					pending: pending.clone(),
					requested: range.clone(),
				});
			}

			self.requests = self
				.requests
				.iter()
				.flat_map(|pending| pending.subtract(&range))
				.chain([range.clone()])
				.collect();
			self.requests.sort_by(|a, b| a.left.cmp(&b.left));
		}

		drop(self.take(&range));

		self.queued.extend(
			pre_atoms
				.into_iter()
				.map(|pre_atom| (pre_atom.key.clone(), pre_atom)),
		);

		overlap
	}

	/// Whether pre-atoms were requested for every key of `range`.
	pub(crate) fn covers(&self, range: &KeyRange) -> bool {
		!range.is_empty() && ranges_cover(&self.requests, range)
	}

	/// Remove and return the queued pre-atoms inside `range`.
	pub(crate) fn take(&mut self, range: &KeyRange) -> BTreeMap<Key, PreAtom> {
		let mut taken = self.queued.split_off(&range.left);

		if let RightBound::Key(right) = &range.right {
			let mut after = taken.split_off(right);
			self.queued.append(&mut after);
		}

		taken
	}

	/// Put back pre-atoms a session did not get acknowledged. Hints queued since then for the
	/// same keys take precedence.
	pub(crate) fn requeue(&mut self, pre_atoms: BTreeMap<Key, PreAtom>) {
		for (key, pre_atom) in pre_atoms {
			self.queued.entry(key).or_insert(pre_atom);
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.queued.len()
	}

	pub(crate) fn requests(&self) -> &[KeyRange] {
		&self.requests
	}
}
