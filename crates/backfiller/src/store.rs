use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{
	atom::{Atom, PreAtom},
	error::{LineageError, StoreError},
	key::{KeyRange, Region},
	version::VersionMap,
};

/// Read side of the store being backfilled from.
///
/// The store keeps applying writes while it is read, but its region never changes while a
/// backfiller exists. Streams must yield keys in ascending order and be safe to run concurrently
/// for different clients.
pub trait StoreView: Send + Sync + 'static {
	fn region(&self) -> Region;

	/// Pre-atoms for every key in `range` changed after the version `since` records for it.
	fn pre_atoms(
		&self,
		range: KeyRange,
		since: VersionMap,
	) -> BoxStream<'static, Result<PreAtom, StoreError>>;

	/// Atoms for every key in `range` changed after `since`, plus one for every key named by
	/// `requested`, whether or not the store changed it. Keys the store does not hold come back as
	/// deletions.
	fn atoms(
		&self,
		range: KeyRange,
		since: VersionMap,
		requested: Vec<PreAtom>,
	) -> BoxStream<'static, Result<Atom, StoreError>>;
}

/// Reconciles branch lineage between a backfillee and the local store.
#[async_trait]
pub trait VersionLineage: Send + Sync + 'static {
	/// Per sub-range, the latest version both sides are known to share. Must cover `region`.
	async fn common_version(
		&self,
		region: &Region,
		backfillee_version: &VersionMap,
	) -> Result<VersionMap, LineageError>;
}
