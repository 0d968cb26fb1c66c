#![allow(dead_code)]

use rb_backfiller::{
	Atom, Backfiller, BackfilleeMessage, BackfillerConfig, ClientAddress, Intro, Key, KeyRange,
	LineageError, PreAtom, Region, SessionId, StoreError, StoreView, VersionLineage, VersionMap,
	VersionStamp,
};

use std::{
	collections::{hash_map::DefaultHasher, BTreeMap, BTreeSet},
	future::Future,
	hash::{Hash, Hasher},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

pub const VALUE_LEN: usize = 16;

/// Size of an atom for an integer key holding a [`VALUE_LEN`] bytes value.
pub const ATOM_SIZE: u64 = 8 + VALUE_LEN as u64 + rb_backfiller::ATOM_OVERHEAD_BYTES;

pub fn r(left: u64, right: u64) -> KeyRange {
	KeyRange::half_open(left, right)
}

pub fn k(key: u64) -> Key {
	Key::from(key)
}

pub fn digest(value: &[u8]) -> u64 {
	let mut hasher = DefaultHasher::new();
	value.hash(&mut hasher);
	hasher.finish()
}

pub fn pre_atom(key: u64, version: u64) -> PreAtom {
	PreAtom {
		key: k(key),
		version: VersionStamp::new(version),
		digest: 0,
	}
}

#[derive(Debug, Default)]
struct Failures {
	pre_atoms: AtomicBool,
	atoms: AtomicBool,
	descending: AtomicBool,
}

/// In memory store, every key written at its own version.
#[derive(Debug)]
pub struct MemoryStore {
	region: Region,
	entries: Mutex<BTreeMap<Key, (VersionStamp, Vec<u8>)>>,
	failures: Failures,
}

impl MemoryStore {
	pub fn new(region: KeyRange) -> Self {
		Self {
			region: Region::new(region),
			entries: Mutex::default(),
			failures: Failures::default(),
		}
	}

	/// `keys` written at version 1 with [`VALUE_LEN`] bytes values.
	pub fn with_keys(region: KeyRange, keys: impl IntoIterator<Item = u64>) -> Self {
		let store = Self::new(region);
		for key in keys {
			store.write(key, 1, vec![key as u8; VALUE_LEN]);
		}
		store
	}

	pub fn write(&self, key: u64, version: u64, value: Vec<u8>) {
		self.entries
			.lock()
			.unwrap()
			.insert(k(key), (VersionStamp::new(version), value));
	}

	pub fn fail_pre_atoms(&self) {
		self.failures.pre_atoms.store(true, Ordering::Release);
	}

	pub fn fail_atoms(&self) {
		self.failures.atoms.store(true, Ordering::Release);
	}

	pub fn yield_descending(&self) {
		self.failures.descending.store(true, Ordering::Release);
	}

	fn changed_since(
		&self,
		range: &KeyRange,
		since: &VersionMap,
	) -> Vec<(Key, VersionStamp, Vec<u8>)> {
		self.entries
			.lock()
			.unwrap()
			.iter()
			.filter(|(key, (version, _))| {
				range.contains_key(key)
					&& *version > since.lookup(key).unwrap_or(VersionStamp::ZERO)
			})
			.map(|(key, (version, value))| (key.clone(), *version, value.clone()))
			.collect()
	}
}

impl StoreView for MemoryStore {
	fn region(&self) -> Region {
		self.region.clone()
	}

	fn pre_atoms(
		&self,
		range: KeyRange,
		since: VersionMap,
	) -> BoxStream<'static, Result<PreAtom, StoreError>> {
		if self.failures.pre_atoms.load(Ordering::Acquire) {
			return stream::iter([Err(StoreError::new("pre-atoms index unavailable"))]).boxed();
		}

		let pre_atoms = self
			.changed_since(&range, &since)
			.into_iter()
			.map(|(key, version, value)| {
				Ok(PreAtom {
					key,
					version,
					digest: digest(&value),
				})
			})
			.collect::<Vec<_>>();

		stream::iter(pre_atoms).boxed()
	}

	fn atoms(
		&self,
		range: KeyRange,
		since: VersionMap,
		requested: Vec<PreAtom>,
	) -> BoxStream<'static, Result<Atom, StoreError>> {
		if self.failures.atoms.load(Ordering::Acquire) {
			return stream::iter([Err(StoreError::new("disk on fire"))]).boxed();
		}

		let keys = self
			.changed_since(&range, &since)
			.into_iter()
			.map(|(key, _, _)| key)
			.chain(requested.into_iter().map(|pre_atom| pre_atom.key))
			.filter(|key| range.contains_key(key))
			.collect::<BTreeSet<_>>();

		let entries = self.entries.lock().unwrap();
		let mut atoms = keys
			.into_iter()
			.map(|key| {
				let (version, value) = entries
					.get(&key)
					.map_or((VersionStamp::ZERO, None), |(version, value)| {
						(*version, Some(value.clone()))
					});
				Ok(Atom {
					key,
					version,
					value,
				})
			})
			.collect::<Vec<_>>();

		if self.failures.descending.load(Ordering::Acquire) {
			atoms.reverse();
		}

		stream::iter(atoms).boxed()
	}
}

/// Lineage answering with a fixed common version.
#[derive(Debug)]
pub enum FixedLineage {
	/// Both sides share `stamp` over whatever region is asked.
	Shared(VersionStamp),
	Exactly(VersionMap),
	Failing,
}

#[async_trait]
impl VersionLineage for FixedLineage {
	async fn common_version(
		&self,
		region: &Region,
		_backfillee_version: &VersionMap,
	) -> Result<VersionMap, LineageError> {
		match self {
			Self::Shared(stamp) => Ok(VersionMap::uniform(region.range().clone(), *stamp)),
			Self::Exactly(map) => Ok(map.clone()),
			Self::Failing => Err(LineageError::new("branch history unreachable")),
		}
	}
}

pub struct Backfillee {
	pub address: ClientAddress,
	pub inbox: chan::Receiver<BackfilleeMessage>,
}

impl Backfillee {
	pub async fn register(backfiller: &Backfiller, region: KeyRange) -> Self {
		let (outbox, inbox) = chan::unbounded();

		let address = backfiller
			.register(Intro {
				region: Region::new(region),
				version: VersionMap::default(),
				outbox,
			})
			.await
			.unwrap();

		Self { address, inbox }
	}

	pub async fn recv(&self) -> BackfilleeMessage {
		timeout(Duration::from_secs(5), self.inbox.recv())
			.await
			.expect("timed out waiting for a message from the client")
			.expect("client closed the outbox")
	}

	/// Request pre-atoms for `range` and wait for the client's answer.
	pub async fn request_pre_atoms(&self, range: KeyRange, hints: Vec<PreAtom>) -> Vec<PreAtom> {
		self.address.pre_atoms(range.clone(), hints).await.unwrap();

		match self.recv().await {
			BackfilleeMessage::PreAtoms {
				range: answered,
				pre_atoms,
			} => {
				assert_eq!(answered, range);
				pre_atoms
			}
			other => panic!("expected pre-atoms, got {other:?}"),
		}
	}

	/// Wait for the next atoms batch of `session_id`, returning its range and atoms.
	pub async fn recv_atoms(&self, session_id: SessionId) -> (KeyRange, Vec<Atom>) {
		match self.recv().await {
			BackfilleeMessage::Atoms {
				session_id: got,
				range,
				atoms,
			} => {
				assert_eq!(got, session_id);
				(range, atoms)
			}
			other => panic!("expected atoms, got {other:?}"),
		}
	}

	/// Receive batches of `session_id` until one ends at `right`.
	pub async fn recv_session(&self, session_id: SessionId, range: &KeyRange) -> Vec<Atom> {
		let mut atoms = vec![];
		let mut cursor = range.left.clone();

		loop {
			let (batch_range, batch) = self.recv_atoms(session_id).await;
			assert_eq!(batch_range.left, cursor, "batches must be contiguous");
			atoms.extend(batch);

			if batch_range.right == range.right {
				return atoms;
			}

			let rb_backfiller::RightBound::Key(next) = batch_range.right else {
				panic!("unbounded batch before the end of the session");
			};
			cursor = next;
		}
	}
}

/// Backfiller whose backfillees share nothing with the store, every stored key gets streamed.
pub fn new_backfiller(
	store: MemoryStore,
	config: BackfillerConfig,
) -> (Backfiller, Arc<MemoryStore>) {
	new_backfiller_sharing(store, VersionStamp::ZERO, config)
}

pub fn new_backfiller_sharing(
	store: MemoryStore,
	common: VersionStamp,
	config: BackfillerConfig,
) -> (Backfiller, Arc<MemoryStore>) {
	let store = Arc::new(store);

	let backfiller = Backfiller::new(
		Arc::clone(&store),
		Arc::new(FixedLineage::Shared(common)),
		config,
	)
	.unwrap();

	(backfiller, store)
}

pub fn session() -> SessionId {
	Uuid::new_v4()
}

pub fn keys(atoms: &[Atom]) -> Vec<Key> {
	atoms.iter().map(|atom| atom.key.clone()).collect()
}

pub fn total_size(atoms: &[Atom]) -> u64 {
	atoms.iter().map(Atom::mem_size).sum()
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..500 {
		if check().await {
			return;
		}
		sleep(Duration::from_millis(10)).await;
	}

	panic!("condition never held");
}
