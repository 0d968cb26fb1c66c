use std::{
	collections::{BTreeMap, VecDeque},
	future::Future,
	mem,
	sync::Arc,
};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::future::Race;
use tokio::{spawn, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, instrument, trace, warn, Instrument};

use super::{
	atom::{Atom, PreAtom},
	error::{ProtocolError, SessionError},
	key::{Key, KeyRange, RightBound},
	message::BackfilleeMessage,
	store::StoreView,
	throttle::Throttle,
	version::VersionMap,
	SessionId,
};

/// How a session's streaming task ended.
#[derive(Debug)]
pub(crate) enum SessionOutcome {
	/// Whole range streamed and every byte acknowledged.
	Completed,
	Canceled,
	Failed(SessionError),
}

/// Sent by a session's task to its client once it stops running.
#[derive(Debug)]
pub(crate) struct SessionEvent {
	pub(crate) generation: u64,
	pub(crate) session_id: SessionId,
	pub(crate) outcome: SessionOutcome,
}

/// A batch handed to the outbox, recorded so acknowledgments can be checked against it.
#[derive(Debug)]
struct SentBatch {
	range: KeyRange,
	/// Bytes of the batch not acknowledged yet.
	unacked: u64,
}

/// Everything a session's task needs, moved into it on start.
pub(crate) struct SessionRun<S> {
	pub(crate) session_id: SessionId,
	pub(crate) generation: u64,
	pub(crate) range: KeyRange,
	pub(crate) since: VersionMap,
	pub(crate) requested: Vec<PreAtom>,
	pub(crate) store: Arc<S>,
	pub(crate) throttle: Arc<Throttle>,
	pub(crate) outbox: chan::Sender<BackfilleeMessage>,
	pub(crate) max_batch_bytes: u64,
}

/// The client's side of an active session: the bookkeeping it owns plus the controls of the
/// streaming task.
#[derive(Debug)]
pub(crate) struct SessionHandle {
	pub(crate) session_id: SessionId,
	pub(crate) generation: u64,
	pub(crate) range: KeyRange,
	consumed: BTreeMap<Key, PreAtom>,
	/// Right end of the span already handed to the outbox, which starts at `range.left`.
	streamed_to: RightBound,
	sent: VecDeque<SentBatch>,
	sent_rx: chan::Receiver<SentBatch>,
	throttle: Arc<Throttle>,
	cancel: CancellationToken,
	maybe_handle: Option<JoinHandle<()>>,
	_cancel_on_drop: DropGuard,
}

impl SessionHandle {
	/// Spawn the streaming task. `consumed` are the queued pre-atoms this session took over.
	pub(crate) fn start<S: StoreView>(
		run: SessionRun<S>,
		consumed: BTreeMap<Key, PreAtom>,
		events_tx: chan::Sender<SessionEvent>,
	) -> Self {
		let cancel = CancellationToken::new();

		let session_id = run.session_id;
		let generation = run.generation;
		let range = run.range.clone();
		let throttle = Arc::clone(&run.throttle);
		let (sent_tx, sent_rx) = chan::unbounded();

		let handle = spawn({
			let cancel = cancel.clone();

			async move {
				let outcome = match run.stream(&cancel, &sent_tx).await {
					Ok(true) => SessionOutcome::Completed,
					Ok(false) => SessionOutcome::Canceled,
					Err(e) => SessionOutcome::Failed(e),
				};

				debug!(?outcome, "Session finished");

				if events_tx
					.send(SessionEvent {
						generation,
						session_id,
						outcome,
					})
					.await
					.is_err()
				{
					trace!("Client is gone, nobody to report the session outcome to");
				}
			}
			.in_current_span()
		});

		Self {
			session_id,
			generation,
			streamed_to: RightBound::Key(range.left.clone()),
			range,
			consumed,
			sent: VecDeque::new(),
			sent_rx,
			throttle,
			_cancel_on_drop: cancel.clone().drop_guard(),
			cancel,
			maybe_handle: Some(handle),
		}
	}

	/// Bytes streamed and not acknowledged yet.
	pub(crate) fn held(&self) -> u64 {
		self.throttle.in_flight()
	}

	/// The backfillee durably applied `size` bytes of atoms from `range`.
	///
	/// `range` must lie within what was already streamed and `size` can't exceed the
	/// unacknowledged bytes of the batches it touches. Only then are the pre-atoms of `range`
	/// considered delivered.
	pub(crate) fn acknowledge(&mut self, range: &KeyRange, size: u64) -> Result<(), ProtocolError> {
		if !self.range.is_superset(range) {
			return Err(ProtocolError::AckOutsideSession {
				range: range.clone(),
				session_range: self.range.clone(),
			});
		}

		while let Ok(batch) = self.sent_rx.try_recv() {
			self.streamed_to = batch.range.right.clone();
			self.sent.push_back(batch);
		}

		let streamed = KeyRange::new(self.range.left.clone(), self.streamed_to.clone());
		if !streamed.is_superset(range) {
			return Err(ProtocolError::AckBeyondStreamed {
				range: range.clone(),
				streamed,
			});
		}

		let held = self.throttle.in_flight();
		if size > held {
			return Err(ProtocolError::AckExceedsReservation {
				requested: size,
				held,
			});
		}

		let sent = self
			.sent
			.iter()
			.filter(|batch| batch.range.overlaps(range))
			.map(|batch| batch.unacked)
			.sum::<u64>();
		if size > sent {
			return Err(ProtocolError::AckExceedsSent {
				range: range.clone(),
				requested: size,
				sent,
			});
		}

		self.throttle.release(size)?;

		let mut left = size;
		for batch in self.sent.iter_mut().filter(|batch| batch.range.overlaps(range)) {
			let taken = left.min(batch.unacked);
			batch.unacked -= taken;
			left -= taken;
		}
		self.sent.retain(|batch| batch.unacked > 0);

		let mut acked = self.consumed.split_off(&range.left);
		if let RightBound::Key(right) = &range.right {
			self.consumed.append(&mut acked.split_off(right));
		}

		trace!(
			%range,
			size,
			acked_pre_atoms = acked.len(),
			held = self.throttle.in_flight(),
			"Atoms acknowledged"
		);

		Ok(())
	}

	/// Cancel the task if it still runs, wait for it to unwind and release everything it held.
	/// Returns the consumed pre-atoms that were never acknowledged.
	pub(crate) async fn teardown(mut self) -> BTreeMap<Key, PreAtom> {
		self.cancel.cancel();

		if let Some(handle) = self.maybe_handle.take() {
			if let Err(e) = handle.await {
				if e.is_panic() {
					error!(session_id = %self.session_id, "Session task panicked");
				} else {
					warn!(session_id = %self.session_id, "Session task was aborted");
				}
			}
		}

		let released = self.throttle.release_all();
		if released > 0 {
			debug!(
				session_id = %self.session_id,
				released,
				"Released unacknowledged reservation"
			);
		}

		mem::take(&mut self.consumed)
	}
}

enum Step<T> {
	Canceled,
	Ready(T),
}

/// Run `fut` unless the session gets canceled first.
async fn unless_canceled<F: Future>(cancel: &CancellationToken, fut: F) -> Step<F::Output> {
	if cancel.is_cancelled() {
		return Step::Canceled;
	}

	(
		async {
			cancel.cancelled().await;
			Step::Canceled
		},
		async { Step::Ready(fut.await) },
	)
		.race()
		.await
}

struct Batch {
	session_id: SessionId,
	/// Left end of the span the next batch accounts for.
	cursor: Key,
	atoms: Vec<Atom>,
	bytes: u64,
}

impl Batch {
	/// Close the batch at `right`, handing back the message to send.
	fn cut(&mut self, right: RightBound) -> BackfilleeMessage {
		let range = KeyRange::new(mem::take(&mut self.cursor), right.clone());

		if let RightBound::Key(right) = right {
			self.cursor = right;
		}
		self.bytes = 0;

		BackfilleeMessage::Atoms {
			session_id: self.session_id,
			range,
			atoms: mem::take(&mut self.atoms),
		}
	}
}

impl<S: StoreView> SessionRun<S> {
	/// Stream the range, `Ok(false)` if canceled on the way.
	#[instrument(
		skip_all,
		fields(session_id = %self.session_id, range = %self.range),
		err
	)]
	async fn stream(
		self,
		cancel: &CancellationToken,
		sent_tx: &chan::Sender<SentBatch>,
	) -> Result<bool, SessionError> {
		let Self {
			session_id,
			range,
			since,
			requested,
			store,
			throttle,
			outbox,
			max_batch_bytes,
			..
		} = self;

		debug!(requested_pre_atoms = requested.len(), "Session started");

		let mut atoms = store.atoms(range.clone(), since, requested);

		let mut batch = Batch {
			session_id,
			cursor: range.left.clone(),
			atoms: Vec::new(),
			bytes: 0,
		};
		let mut previous_key: Option<Key> = None;

		loop {
			let atom = match unless_canceled(cancel, atoms.next()).await {
				Step::Canceled => return Ok(false),
				Step::Ready(None) => break,
				Step::Ready(Some(atom)) => atom?,
			};

			if let Some(previous) = &previous_key {
				if atom.key <= *previous {
					return Err(SessionError::OutOfOrder {
						key: atom.key,
						previous: previous.clone(),
					});
				}
			}

			if !range.contains_key(&atom.key) {
				warn!(key = %atom.key, "Store yielded an atom outside the session range, skipping");
				continue;
			}

			previous_key = Some(atom.key.clone());

			let size = atom.mem_size();

			if !batch.atoms.is_empty() && batch.bytes + size > max_batch_bytes {
				let message = batch.cut(RightBound::Key(atom.key.clone()));
				if !send(cancel, &outbox, sent_tx, message).await? {
					return Ok(false);
				}
			}

			if !throttle.try_acquire(size) {
				// Whatever we hold must reach the backfillee, or nothing will ever be acknowledged
				if !batch.atoms.is_empty() {
					let message = batch.cut(RightBound::Key(atom.key.clone()));
					if !send(cancel, &outbox, sent_tx, message).await? {
						return Ok(false);
					}
				}

				if let Step::Canceled = unless_canceled(cancel, throttle.acquire(size)).await {
					return Ok(false);
				}
			}

			batch.bytes += size;
			batch.atoms.push(atom);
		}

		let message = batch.cut(range.right.clone());
		if !send(cancel, &outbox, sent_tx, message).await? {
			return Ok(false);
		}

		trace!(in_flight = throttle.in_flight(), "Range streamed, waiting for acknowledgments");

		Ok(matches!(
			unless_canceled(cancel, throttle.drained()).await,
			Step::Ready(())
		))
	}
}

/// `Ok(false)` if canceled before the message could be handed to the outbox.
///
/// The batch is recorded before it is sent, so its acknowledgment can never be checked against
/// a record that isn't there yet.
async fn send(
	cancel: &CancellationToken,
	outbox: &chan::Sender<BackfilleeMessage>,
	sent_tx: &chan::Sender<SentBatch>,
	message: BackfilleeMessage,
) -> Result<bool, SessionError> {
	if let BackfilleeMessage::Atoms { range, atoms, .. } = &message {
		trace!(%range, atoms = atoms.len(), "Sending atoms batch");

		// The handle owns the receiver and outlives the task, a failure only means it's going away
		sent_tx
			.try_send(SentBatch {
				range: range.clone(),
				unacked: atoms.iter().map(Atom::mem_size).sum(),
			})
			.ok();
	}

	match unless_canceled(cancel, outbox.send(message)).await {
		Step::Canceled => Ok(false),
		Step::Ready(Ok(())) => Ok(true),
		Step::Ready(Err(_)) => Err(SessionError::OutboxClosed),
	}
}
