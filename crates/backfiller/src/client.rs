use rb_fifo::{FifoSink, WriteToken};

use std::{pin::pin, sync::Arc};

use async_channel as chan;
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use futures_concurrency::{future::Race, stream::Merge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
	address::ClientInbox,
	config::BackfillerConfig,
	error::ProtocolError,
	key::{KeyRange, Region},
	message::{
		AckAtomsRequest, BackfilleeMessage, ClientMessage, GoRequest, PreAtomsRequest, Sequenced,
		StopRequest,
	},
	pre_atoms::PreAtomQueue,
	session::{SessionEvent, SessionHandle, SessionOutcome, SessionRun},
	store::StoreView,
	throttle::{ReservationGauge, Throttle},
	version::VersionMap,
	ClientId,
};

const INBOUND_MAILBOXES: usize = 4;

/// Protocol state for one backfillee.
///
/// Runs as a single actor task: every field is only touched from inside [`Client::run`], and
/// messages reach the handlers strictly in write token order.
pub(crate) struct Client<S> {
	id: ClientId,
	full_region: Region,
	common_version: VersionMap,
	store: Arc<S>,
	config: Arc<BackfillerConfig>,
	gauge: ReservationGauge,
	outbox: chan::Sender<BackfilleeMessage>,
	backfillee_gone: bool,
	queue: PreAtomQueue,
	fifo: FifoSink<(WriteToken, ClientMessage)>,
	session: Option<SessionHandle>,
	next_generation: u64,
	events_tx: chan::Sender<SessionEvent>,
	cancel: CancellationToken,
	/// Canceled when the backfillee drops its address or the client gets canceled.
	disconnected: CancellationToken,
}

#[derive(Debug)]
enum StreamMessage {
	Inbound(WriteToken, ClientMessage),
	MailboxClosed,
	SessionEnded(SessionEvent),
	Stop,
}

fn inbound<T: Send + 'static>(
	rx: chan::Receiver<Sequenced<T>>,
	wrap: fn(T) -> ClientMessage,
) -> impl futures::Stream<Item = StreamMessage> + Send {
	rx.map(move |Sequenced { token, message }| StreamMessage::Inbound(token, wrap(message)))
		.chain(stream::once(async { StreamMessage::MailboxClosed }))
}

impl<S: StoreView> Client<S> {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		id: ClientId,
		full_region: Region,
		common_version: VersionMap,
		store: Arc<S>,
		config: Arc<BackfillerConfig>,
		gauge: ReservationGauge,
		outbox: chan::Sender<BackfilleeMessage>,
		cancel: CancellationToken,
		disconnected: CancellationToken,
	) -> (Self, chan::Receiver<SessionEvent>) {
		let (events_tx, events_rx) = chan::unbounded();
		let fifo = FifoSink::with_window(config.reorder_window);

		(
			Self {
				id,
				full_region,
				common_version,
				store,
				config,
				gauge,
				outbox,
				backfillee_gone: false,
				queue: PreAtomQueue::default(),
				fifo,
				session: None,
				next_generation: 0,
				events_tx,
				cancel,
				disconnected,
			},
			events_rx,
		)
	}

	/// Serve the backfillee until it disconnects or the backfiller cancels us. Any active session
	/// is torn down before this returns.
	#[instrument(skip_all, fields(client_id = %self.id, region = %self.full_region))]
	pub(crate) async fn run(
		mut self,
		inbox: ClientInbox,
		events_rx: chan::Receiver<SessionEvent>,
	) {
		let ClientInbox {
			pre_atoms_rx,
			go_rx,
			stop_rx,
			ack_atoms_rx,
		} = inbox;

		let cancel_token = self.cancel.clone();
		let cancel = pin!(cancel_token.cancelled());

		let mut msg_stream = pin!((
			inbound(pre_atoms_rx, ClientMessage::PreAtoms),
			inbound(go_rx, ClientMessage::Go),
			inbound(stop_rx, ClientMessage::Stop),
			inbound(ack_atoms_rx, ClientMessage::AckAtoms),
			events_rx.map(StreamMessage::SessionEnded),
			cancel.into_stream().map(|()| StreamMessage::Stop),
		)
			.merge());

		let mut closed_mailboxes = 0;

		info!("Serving backfillee");

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Inbound(token, message) => self.accept(token, message).await,

				StreamMessage::SessionEnded(event) => self.on_session_ended(event).await,

				StreamMessage::MailboxClosed => {
					closed_mailboxes += 1;
					if closed_mailboxes == INBOUND_MAILBOXES {
						debug!("Backfillee dropped its address");
						break;
					}
				}

				StreamMessage::Stop => {
					debug!("Client canceled by the backfiller");
					break;
				}
			}

			if self.backfillee_gone {
				debug!("Backfillee is unreachable");
				break;
			}
		}

		if let Some(session) = self.session.take() {
			let session_id = session.session_id;
			drop(session.teardown().await);
			debug!(%session_id, "Tore down active session");
		}

		info!(
			held_messages = self.fifo.held_count(),
			"Client torn down"
		);
	}

	/// Pass a delivery through the ordering enforcer and apply whatever it releases.
	async fn accept(&mut self, token: WriteToken, message: ClientMessage) {
		let pushed = self
			.fifo
			.push(token, (token, message))
			.map(Iterator::collect::<Vec<_>>);

		let released = match pushed {
			Ok(released) => released,
			Err(e) => {
				warn!(%token, ?e, "Discarding message with bad write token");
				self.reject(token, e.into()).await;
				return;
			}
		};

		for (token, message) in released {
			let kind = message.kind();

			let res = match message {
				ClientMessage::PreAtoms(req) => self.handle_pre_atoms(req).await,
				ClientMessage::Go(req) => self.handle_go(req),
				ClientMessage::Stop(req) => self.handle_stop(req).await,
				ClientMessage::AckAtoms(req) => self.handle_ack_atoms(req),
			};

			if let Err(e) = res {
				warn!(%token, kind, %e, "Protocol violation");
				self.reject(token, e).await;
			}

			if self.backfillee_gone {
				return;
			}
		}
	}

	async fn reject(&mut self, token: WriteToken, error: ProtocolError) {
		self.emit(BackfilleeMessage::Rejected { token, error }).await;
	}

	/// Send to the backfillee unless it's gone. A full outbox is waited on only as long as the
	/// backfillee still holds its address and the client isn't canceled.
	async fn emit(&mut self, message: BackfilleeMessage) {
		if self.backfillee_gone {
			return;
		}

		let outbox = &self.outbox;
		let disconnected = &self.disconnected;

		let sent = (
			async {
				disconnected.cancelled().await;
				false
			},
			async { outbox.send(message).await.is_ok() },
		)
			.race()
			.await;

		if !sent {
			self.backfillee_gone = true;
		}
	}

	fn check_in_region(&self, range: &KeyRange) -> Result<(), ProtocolError> {
		if self.full_region.contains_range(range) {
			Ok(())
		} else {
			Err(ProtocolError::RangeOutsideRegion {
				range: range.clone(),
				region: self.full_region.clone(),
			})
		}
	}

	/// Queue the backfillee's hints for `range` together with the keys we changed there since the
	/// common version, and send the latter back. An overlapping request is applied before being
	/// reported.
	#[instrument(skip_all, fields(range = %req.range, hints = req.pre_atoms.len()))]
	async fn handle_pre_atoms(&mut self, req: PreAtomsRequest) -> Result<(), ProtocolError> {
		let PreAtomsRequest { range, pre_atoms } = req;

		if range.is_empty() {
			return Err(ProtocolError::EmptyRange);
		}
		self.check_in_region(&range)?;

		if pre_atoms
			.iter()
			.any(|pre_atom| !range.contains_key(&pre_atom.key))
		{
			return Err(ProtocolError::PreAtomOutsideRange { range });
		}

		let read = self
			.store
			.pre_atoms(range.clone(), self.common_version.mask(&range))
			.try_collect::<Vec<_>>();

		let cancel = self.cancel.clone();
		let outcome = (
			async {
				cancel.cancelled().await;
				None
			},
			read.map(Some),
		)
			.race()
			.await;

		let ours = match outcome {
			Some(Ok(ours)) => ours,
			Some(Err(e)) => {
				error!(?e, "Failed to read pre-atoms from the store");
				self.emit(BackfilleeMessage::PreAtomsFailed {
					range,
					reason: e.to_string(),
				})
				.await;
				return Ok(());
			}
			None => return Ok(()),
		};

		trace!(ours = ours.len(), "Read pre-atoms from the store");

		// Hints go last so they win over our own pre-atom for the same key
		let overlap = self
			.queue
			.enqueue(range.clone(), ours.iter().cloned().chain(pre_atoms));

		debug!(
			pending_requests = self.queue.requests().len(),
			queued = self.queue.len(),
			"Pre-atoms queued"
		);

		self.emit(BackfilleeMessage::PreAtoms {
			range,
			pre_atoms: ours,
		})
		.await;

		overlap.map_or(Ok(()), Err)
	}

	#[instrument(skip_all, fields(session_id = %req.session_id, range = %req.range))]
	fn handle_go(&mut self, req: GoRequest) -> Result<(), ProtocolError> {
		let GoRequest { session_id, range } = req;

		if let Some(active) = &self.session {
			return Err(ProtocolError::SessionAlreadyActive {
				active: active.session_id,
			});
		}

		self.check_in_region(&range)?;

		if !self.queue.covers(&range) {
			return Err(ProtocolError::RangeNotQueued { range });
		}

		let consumed = self.queue.take(&range);
		let generation = self.next_generation;
		self.next_generation += 1;

		debug!(
			consumed_pre_atoms = consumed.len(),
			generation, "Starting session"
		);

		self.session = Some(SessionHandle::start(
			SessionRun {
				session_id,
				generation,
				since: self.common_version.mask(&range),
				range,
				requested: consumed.values().cloned().collect(),
				store: Arc::clone(&self.store),
				throttle: Arc::new(Throttle::new(
					self.config.atom_throttle_bytes,
					self.gauge.clone(),
				)),
				outbox: self.outbox.clone(),
				max_batch_bytes: self.config.max_batch_bytes,
			},
			consumed,
			self.events_tx.clone(),
		));

		Ok(())
	}

	/// Tear the matching session down before returning, so the next message already sees the
	/// slot empty.
	#[instrument(skip_all, fields(session_id = %req.session_id))]
	async fn handle_stop(&mut self, req: StopRequest) -> Result<(), ProtocolError> {
		let session = match self.session.take() {
			Some(session) if session.session_id == req.session_id => session,
			other => {
				self.session = other;
				return Err(ProtocolError::UnknownSession(req.session_id));
			}
		};

		let unacked = session.teardown().await;
		debug!(returned_pre_atoms = unacked.len(), "Session stopped");
		self.queue.requeue(unacked);

		Ok(())
	}

	#[instrument(
		skip_all,
		fields(session_id = %req.session_id, range = %req.range, size = req.size)
	)]
	fn handle_ack_atoms(&mut self, req: AckAtomsRequest) -> Result<(), ProtocolError> {
		match &mut self.session {
			Some(session) if session.session_id == req.session_id => {
				session.acknowledge(&req.range, req.size)
			}
			Some(session) => {
				trace!(
					active = %session.session_id,
					held = session.held(),
					"Acknowledgment for another session"
				);
				Err(ProtocolError::UnknownSession(req.session_id))
			}
			None => Err(ProtocolError::UnknownSession(req.session_id)),
		}
	}

	async fn on_session_ended(&mut self, event: SessionEvent) {
		let SessionEvent {
			generation,
			session_id,
			outcome,
		} = event;

		let session = match self.session.take() {
			Some(session) if session.generation == generation => session,
			other => {
				// Already torn down by a stop
				self.session = other;
				trace!(%session_id, generation, "Ignoring outcome of a stopped session");
				return;
			}
		};

		self.queue.requeue(session.teardown().await);

		match outcome {
			SessionOutcome::Completed => debug!(%session_id, "Session completed"),
			SessionOutcome::Canceled => debug!(%session_id, "Session canceled"),
			SessionOutcome::Failed(e) => {
				error!(%session_id, %e, "Session failed");
				self.emit(BackfilleeMessage::SessionTerminated {
					session_id,
					reason: e.to_string(),
				})
				.await;
			}
		}
	}
}
