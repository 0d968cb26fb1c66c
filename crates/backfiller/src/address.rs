use rb_fifo::{FifoSource, WriteToken};

use std::{fmt, sync::Arc};

use async_channel as chan;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{
	atom::PreAtom,
	error::{MailboxClosed, RegistrationError},
	key::{KeyRange, Region},
	message::{
		AckAtomsRequest, BackfilleeMessage, GoRequest, PreAtomsRequest, Sequenced, StopRequest,
	},
	version::VersionMap,
	ClientId, SessionId,
};

/// First message of the handshake: who the backfillee is and what it already has.
#[derive(Debug, Clone)]
pub struct Intro {
	/// The part of the backfiller's region to transfer.
	pub region: Region,
	/// The backfillee's current version per sub-range, input to lineage reconciliation.
	pub version: VersionMap,
	/// Where the client sends pre-atoms, atom batches and rejections.
	pub outbox: chan::Sender<BackfilleeMessage>,
}

#[derive(Debug)]
pub(crate) struct Registration {
	pub(crate) intro: Intro,
	pub(crate) reply: oneshot::Sender<Result<ClientAddress, RegistrationError>>,
}

/// Registration endpoint of a backfiller.
#[derive(Debug, Clone)]
pub struct RegistrarAddress {
	registrations_tx: chan::Sender<Registration>,
}

impl RegistrarAddress {
	pub(crate) const fn new(registrations_tx: chan::Sender<Registration>) -> Self {
		Self { registrations_tx }
	}

	/// Introduce a backfillee, getting back the mailboxes of the client created for it.
	pub async fn register(&self, intro: Intro) -> Result<ClientAddress, RegistrationError> {
		let (reply, reply_rx) = oneshot::channel();

		self.registrations_tx
			.send(Registration { intro, reply })
			.await
			.map_err(|_| RegistrationError::BackfillerGone)?;

		reply_rx
			.await
			.map_err(|_| RegistrationError::BackfillerGone)?
	}
}

/// Published, immutable description of a backfiller, handed to prospective backfillees.
#[derive(Debug, Clone)]
pub struct BusinessCard {
	pub region: Region,
	pub registrar: RegistrarAddress,
}

/// The backfillee's handle on its client: one mailbox per message kind and the token source
/// that orders them.
///
/// Mailboxes are independent, so the transport may reorder messages of different kinds; the
/// write tokens let the client apply them in the order they were issued. Dropping every clone
/// of the address disconnects the backfillee and tears the client down.
#[derive(Clone)]
pub struct ClientAddress {
	client_id: ClientId,
	fifo: Arc<FifoSource>,
	pre_atoms_tx: chan::Sender<Sequenced<PreAtomsRequest>>,
	go_tx: chan::Sender<Sequenced<GoRequest>>,
	stop_tx: chan::Sender<Sequenced<StopRequest>>,
	ack_atoms_tx: chan::Sender<Sequenced<AckAtomsRequest>>,
	_disconnect_on_drop: Arc<DropGuard>,
}

impl fmt::Debug for ClientAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientAddress")
			.field("client_id", &self.client_id)
			.field("next_token", &self.fifo.peek())
			.finish_non_exhaustive()
	}
}

impl ClientAddress {
	#[must_use]
	pub const fn client_id(&self) -> ClientId {
		self.client_id
	}

	/// Reserve a write token to send later with one of the `send_*` methods.
	pub fn stamp(&self) -> WriteToken {
		self.fifo.enter_write()
	}

	pub async fn pre_atoms(
		&self,
		range: KeyRange,
		pre_atoms: Vec<PreAtom>,
	) -> Result<WriteToken, MailboxClosed> {
		let token = self.stamp();
		self.send_pre_atoms(token, PreAtomsRequest { range, pre_atoms })
			.await
			.map(|()| token)
	}

	pub async fn go(
		&self,
		session_id: SessionId,
		range: KeyRange,
	) -> Result<WriteToken, MailboxClosed> {
		let token = self.stamp();
		self.send_go(token, GoRequest { session_id, range })
			.await
			.map(|()| token)
	}

	pub async fn stop(&self, session_id: SessionId) -> Result<WriteToken, MailboxClosed> {
		let token = self.stamp();
		self.send_stop(token, StopRequest { session_id })
			.await
			.map(|()| token)
	}

	pub async fn ack_atoms(
		&self,
		session_id: SessionId,
		range: KeyRange,
		size: u64,
	) -> Result<WriteToken, MailboxClosed> {
		let token = self.stamp();
		self.send_ack_atoms(
			token,
			AckAtomsRequest {
				session_id,
				range,
				size,
			},
		)
		.await
		.map(|()| token)
	}

	pub async fn send_pre_atoms(
		&self,
		token: WriteToken,
		message: PreAtomsRequest,
	) -> Result<(), MailboxClosed> {
		send(&self.pre_atoms_tx, token, message).await
	}

	pub async fn send_go(
		&self,
		token: WriteToken,
		message: GoRequest,
	) -> Result<(), MailboxClosed> {
		send(&self.go_tx, token, message).await
	}

	pub async fn send_stop(
		&self,
		token: WriteToken,
		message: StopRequest,
	) -> Result<(), MailboxClosed> {
		send(&self.stop_tx, token, message).await
	}

	pub async fn send_ack_atoms(
		&self,
		token: WriteToken,
		message: AckAtomsRequest,
	) -> Result<(), MailboxClosed> {
		send(&self.ack_atoms_tx, token, message).await
	}
}

async fn send<T>(
	tx: &chan::Sender<Sequenced<T>>,
	token: WriteToken,
	message: T,
) -> Result<(), MailboxClosed> {
	tx.send(Sequenced { token, message })
		.await
		.map_err(|_| MailboxClosed)
}

/// Receiving ends of a [`ClientAddress`], owned by the client actor.
pub(crate) struct ClientInbox {
	pub(crate) pre_atoms_rx: chan::Receiver<Sequenced<PreAtomsRequest>>,
	pub(crate) go_rx: chan::Receiver<Sequenced<GoRequest>>,
	pub(crate) stop_rx: chan::Receiver<Sequenced<StopRequest>>,
	pub(crate) ack_atoms_rx: chan::Receiver<Sequenced<AckAtomsRequest>>,
}

/// `disconnected` gets canceled once every clone of the returned address is dropped.
pub(crate) fn client_mailboxes(
	client_id: ClientId,
	capacity: usize,
	disconnected: &CancellationToken,
) -> (ClientAddress, ClientInbox) {
	let (pre_atoms_tx, pre_atoms_rx) = chan::bounded(capacity);
	let (go_tx, go_rx) = chan::bounded(capacity);
	let (stop_tx, stop_rx) = chan::bounded(capacity);
	let (ack_atoms_tx, ack_atoms_rx) = chan::bounded(capacity);

	(
		ClientAddress {
			client_id,
			fifo: Arc::new(FifoSource::new()),
			pre_atoms_tx,
			go_tx,
			stop_tx,
			ack_atoms_tx,
			_disconnect_on_drop: Arc::new(disconnected.clone().drop_guard()),
		},
		ClientInbox {
			pre_atoms_rx,
			go_rx,
			stop_rx,
			ack_atoms_rx,
		},
	)
}
