use std::{collections::HashMap, pin::pin, sync::Arc, time::Duration};

use async_channel as chan;
use futures::{FutureExt, StreamExt};
use futures_concurrency::{future::Race, stream::Merge};
use tokio::{
	spawn,
	sync::RwLock,
	task::JoinHandle,
	time::timeout,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};
use uuid::Uuid;

use super::{
	address::{client_mailboxes, BusinessCard, ClientAddress, Intro, RegistrarAddress, Registration},
	client::Client,
	config::BackfillerConfig,
	error::{ConfigError, RegistrationError},
	key::Region,
	store::{StoreView, VersionLineage},
	throttle::ReservationGauge,
	ClientId,
};

type ClientsMap = Arc<RwLock<HashMap<ClientId, JoinHandle<()>>>>;

/// Serves backfills of one store region to any number of backfillees.
///
/// Every registered backfillee gets its own client actor, running until the backfillee drops its
/// [`ClientAddress`] or the backfiller shuts down. Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct Backfiller {
	region: Region,
	registrar: RegistrarAddress,
	gauge: ReservationGauge,
	clients: ClientsMap,
	teardown_timeout: Duration,
	cancel: CancellationToken,
	maybe_handle: Option<JoinHandle<()>>,
	_cancel_on_drop: DropGuard,
}

impl Backfiller {
	pub fn new<S: StoreView, L: VersionLineage>(
		store: Arc<S>,
		lineage: Arc<L>,
		config: BackfillerConfig,
	) -> Result<Self, ConfigError> {
		config.validate()?;

		let region = store.region();
		let (registrations_tx, registrations_rx) = chan::bounded(config.mailbox_capacity);
		let (exits_tx, exits_rx) = chan::unbounded();

		let gauge = ReservationGauge::default();
		let clients = ClientsMap::default();
		let cancel = CancellationToken::new();
		let teardown_timeout = config.teardown_timeout;

		let registrar = Registrar {
			store,
			lineage,
			region: region.clone(),
			config: Arc::new(config),
			gauge: gauge.clone(),
			clients: Arc::clone(&clients),
			exits_tx,
			cancel: cancel.clone(),
		};

		let handle = spawn(registrar.run(registrations_rx, exits_rx));

		info!(%region, "Backfiller started");

		Ok(Self {
			region,
			registrar: RegistrarAddress::new(registrations_tx),
			gauge,
			clients,
			teardown_timeout,
			_cancel_on_drop: cancel.clone().drop_guard(),
			cancel,
			maybe_handle: Some(handle),
		})
	}

	#[must_use]
	pub fn business_card(&self) -> BusinessCard {
		BusinessCard {
			region: self.region.clone(),
			registrar: self.registrar.clone(),
		}
	}

	pub async fn register(&self, intro: Intro) -> Result<ClientAddress, RegistrationError> {
		self.registrar.register(intro).await
	}

	/// Atom bytes streamed to all backfillees and not acknowledged yet.
	#[must_use]
	pub fn reserved_bytes(&self) -> u64 {
		self.gauge.get()
	}

	pub async fn client_count(&self) -> usize {
		self.clients.read().await.len()
	}

	/// Stop accepting registrations and tear every client down, aborting the ones that do not
	/// wind down within the configured timeout.
	#[instrument(skip_all, fields(region = %self.region))]
	pub async fn shutdown(mut self) {
		self.cancel.cancel();

		if let Some(handle) = self.maybe_handle.take() {
			wait_stop_or_abort(handle, self.teardown_timeout).await;
		}

		let clients = self.clients.write().await.drain().collect::<Vec<_>>();
		debug!(clients = clients.len(), "Tearing down clients");

		for (client_id, handle) in clients {
			trace!(%client_id, "Waiting for client to stop");
			wait_stop_or_abort(handle, self.teardown_timeout).await;
		}

		info!("Backfiller shut down");
	}
}

struct Registrar<S, L> {
	store: Arc<S>,
	lineage: Arc<L>,
	region: Region,
	config: Arc<BackfillerConfig>,
	gauge: ReservationGauge,
	clients: ClientsMap,
	exits_tx: chan::Sender<ClientId>,
	cancel: CancellationToken,
}

enum StreamMessage {
	Registration(Registration),
	ClientExited(ClientId),
	Stop,
}

impl<S: StoreView, L: VersionLineage> Registrar<S, L> {
	#[instrument(skip_all, fields(region = %self.region))]
	async fn run(
		self,
		registrations_rx: chan::Receiver<Registration>,
		exits_rx: chan::Receiver<ClientId>,
	) {
		let cancel_token = self.cancel.clone();
		let cancel = pin!(cancel_token.cancelled());

		let mut msg_stream = pin!((
			registrations_rx.map(StreamMessage::Registration),
			exits_rx.map(StreamMessage::ClientExited),
			cancel.into_stream().map(|()| StreamMessage::Stop),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Registration(Registration { intro, reply }) => {
					let res = (
						async {
							self.cancel.cancelled().await;
							Err(RegistrationError::BackfillerGone)
						},
						self.register(intro),
					)
						.race()
						.await;

					if let Err(e) = &res {
						warn!(%e, "Refused backfillee registration");
					}

					if reply.send(res).is_err() {
						debug!("Backfillee went away before getting its client address");
					}
				}

				StreamMessage::ClientExited(client_id) => {
					if self.clients.write().await.remove(&client_id).is_some() {
						debug!(%client_id, "Client exited");
					}
				}

				StreamMessage::Stop => {
					debug!("Registrar stopping");
					break;
				}
			}
		}
	}

	#[instrument(skip_all, fields(offered = %intro.region))]
	async fn register(&self, intro: Intro) -> Result<ClientAddress, RegistrationError> {
		let Intro {
			region,
			version,
			outbox,
		} = intro;

		if region.range().is_empty() || !self.region.contains_region(&region) {
			return Err(RegistrationError::IncompatibleRegion {
				offered: region,
				served: self.region.clone(),
			});
		}

		let common_version = self
			.lineage
			.common_version(&region, &version)
			.await
			.map_err(|e| {
				error!(?e, "Version lineage reconciliation failed");
				e
			})?;

		if !common_version.covers(region.range()) {
			return Err(RegistrationError::IncompleteCommonVersion { region });
		}

		let client_id: ClientId = Uuid::new_v4();
		let cancel = self.cancel.child_token();
		// Also fires on shutdown, being a child of the client's own token
		let disconnected = cancel.child_token();
		let (address, inbox) =
			client_mailboxes(client_id, self.config.mailbox_capacity, &disconnected);

		let (client, events_rx) = Client::new(
			client_id,
			region,
			common_version,
			Arc::clone(&self.store),
			Arc::clone(&self.config),
			self.gauge.clone(),
			outbox,
			cancel,
			disconnected,
		);

		let handle = spawn({
			let exits_tx = self.exits_tx.clone();

			async move {
				client.run(inbox, events_rx).await;

				if exits_tx.send(client_id).await.is_err() {
					trace!(%client_id, "Registrar already stopped");
				}
			}
			.in_current_span()
		});

		self.clients.write().await.insert(client_id, handle);

		info!(%client_id, "Backfillee registered");

		Ok(address)
	}
}

async fn wait_stop_or_abort(handle: JoinHandle<()>, teardown_timeout: Duration) {
	let abort_handle = handle.abort_handle();

	match timeout(teardown_timeout, handle).await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			if e.is_panic() {
				error!("Task panicked while winding down");
			}
		}
		Err(_) => {
			error!("Task failed to gracefully stop in the allotted time, will force abortion");
			abort_handle.abort();
		}
	}
}
