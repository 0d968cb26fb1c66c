//!
//! # Backfiller
//!
//! The serving half of a range backfill: streams the part of a store a backfillee is missing,
//! while the store keeps taking writes.
//!
//! A backfillee registers through the backfiller's [`BusinessCard`], gets a [`ClientAddress`]
//! back and drives the transfer with four messages:
//! - `pre_atoms` announces the keys it changed in a range and gets back the ones we changed;
//! - `go` starts a session streaming a range whose pre-atoms were requested;
//! - `ack_atoms` confirms atoms were applied, letting the session stream more;
//! - `stop` ends a session early, handing its unacknowledged pre-atoms back to the queue.
//!
//! Messages are stamped with write tokens and applied in token order, whatever order the
//! transport delivers them in. Unacknowledged atom bytes of a session are bounded by the
//! configured throttle.
//!
//! ## Basic example
//!
//! ```
//! use rb_backfiller::{
//!     Atom, Backfiller, BackfillerConfig, Intro, KeyRange, LineageError, PreAtom, Region,
//!     StoreError, StoreView, VersionLineage, VersionMap, VersionStamp,
//! };
//! use async_trait::async_trait;
//! use futures::stream::{self, BoxStream, StreamExt};
//! use std::sync::Arc;
//!
//! struct EmptyStore;
//!
//! impl StoreView for EmptyStore {
//!     fn region(&self) -> Region {
//!         Region::new(KeyRange::universe())
//!     }
//!
//!     fn pre_atoms(&self, _: KeyRange, _: VersionMap) -> BoxStream<'static, Result<PreAtom, StoreError>> {
//!         stream::empty().boxed()
//!     }
//!
//!     fn atoms(&self, _: KeyRange, _: VersionMap, _: Vec<PreAtom>) -> BoxStream<'static, Result<Atom, StoreError>> {
//!         stream::empty().boxed()
//!     }
//! }
//!
//! struct SharedOrigin;
//!
//! #[async_trait]
//! impl VersionLineage for SharedOrigin {
//!     async fn common_version(&self, region: &Region, _: &VersionMap) -> Result<VersionMap, LineageError> {
//!         Ok(VersionMap::uniform(region.range().clone(), VersionStamp::ZERO))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let backfiller = Backfiller::new(
//!         Arc::new(EmptyStore),
//!         Arc::new(SharedOrigin),
//!         BackfillerConfig::default(),
//!     )
//!     .unwrap();
//!
//!     let (outbox, _inbox) = async_channel::unbounded();
//!
//!     let address = backfiller
//!         .business_card()
//!         .registrar
//!         .register(Intro {
//!             region: Region::new(KeyRange::half_open(0_u64, 100_u64)),
//!             version: VersionMap::default(),
//!             outbox,
//!         })
//!         .await
//!         .unwrap();
//!
//!     address
//!         .pre_atoms(KeyRange::half_open(0_u64, 100_u64), vec![])
//!         .await
//!         .unwrap();
//!
//!     backfiller.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod address;
mod atom;
mod backfiller;
mod client;
mod config;
mod error;
mod key;
mod message;
mod pre_atoms;
mod session;
mod store;
mod throttle;
mod version;

pub use address::{BusinessCard, ClientAddress, Intro, RegistrarAddress};
pub use atom::{Atom, PreAtom, ATOM_OVERHEAD_BYTES};
pub use backfiller::Backfiller;
pub use config::{
	BackfillerConfig, DEFAULT_ATOM_THROTTLE_BYTES, DEFAULT_MAILBOX_CAPACITY,
	DEFAULT_MAX_BATCH_BYTES, DEFAULT_REORDER_WINDOW,
};
pub use error::{
	ConfigError, LineageError, MailboxClosed, ProtocolError, RegistrationError, StoreError,
	ThrottleError, VersionMapError,
};
pub use key::{Key, KeyRange, Region, RightBound};
pub use message::{
	AckAtomsRequest, BackfilleeMessage, GoRequest, PreAtomsRequest, Sequenced, StopRequest,
};
pub use store::{StoreView, VersionLineage};
pub use throttle::{ReservationGauge, Throttle};
pub use version::{VersionMap, VersionStamp};

pub use rb_fifo::{FifoError, WriteToken};

/// Picked by the backfillee, unique among the sessions of its client.
pub type SessionId = uuid::Uuid;

pub type ClientId = uuid::Uuid;
