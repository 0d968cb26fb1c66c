//!
//! # FIFO Enforcer
//!
//! Restores per-stream message order over a transport that may reorder deliveries.
//!
//! The sending side owns a [`FifoSource`] and stamps every outgoing message with a
//! [`WriteToken`]. The receiving side owns a [`FifoSink`], pushes each delivery with its token and
//! gets back, in token order, every message that can now be applied. Messages that arrive ahead of
//! a gap are held until the gap closes.
//!
//! ## Basic example
//!
//! ```
//! use rb_fifo::{FifoSink, FifoSource};
//!
//! let source = FifoSource::new();
//! let first = source.enter_write();
//! let second = source.enter_write();
//!
//! let mut sink = FifoSink::new();
//!
//! // The second message overtook the first one in transit
//! assert!(sink.push(second, "second").unwrap().next().is_none());
//!
//! let released = sink.push(first, "first").unwrap().collect::<Vec<_>>();
//! assert_eq!(released, vec!["first", "second"]);
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

mod error;
mod sink;
mod source;

pub use error::Error as FifoError;
pub use sink::{FifoSink, Released};
pub use source::{FifoSource, WriteToken};
