use thiserror::Error;

use super::source::WriteToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("write token already released <token='{token}', next_expected='{next_expected}'>")]
	Stale {
		token: WriteToken,
		next_expected: WriteToken,
	},
	#[error("write token already waiting in the sink <token='{0}'>")]
	Duplicate(WriteToken),
	#[error(
		"write token too far ahead <token='{token}', next_expected='{next_expected}', window='{window}'>"
	)]
	TooFarAhead {
		token: WriteToken,
		next_expected: WriteToken,
		window: u64,
	},
}
