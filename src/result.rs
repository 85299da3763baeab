use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Result codes surfaced to the guest by supervisor calls.
///
/// Internal invariant violations are not represented here; those abort the
/// emulator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SvcError {
	#[error("invalid address")]
	InvalidAddress,
	#[error("invalid current memory")]
	InvalidCurrentMemory,
	#[error("invalid combination")]
	InvalidCombination,
	#[error("invalid enum value")]
	InvalidEnumValue,
	#[error("invalid state")]
	InvalidState,
	#[error("invalid handle")]
	InvalidHandle,
	#[error("out of handles")]
	OutOfHandles,
	#[error("out of resource")]
	OutOfResource,
	#[error("out of memory")]
	OutOfMemory,
	#[error("timed out")]
	TimedOut,
	#[error("termination requested")]
	TerminationRequested,
	#[error("cancelled")]
	Cancelled,
	#[error("session closed")]
	SessionClosed,
	#[error("receive list broken")]
	ReceiveListBroken,
	#[error("not found")]
	NotFound,
	#[error("busy")]
	Busy,
}

pub type SvcResult<T = ()> = Result<T, SvcError>;

impl SvcError {
	/// Encodes the result the way the guest ABI reports it (0 = success).
	pub fn to_raw(result: SvcResult) -> u32 {
		match result {
			Ok(()) => 0,
			Err(e) => e as u32 + 1,
		}
	}
}
