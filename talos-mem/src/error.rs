//! The error taxonomy shared by every layer of the memory management core.
//!
//! A single enum, rather than one per crate, is deliberate: callers crossing
//! the PFA / VMM / heap boundaries (the heap asking the VMM for backing
//! pages, the VMM asking the PFA for frames) propagate the same error type
//! the whole way up instead of translating between per-layer variants at
//! every hop.

use core::fmt;

/// Every way an operation in this core can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
	/// An argument violated a documented precondition (misaligned address,
	/// zero-length range, malformed flag combination).
	InvalidArgument,
	/// No frames, address space, or heap memory remained to satisfy the
	/// request.
	OutOfMemory,
	/// The operation required a mapping that does not exist.
	NotMapped,
	/// The operation required an address to be unmapped, but it already has
	/// a mapping.
	AlreadyMapped,
	/// The operation required a frame currently in use, but it was already
	/// free.
	AlreadyFree,
	/// The request is syntactically valid but not implemented for this
	/// configuration (e.g. a mapping granularity the backend doesn't
	/// support).
	Unsupported,
	/// The subsystem was used before its `init()` completed.
	NotInitialized,
	/// An internal invariant was violated; the subsystem that raised this
	/// should be considered untrustworthy from this point on.
	Corrupted,
}

impl fmt::Display for MemError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Self::InvalidArgument => "invalid argument",
			Self::OutOfMemory => "out of memory",
			Self::NotMapped => "address not mapped",
			Self::AlreadyMapped => "address already mapped",
			Self::AlreadyFree => "frame already free",
			Self::Unsupported => "operation not supported",
			Self::NotInitialized => "subsystem not initialized",
			Self::Corrupted => "internal invariant violated",
		};
		f.write_str(msg)
	}
}

impl core::error::Error for MemError {}

/// Shorthand for `core::result::Result<T, MemError>`, used throughout this
/// core's public APIs.
pub type Result<T> = core::result::Result<T, MemError>;
