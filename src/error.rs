//! Error kinds produced by the kernel core (spec §7).
//!
//! Every variant here is routine: out-of-memory and timeouts are surfaced to
//! the guest program as ordinary syscall return codes. Internal consistency
//! failures (an empty bitmap being popped, `BitsCount` underflowing) are
//! programmer bugs and are never represented here — they trip a
//! `debug_assert!`/`assert!` instead.

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// The result of a wait or a memory operation in this crate.
pub type KernelResult<T> = Result<T, KernelError>;

/// Error kinds the kernel core produces.
///
/// Also derives a stable numeric round-trip (`num_derive`) for embedders
/// that surface these as guest syscall result codes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum KernelError {
    /// A `waitFor` deadline elapsed without any watched object signaling.
    #[error("wait timed out")]
    TimedOut,
    /// The waiting thread's sync-cancel flag was observed and consumed.
    #[error("wait was cancelled")]
    Cancelled,
    /// The waiting thread's termination-pending flag was observed.
    #[error("thread is terminating")]
    ThreadTerminating,
    /// Every granularity tier of a heap returned no free block.
    #[error("heap is out of memory")]
    OutOfMemory,
    /// `clearRange` was asked to clear a span that was not entirely free.
    #[error("invalid argument: range was not entirely free")]
    InvalidArgument,
}
