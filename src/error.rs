//! Error handling utils.
//!
//! Every fallible operation in this crate returns a small closed set of
//! [`Error`] variants. There is no hidden `errno`-style side channel: the
//! failure is always part of the return value, the way the rest of the
//! ecosystem (`thiserror`-based crates) expects.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All the ways an operation in this crate can fail.
///
/// Internal invariant violations (the ones that are "impossible per design")
/// are not represented here: they are `debug_assert!`-checked and otherwise
/// cause the process to abort, because the scheduler cannot make progress
/// once its own bookkeeping is inconsistent.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Allocation of a queue node, fiber, stack, or timer-set entry failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A caller-supplied argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A deadline passed before the operation completed.
    #[error("timed out")]
    TimedOut,

    /// The wait returned without the awaited event actually happening.
    /// Callers of the low-level primitives are expected to loop on this.
    #[error("spurious wake up, try again")]
    TryAgain,

    /// Converting a caller-supplied duration to the platform's time
    /// representation overflowed.
    #[error("duration overflowed the platform time representation")]
    Overflow,

    /// The socket accumulated a hangup/error condition before or during the
    /// operation.
    #[error("connection reset")]
    ConnectionReset,

    /// Some other OS-level failure was passed through from a syscall
    /// (`setsockopt`/`bind`/`listen`/`connect`/`accept`/`read`/`write`/...).
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "OutOfMemory",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::TimedOut => "TimedOut",
            Self::TryAgain => "TryAgain",
            Self::Overflow => "Overflow",
            Self::ConnectionReset => "ConnectionReset",
            Self::Socket(_) => "Socket",
        }
    }

    #[inline]
    #[track_caller]
    pub(crate) fn last_os_error() -> Self {
        Self::Socket(io::Error::last_os_error())
    }
}

/// Aborts the process with a diagnostic message.
///
/// Used for invariant violations that the design considers impossible: a
/// fiber linked into two queues at once, a poller syscall returning an
/// unrecoverable error, etc. These are not recoverable `Error`s because by
/// the time they are observed the scheduler's own bookkeeping can no longer
/// be trusted.
#[cold]
#[inline(never)]
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("fatal runtime error: {msg}");
    panic!("fevrt: fatal runtime error: {msg}");
}
