//! `_for(relative)` / `_until(absolute)` deadline conversion, shared by
//! every timed primitive in the crate, plus [`sleep_for`]/[`sleep_until`]
//! (spec section 9's open question: declared throughout the public surface
//! but left unimplemented in the source this crate is modeled on).

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Computes an absolute deadline from a relative duration, using the
/// monotonic clock exclusively (spec section 9's open question on
/// `condition_variable::wait_for`'s clock choice, resolved here and made
/// uniform across the whole crate rather than per-wrapper).
///
/// # Errors
/// Returns [`Error::Overflow`] if `duration` does not fit in the platform's
/// monotonic clock representation.
pub(crate) fn deadline_from(duration: Duration) -> Result<Instant> {
    Instant::now().checked_add(duration).ok_or(Error::Overflow)
}

/// Suspends the calling fiber for at least `duration`, never earlier than
/// the monotonic clock reaching `start + duration` (spec scenario S7).
///
/// Implemented as a [`crate::timers`] timed wait on a waiter nobody else
/// ever references, so it can only ever resolve via its own deadline.
pub fn sleep_for(duration: Duration) -> Result<()> {
    sleep_until(deadline_from(duration)?)
}

/// As [`sleep_for`], but takes an absolute deadline directly.
pub fn sleep_until(deadline: Instant) -> Result<()> {
    let waiter = crate::sync::waiter::Waiter::new(crate::fiber::this_fiber());
    match crate::timers::timed_wait(&waiter, deadline) {
        Ok(()) => unreachable!(
            "sleep's private waiter has no other party able to wake it with Ready"
        ),
        Err(Error::TimedOut) => Ok(()),
        Err(e) => Err(e),
    }
}
