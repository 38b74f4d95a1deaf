//! The three-phase waiter handshake.
//!
//! A [`Waiter`] lives on the parking fiber's own stack. Parking happens in
//! two steps because the register state that makes the fiber resumable only
//! becomes valid *after* [`crate::context::switch_and_call`] has completed
//! the switch — so "I have parked" cannot be published before the switch,
//! and must not be published so late that a waker races ahead of it. The
//! orderings below are load-bearing; each is annotated with the invariant it
//! protects rather than why it was chosen.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use crate::fiber::FiberRef;

/// Why a parked fiber was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WakeReason {
    None = 0,
    Ready = 1,
    TimedOutCheck = 2,
    TimedOutNoCheck = 3,
}

impl WakeReason {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WakeReason::None,
            1 => WakeReason::Ready,
            2 => WakeReason::TimedOutCheck,
            3 => WakeReason::TimedOutNoCheck,
            _ => unreachable!("waiter reason byte out of range"),
        }
    }
}

/// Result of [`Waiter::wake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeResult {
    /// Another wake already claimed this waiter; the caller did nothing.
    Failed,
    /// `reason` was published; the parking fiber's own `enable_wake_ups`
    /// post-switch callback is (or will be) responsible for rescheduling it.
    SetOnly,
    /// `reason` was published and this call is responsible for pushing the
    /// fiber back onto a run queue.
    SetAndWakeUp,
}

const POST_BIT: u16 = 1;
const WAKE_BIT: u16 = 1 << 1;

/// A single-use parking record, valid only between [`Waiter::new`] and the
/// caller returning from [`Waiter::park`].
pub(crate) struct Waiter {
    reason: AtomicU8,
    do_wake: AtomicU8,
    wait: AtomicU16,
    fiber: FiberRef,
}

impl Waiter {
    pub fn new(fiber: FiberRef) -> Self {
        Self {
            reason: AtomicU8::new(WakeReason::None as u8),
            do_wake: AtomicU8::new(0),
            wait: AtomicU16::new(WAKE_BIT),
            fiber,
        }
    }

    /// Called by the waker (`wake(waiter, reason)` in the spec).
    ///
    /// Exactly one of this method and the [`enable_wake_ups`] post-switch
    /// callback ends up responsible for rescheduling the fiber; see the
    /// module docs.
    pub fn wake(&self, reason: WakeReason) -> WakeResult {
        if self
            .reason
            .compare_exchange(
                WakeReason::None as u8,
                reason as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return WakeResult::Failed;
        }

        // Whoever observes `do_wake == 1` here is the one responsible for
        // pushing the fiber: `enable_wake_ups` only attempts this exchange
        // when it has already seen `reason != NONE`, so at most one side
        // observes the pre-clear value.
        let previous = self.do_wake.swap(0, Ordering::AcqRel);
        let result = if previous == 1 {
            WakeResult::SetAndWakeUp
        } else {
            WakeResult::SetOnly
        };

        // Release: publishes `reason` and lets the parked fiber's spin loop
        // (step 5 in the caller-side protocol) observe `wait == 0` once the
        // post-switch callback also clears its bit.
        self.wait.fetch_and(!WAKE_BIT, Ordering::Release);

        result
    }

    /// Sets `wait_for_post` just before the context switch that parks this
    /// fiber (step 3 of the caller-side protocol).
    fn arm_post_bit(&self) {
        self.wait.fetch_or(POST_BIT, Ordering::Relaxed);
    }

    fn is_parked(&self) -> bool {
        self.wait.load(Ordering::Acquire) != 0
    }

    pub fn wake_reason(&self) -> WakeReason {
        WakeReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    pub fn fiber(&self) -> &FiberRef {
        &self.fiber
    }

    /// Restores the initial (unparked, unwoken) state so the same waiter can
    /// be parked again. Only valid once the caller has itself returned from
    /// [`park`] and is sequentially the only party touching the waiter —
    /// used by the timer bucket processor's spurious-wakeup retry.
    pub(crate) fn reset(&self) {
        self.reason.store(WakeReason::None as u8, Ordering::Relaxed);
        self.do_wake.store(0, Ordering::Relaxed);
        self.wait.store(WAKE_BIT, Ordering::Relaxed);
    }
}

/// Runs on the worker's scheduler stack immediately after the context switch
/// that parked `waiter`'s owner has committed. This is the `post_fn` plugged
/// into [`crate::context::switch_and_call`].
///
/// # Safety
/// `arg` must be a valid `*mut Waiter` for a waiter that is currently being
/// parked via [`Waiter::park`], and must not be touched by any other code
/// until this function's release stores are visible to the parked fiber.
pub(crate) unsafe extern "C" fn enable_wake_ups(arg: *mut c_void) {
    let waiter = &*(arg as *const Waiter);

    // Sequentially consistent: orders with the relaxed load below so that
    // if a concurrent waker already cleared `do_wake`, we see it, and if we
    // store first, the waker's own exchange sees ours.
    waiter.do_wake.store(1, Ordering::SeqCst);

    let reason = waiter.reason.load(Ordering::Relaxed);
    let mut won_race = false;
    if reason != WakeReason::None as u8 {
        let previous = waiter.do_wake.swap(0, Ordering::AcqRel);
        if previous == 1 {
            won_race = true;
        }
    }

    // Unconditional: lets the parked fiber leave its spin loop once the
    // waker (if any) has also cleared its bit, and publishes this frame's
    // writes (and the waker's, via the acquire above) to the fiber.
    waiter.wait.fetch_and(!POST_BIT, Ordering::Release);

    if won_race {
        let reason = WakeReason::from_u8(waiter.reason.load(Ordering::Acquire));
        debug_assert_ne!(reason, WakeReason::None);
        crate::worker::schedule_fiber(waiter.fiber().clone());
    }
}

/// Parks the calling fiber until some waker calls [`Waiter::wake`] (or the
/// `enable_wake_ups` race resolves in the fiber's own favor), returning the
/// reason it was woken. `switch` performs the actual
/// `context_switch_and_call` into the worker's scheduler context with
/// `enable_wake_ups` as the post-switch callback; it is supplied by the
/// caller (mutex/cond/sem/timer code) because only they know which worker
/// context to switch into.
///
/// `yield_self` is invoked in a loop while the wait bits remain set after
/// resumption, matching the caller-side protocol's step 5 "spin until the
/// losing party finishes its release stores" guard; in practice this loop
/// runs zero or one iterations.
pub(crate) fn park(
    waiter: &Waiter,
    switch: impl FnOnce(),
    mut yield_self: impl FnMut(),
) -> WakeReason {
    waiter.arm_post_bit();
    // The fiber is still counted in `num_run_fibers` up to this point; drop
    // it before the switch that actually parks the fiber so the count
    // reflects reality while parked. `wake_push` (on whichever side wins the
    // handshake race) re-increments it when the fiber is pushed back onto a
    // run queue.
    crate::worker::current_scheduler().dec_run_fibers();
    switch();
    while waiter.is_parked() {
        yield_self();
    }
    waiter.wake_reason()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::test_support::dummy_fiber_ref;

    #[test]
    fn wake_before_enable_wins_the_race() {
        let waiter = Waiter::new(dummy_fiber_ref());
        // Simulate `enable_wake_ups` having already run and found `reason`
        // still NONE (so it skipped the exchange, leaving do_wake == 1).
        waiter.do_wake.store(1, Ordering::SeqCst);
        let result = waiter.wake(WakeReason::Ready);
        assert_eq!(result, WakeResult::SetAndWakeUp);
        assert_eq!(waiter.wake_reason(), WakeReason::Ready);
    }

    #[test]
    fn wake_after_enable_cleared_do_wake_loses_the_race() {
        let waiter = Waiter::new(dummy_fiber_ref());
        // enable_wake_ups ran, saw reason != NONE is false at that time is
        // impossible here since we haven't called wake yet; instead model
        // the case where do_wake was already consumed (e.g. a duplicate
        // wake attempt after the fiber already resumed).
        waiter.do_wake.store(0, Ordering::SeqCst);
        let result = waiter.wake(WakeReason::Ready);
        assert_eq!(result, WakeResult::SetOnly);
    }

    #[test]
    fn double_wake_fails() {
        let waiter = Waiter::new(dummy_fiber_ref());
        waiter.do_wake.store(1, Ordering::SeqCst);
        assert_eq!(waiter.wake(WakeReason::Ready), WakeResult::SetAndWakeUp);
        assert_eq!(waiter.wake(WakeReason::Ready), WakeResult::Failed);
    }
}
