//! Architecture-specific register-file save/restore.
//!
//! A [`Context`] is a snapshot of just enough CPU state to resume a stack
//! later: the stack pointer, the callee-saved general purpose registers (the
//! rest are caller-saved and thus already spilled by the compiler before a
//! call), and the two pieces of FPU/SSE state that outlive a single function
//! call (the MXCSR control/status register and the x87 control word).
//!
//! [`switch`] and [`switch_and_call`] are the only two primitives the rest
//! of the crate needs. Everything else (fibers, the waiter handshake, the
//! scheduler main loop) is built in terms of them and never touches a
//! register directly.
//!
//! `switch_and_call` exists for one reason: the three-phase waiter
//! handshake (see [`crate::sync::waiter`]) must publish "this fiber has
//! parked" *after* the stack switch has committed, from the worker's own
//! stack, so that a concurrent waker can never observe a half-saved
//! register file. Running that publish step as a plain function call right
//! after an ordinary `switch` would still execute on the caller's own stack
//! (because the call happens before the switch), which is exactly the race
//! this primitive is designed to avoid.

use std::os::raw::c_void;

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod arch;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod arch;

pub(crate) use arch::Context;

/// Function pointer used for both a fiber's entry trampoline and the
/// post-switch callback of [`switch_and_call`].
pub type EntryFn = extern "C" fn(*mut c_void);

/// Lays out the top of `stack` so that the first [`switch`] or
/// [`switch_and_call`] targeting the returned context starts executing
/// `entry(arg)`. `entry` must never return normally; the caller is expected
/// to terminate the fiber through [`crate::fiber::exit`] instead.
///
/// # Safety
/// `stack` must be a region obtained from [`crate::stack::Stack`] (or
/// otherwise page-aligned and large enough for at least a few stack
/// frames), and must stay alive and unused by anyone else for as long as
/// the returned [`Context`] can still be resumed.
pub unsafe fn init(stack_top: *mut u8, entry: EntryFn, arg: *mut c_void) -> Context {
    arch::init(stack_top, entry, arg)
}

/// Saves the current register file into `from`, then restores `to` and
/// resumes executing there. Returns once some other call to `switch` or
/// `switch_and_call` targets `from` again.
///
/// Acts as a full sequential-consistency barrier with respect to the
/// caller's surrounding atomic operations: nothing may be reordered across
/// a context switch in either direction.
///
/// # Safety
/// `from` and `to` must both be valid, non-aliased contexts belonging to
/// stacks that are not concurrently in use.
#[inline]
pub unsafe fn switch(from: *mut Context, to: *const Context) {
    arch::switch(from, to)
}

/// Identical to [`switch`], except that once `to` has been resumed,
/// `post_fn(arg)` runs *on the destination stack* before the switch
/// "returns" normally to whatever was waiting there. `post_fn` must not
/// access the source stack: by the time it runs, the source context has
/// already been fully saved and may be concurrently resumed by another
/// thread.
///
/// # Safety
/// Same requirements as [`switch`], plus: `post_fn` must be safe to call
/// with `arg` on the destination stack in place of whatever would have run
/// next there.
#[inline]
pub unsafe fn switch_and_call(
    arg: *mut c_void,
    post_fn: EntryFn,
    from: *mut Context,
    to: *const Context,
) {
    arch::switch_and_call(arg, post_fn, from, to)
}
