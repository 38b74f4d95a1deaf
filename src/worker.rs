//! Per-thread worker state: the thread-local "current worker, current
//! fiber" pointers every fiber needs after a switch might have moved it to
//! a different worker (spec section 9's "Global mutable state" note), plus
//! the primitives fibers use to switch out into their worker's scheduler
//! context.

use std::cell::{RefCell, UnsafeCell};
use std::os::raw::c_void;

use crate::context::{self, Context};
use crate::fiber::FiberRef;
use crate::queue;
use crate::scheduler::SchedulerHandle;

/// Lehmer/MINSTD RNG used for stealing-variant victim selection: small,
/// fast, and good enough for picking an index.
pub(crate) struct Lehmer(u64);

impl Lehmer {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(48271) % ((1u64 << 31) - 1);
        self.0
    }
}

pub(crate) struct Worker {
    pub id: usize,
    scheduler: SchedulerHandle,
    sched_ctx: UnsafeCell<Context>,
    pub rng: RefCell<Lehmer>,
    qsbr_local_epoch: std::cell::Cell<usize>,
}

impl Worker {
    pub(crate) fn new(id: usize, scheduler: SchedulerHandle) -> Self {
        Self {
            id,
            scheduler,
            sched_ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            rng: RefCell::new(Lehmer::new(id as u64 * 2654435761 + 1)),
            qsbr_local_epoch: std::cell::Cell::new(0),
        }
    }

    /// This worker's slot in the scheduler-owned queue registry — every
    /// worker's queue lives in `Arc<SchedulerInner>` precisely so any other
    /// worker thread can steal from it (spec 4.13 step 5).
    #[cfg(any(
        feature = "stealing_mutex",
        feature = "stealing_bounded_mpmc",
        feature = "stealing_bounded_spmc"
    ))]
    pub(crate) fn local_queue(&self) -> &queue::Local {
        self.scheduler.local_queue(self.id)
    }

    /// Declares this worker quiescent (holds no pointer into an epoll event
    /// array right now) and physically drops whatever batch of deferred
    /// frees that observation completes (spec 4.4).
    pub(crate) fn qsbr_quiescent(&self) {
        let mut local = self.qsbr_local_epoch.get();
        let ready = self.scheduler.qsbr().quiescent(&mut local);
        self.qsbr_local_epoch.set(local);
        drop(ready);
    }

    pub(crate) fn sched_ctx_ptr(&self) -> *mut Context {
        self.sched_ctx.get()
    }

    /// Same pointer as [`sched_ctx_ptr`](Self::sched_ctx_ptr); named
    /// separately so the scheduler main loop (the one legitimate caller of
    /// a raw `context::switch` into this context) reads distinctly from the
    /// switch-and-call call sites elsewhere in this module.
    pub(crate) fn sched_ctx_for_scheduler(&self) -> *mut Context {
        self.sched_ctx.get()
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<*const Worker>> = RefCell::new(None);
}

/// Runs `body` with the thread-local "current worker" set to `worker`,
/// restoring whatever was there before on return. Called once by the
/// scheduler's per-thread entry point for the lifetime of that thread.
pub(crate) fn with_current_worker<R>(worker: &Worker, body: impl FnOnce() -> R) -> R {
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = Some(worker as *const Worker));
    let result = body();
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = None);
    result
}

fn current_worker() -> &'static Worker {
    CURRENT_WORKER.with(|cell| {
        let ptr = cell
            .borrow()
            .unwrap_or_else(|| crate::error::Error::fatal("no current worker on this thread"));
        unsafe { &*ptr }
    })
}

pub(crate) fn current_scheduler() -> SchedulerHandle {
    current_worker().scheduler.clone()
}

/// As [`current_scheduler`], but returns `None` instead of panicking when
/// called off a worker thread (e.g. a [`crate::socket::Socket`] dropped from
/// a unit test with no running scheduler).
pub(crate) fn try_current_scheduler() -> Option<SchedulerHandle> {
    CURRENT_WORKER.with(|cell| {
        cell.borrow()
            .map(|ptr| unsafe { &*ptr }.scheduler.clone())
    })
}

/// The calling thread's worker id, or `None` off a worker thread (e.g. a
/// fiber created via [`crate::scheduler::Scheduler::spawn`] before `run()`
/// has started any worker, which has nowhere local to land and must use the
/// shared fallback queue instead).
pub(crate) fn try_current_worker_id() -> Option<usize> {
    CURRENT_WORKER.with(|cell| cell.borrow().map(|ptr| unsafe { &*ptr }.id))
}

/// Pushes `fiber` onto the current (calling) worker's run queue and wakes a
/// sleeping worker if one is parked, per spec 4.13's "Wake" contract. Used
/// both by the waiter handshake's `enable_wake_ups` (running on the
/// scheduler stack of the worker that parked the fiber) and by any other
/// fiber's wake-side code (running on whichever worker happens to be
/// current at that moment).
pub(crate) fn schedule_fiber(fiber: FiberRef) {
    let worker = current_worker();
    worker.scheduler.wake_push(worker.id, fiber);
}

extern "C" fn run_boxed_closure(arg: *mut c_void) {
    let f: Box<Box<dyn FnOnce()>> = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce()>) };
    (*f)();
}

/// Switches the calling fiber out into its worker's scheduler context,
/// running `post` on the scheduler stack once the switch has committed.
/// Used wherever the spec calls for `context_switch_and_call(..., worker_ctx)`
/// with a specific post-switch action (releasing an `ilock`'s OS lock,
/// re-enqueuing a yielding fiber, publishing a waiter's parked state).
pub(crate) fn park_current_and_then(post: impl FnOnce() + 'static) {
    let fiber = crate::fiber::this_fiber();
    let worker = current_worker();
    let boxed: Box<Box<dyn FnOnce()>> = Box::new(Box::new(post));
    let arg = Box::into_raw(boxed) as *mut c_void;
    unsafe {
        context::switch_and_call(
            arg,
            run_boxed_closure,
            fiber.context_ptr(),
            worker.sched_ctx_ptr(),
        );
    }
}

/// As [`park_current_and_then`], but runs the waiter handshake's
/// `enable_wake_ups` as the post-switch callback instead of an arbitrary
/// closure (it needs the precise atomic choreography in
/// `sync::waiter::enable_wake_ups`, not a boxed closure indirection).
pub(crate) fn park_current_with_waiter(waiter_ptr: *mut c_void) {
    let fiber = crate::fiber::this_fiber();
    let worker = current_worker();
    unsafe {
        context::switch_and_call(
            waiter_ptr,
            crate::sync::waiter::enable_wake_ups,
            fiber.context_ptr(),
            worker.sched_ctx_ptr(),
        );
    }
}

/// Yields the calling fiber: decrements `num_run_fibers`, switches out, and
/// re-enqueues the fiber from the scheduler stack once the switch commits.
pub(crate) fn yield_current() {
    let fiber = crate::fiber::this_fiber();
    let worker = current_worker();
    worker.scheduler.dec_run_fibers();
    park_current_and_then(move || {
        schedule_fiber(fiber);
    });
}

/// Ends the calling fiber: switches out to the scheduler stack and, once
/// committed, drops the library-owned stack (if any), decrements the
/// scheduler's fiber counters, and lets the final `Arc` reference go.
pub(crate) fn exit_current_fiber(
    fiber: FiberRef,
    scheduler: SchedulerHandle,
    _detached: bool,
) -> ! {
    let worker = current_worker();
    crate::fiber::set_current_fiber(None);
    unsafe {
        context::switch_and_call(
            Box::into_raw(Box::new(Box::new(move || {
                scheduler.dec_run_fibers();
                scheduler.dec_fibers();
                drop(fiber);
            }) as Box<dyn FnOnce()>)) as *mut c_void,
            run_boxed_closure,
            // `from` is intentionally the fiber's own (about to be freed)
            // context: this switch never returns to it.
            fiber_context_scratch(),
            worker.sched_ctx_ptr(),
        );
    }
    unreachable!("a fiber's context is never switched back into after exit")
}

// `exit_current_fiber` needs a `from` context to save into, even though
// nothing will ever read it again (the fiber is being destroyed). A
// thread-local scratch context avoids allocating one per exit.
thread_local! {
    static EXIT_SCRATCH: UnsafeCell<Context> = UnsafeCell::new(unsafe { std::mem::zeroed() });
}

fn fiber_context_scratch() -> *mut Context {
    EXIT_SCRATCH.with(|c| c.get())
}
