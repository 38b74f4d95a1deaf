//! Fibers: lightweight cooperatively-scheduled tasks with their own stack.
//!
//! Mirrors the spec's reference-counted fiber model: a [`Fiber`] is a thin
//! handle around an [`Arc`]'d [`FiberInner`]; the run queues and waiters
//! queues move that `Arc` around directly instead of threading an intrusive
//! next-pointer through a separately-owned object, which is the natural
//! Rust rendering of "queues store owning references and pop transfers
//! them" (see `DESIGN.md`).

use std::any::Any;
use std::cell::UnsafeCell;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::context::{self, Context, EntryFn};
use crate::error::{Error, Result};
use crate::scheduler::SchedulerHandle;
use crate::stack::{Stack, DEFAULT_GUARD_SIZE, DEFAULT_STACK_SIZE};
use crate::sync::{Cond, Mutex};

/// Reference-counted handle to a fiber, moved by value through run queues
/// and waiters queues to represent "this fiber is linked into exactly one
/// queue right now".
pub(crate) type FiberRef = Arc<FiberInner>;

bitflags::bitflags! {
    struct Flags: u8 {
        const DEAD     = 0b001;
        const JOINABLE = 0b010;
        const JOINING  = 0b100;
    }
}

struct JoinState {
    return_value: Option<Box<dyn Any + Send>>,
}

pub(crate) struct FiberInner {
    context: UnsafeCell<Context>,
    stack: Stack,
    scheduler: SchedulerHandle,
    flags: AtomicU8,
    join_mutex: Mutex<JoinState>,
    join_cond: Cond,
    start: UnsafeCell<Option<Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>>>,
}

// Safety: `context` and `start` are only ever touched by the worker thread
// currently running this fiber (enforced by the scheduler, never by the
// type system alone, exactly as in the teacher's own raw-pointer fiber
// bookkeeping).
unsafe impl Send for FiberInner {}
unsafe impl Sync for FiberInner {}

impl FiberInner {
    fn is(&self, flag: Flags) -> bool {
        Flags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    fn set(&self, flag: Flags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }
}

/// Stack size, guard size, and detached/joinable configuration for a new
/// fiber.
#[derive(Debug, Clone, Copy)]
pub struct FiberAttr {
    stack_size: usize,
    guard_size: usize,
    detached: bool,
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: DEFAULT_GUARD_SIZE,
            detached: false,
        }
    }
}

impl FiberAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn with_guard_size(mut self, size: usize) -> Self {
        self.guard_size = size;
        self
    }

    pub fn with_detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }
}

/// A joinable fiber handle, parameterized by the type its start function
/// returns. Dropping it without calling [`join`](Fiber::join) detaches the
/// fiber, matching the teacher crate's `JoinHandle` drop behavior.
pub struct Fiber<T = ()> {
    inner: Option<FiberRef>,
    _marker: std::marker::PhantomData<T>,
}

/// Alias for the common case of a detached, `()`-returning fiber handle.
pub type JoinHandle = Fiber<()>;

impl<T> Fiber<T> {
    pub(crate) fn from_inner(inner: FiberRef) -> Self {
        Self {
            inner: Some(inner),
            _marker: std::marker::PhantomData,
        }
    }

    /// Blocks until the fiber exits, returning the value its start function
    /// returned (or was given to [`exit`]).
    pub fn join(mut self) -> Result<T>
    where
        T: 'static,
    {
        let inner = self.inner.take().expect("Fiber already joined or detached");
        let value = join_inner(&inner)?;
        Ok(*value
            .downcast::<T>()
            .unwrap_or_else(|_| Error::fatal("fiber's return value does not match Fiber<T>'s T")))
    }

    /// Releases the second reference without waiting for the fiber to
    /// finish; the fiber cleans itself up entirely on exit.
    pub fn detach(mut self) {
        if let Some(inner) = self.inner.take() {
            detach_inner(&inner);
        }
    }
}

impl<T> Drop for Fiber<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            detach_inner(&inner);
        }
    }
}

fn join_inner(inner: &FiberRef) -> Result<Box<dyn Any + Send>> {
    let current = this_fiber();
    if !Arc::ptr_eq(
        current.scheduler().inner_ptr(),
        inner.scheduler().inner_ptr(),
    ) {
        return Err(Error::InvalidArgument(
            "cannot join a fiber belonging to a different scheduler",
        ));
    }
    if !inner.is(Flags::JOINABLE) || inner.is(Flags::JOINING) {
        return Err(Error::InvalidArgument(
            "fiber is not joinable, or has already been joined",
        ));
    }
    inner.set(Flags::JOINING);

    let mut guard = inner.join_mutex.lock();
    while !inner.is(Flags::DEAD) {
        guard = inner.join_cond.wait(guard);
    }
    let value = guard
        .return_value
        .take()
        .expect("dead fiber must have published a return value");
    drop(guard);
    Ok(value)
}

fn detach_inner(_inner: &FiberRef) {
    // Dropping the last `Arc` clone is enough; `fiber_exit`'s post-switch
    // callback already released the creator's reference count contribution
    // for the detached case.
}

thread_local! {
    static CURRENT_FIBER: UnsafeCell<Option<FiberRef>> = UnsafeCell::new(None);
}

/// Returns a clone of the fiber currently running on this worker thread.
///
/// # Panics
/// Panics (via [`crate::error::fatal`]) if called outside a fiber.
pub fn this_fiber() -> FiberRef {
    CURRENT_FIBER.with(|cell| unsafe {
        (*cell.get())
            .clone()
            .unwrap_or_else(|| Error::fatal("this_fiber() called outside a fiber"))
    })
}

pub(crate) fn set_current_fiber(fiber: Option<FiberRef>) {
    CURRENT_FIBER.with(|cell| unsafe { *cell.get() = fiber });
}

/// Spawns a detached fiber on the current worker's scheduler.
///
/// # Panics
/// Panics if called outside a running scheduler.
pub fn spawn<F>(f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    spawn_with_attr(FiberAttr::new().with_detached(true), f).map(|h: Fiber<()>| h.detach())
}

/// Spawns a joinable fiber with the given attributes on the current
/// worker's scheduler, returning a handle that yields `f`'s return value on
/// [`Fiber::join`].
pub fn spawn_with_attr<F, T>(attr: FiberAttr, f: F) -> Result<Fiber<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let scheduler = crate::worker::current_scheduler();
    create(&scheduler, attr, f)
}

pub(crate) fn create<F, T>(
    scheduler: &SchedulerHandle,
    attr: FiberAttr,
    f: F,
) -> Result<Fiber<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    crate::stack::validate_sizes(attr.stack_size, attr.guard_size)?;
    let stack = Stack::new(attr.stack_size, attr.guard_size)?;
    let mut flags = Flags::empty();
    if !attr.detached {
        flags |= Flags::JOINABLE;
    }

    let boxed_start: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send> =
        Box::new(move || Box::new(f()) as Box<dyn Any + Send>);

    let inner = Arc::new(FiberInner {
        context: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        stack,
        scheduler: scheduler.clone(),
        flags: AtomicU8::new(flags.bits()),
        join_mutex: Mutex::new(JoinState { return_value: None }),
        join_cond: Cond::new(),
        start: UnsafeCell::new(Some(boxed_start)),
    });

    let top = inner.stack.top();
    let arg = Arc::as_ptr(&inner) as *mut c_void;
    // Hold one extra strong reference alive for the trampoline to reclaim
    // (via `Arc::from_raw`) the first time it runs; this is the "refcount
    // = 1 if detached, 2 otherwise" accounting from spec 4.12, expressed as
    // real `Arc` strong counts instead of a hand-rolled integer.
    std::mem::forget(inner.clone());

    let ctx = unsafe { context::init(top, trampoline as EntryFn, arg) };
    unsafe {
        *inner.context.get() = ctx;
    }

    debug!("fiber created, stack_size={}", attr.stack_size);
    scheduler.push_new_fiber(inner.clone());

    Ok(Fiber::from_inner(inner))
}

extern "C" fn trampoline(arg: *mut c_void) {
    // Reclaims the extra strong reference `create` forgot above.
    let inner: FiberRef = unsafe { Arc::from_raw(arg as *const FiberInner) };
    set_current_fiber(Some(inner.clone()));

    let start = unsafe { (*inner.start.get()).take() }.expect("fiber started twice");
    let result = panic::catch_unwind(AssertUnwindSafe(start));
    let value = result.unwrap_or_else(|_| Box::new(()) as Box<dyn Any + Send>);

    exit(value);
    Error::fatal("fiber entry point returned past exit()");
}

/// Ends the calling fiber, publishing `value` for a joiner and switching
/// back into the worker's scheduler context. Never returns.
pub(crate) fn exit(value: Box<dyn Any + Send>) -> ! {
    let inner = this_fiber();
    trace!("fiber exiting");
    {
        let mut guard = inner.join_mutex.lock();
        guard.return_value = Some(value);
        inner.set(Flags::DEAD);
        inner.join_cond.notify_all();
    }

    let scheduler = inner.scheduler().clone();
    let detached = !inner.is(Flags::JOINABLE);
    // Drop our local strong reference before switching away: the run
    // queues/join machinery hold the only references a joinable fiber needs
    // to stay alive; a detached fiber's very last reference is this one, so
    // the `Arc` actually deallocates inside `worker::exit_current_fiber`,
    // on the scheduler stack, after the switch has committed.
    crate::worker::exit_current_fiber(inner, scheduler, detached);
    unreachable!("exit_current_fiber does not return")
}

/// Yields the calling fiber back to the scheduler, letting another runnable
/// fiber make progress before this one resumes.
pub fn yield_now() {
    crate::worker::yield_current();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn dummy_fiber_ref() -> FiberRef {
        Arc::new(FiberInner {
            context: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            stack: unsafe { Stack::from_raw_parts(std::ptr::null_mut(), 0) },
            scheduler: SchedulerHandle::dummy(),
            flags: AtomicU8::new(Flags::JOINABLE.bits()),
            join_mutex: Mutex::new(JoinState { return_value: None }),
            join_cond: Cond::new(),
            start: UnsafeCell::new(None),
        })
    }
}
