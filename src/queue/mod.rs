//! Run-queue storage: five mutually exclusive variants selected at compile
//! time via Cargo features, per spec section 3's "Run-queues" data model.
//!
//! - `shared_mutex` / `shared_simple_mpmc` / `shared_bounded_mpmc`: one
//!   queue shared by every worker.
//! - `stealing_mutex` / `stealing_bounded_mpmc` / `stealing_bounded_spmc`:
//!   one queue per worker, plus a shared fallback list; idle workers steal
//!   from a randomly chosen victim.
//!
//! The scheduler and worker code depend only on the type aliases below, not
//! on which variant is active — matching the spec's claim that "the
//! scheduler's contracts do not depend on which variant is picked".

mod bounded_mpmc;
mod bounded_spmc;
mod ms_queue;
mod mutex_queue;
mod node_pool;
mod tagged;
mod treiber_stack;

use std::cell::RefCell;

use crate::fiber::FiberRef;

pub(crate) use mutex_queue::MutexQueue;

/// Overflow list used whenever a bounded queue variant is full. Always
/// present regardless of which variant is selected, since even the
/// unbounded Michael-Scott variant's `push_stq` signature must match.
pub(crate) type Fallback = MutexQueue<FiberRef>;

/// A Michael-Scott queue specialized to [`FiberRef`], with its node cache
/// held in a thread-local so repeated push/pop on the same worker thread
/// doesn't touch the global node pool.
pub(crate) struct SharedMsQueue {
    queue: ms_queue::MsQueue<FiberRef>,
}

thread_local! {
    static MS_CACHE: RefCell<Option<ms_queue::Cache<FiberRef>>> = RefCell::new(None);
}

impl SharedMsQueue {
    pub fn new() -> Self {
        Self {
            queue: ms_queue::MsQueue::new(),
        }
    }

    fn with_cache<R>(&self, f: impl FnOnce(&ms_queue::Cache<FiberRef>) -> R) -> R {
        MS_CACHE.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                *slot = Some(ms_queue::new_cache());
            }
            f(slot.as_ref().unwrap())
        })
    }

    pub fn push(&self, item: FiberRef) {
        self.with_cache(|cache| self.queue.push(cache, item))
    }

    pub fn pop(&self) -> Option<FiberRef> {
        self.with_cache(|cache| self.queue.pop(cache))
    }

    pub fn push_stq(&self, values: Vec<FiberRef>) -> usize {
        self.with_cache(|cache| self.queue.push_stq(cache, values))
    }
}

/// The single queue instance shared by all workers, active for the
/// `shared_*` feature variants.
#[cfg(feature = "shared_mutex")]
pub(crate) type Shared = MutexQueue<FiberRef>;

#[cfg(feature = "shared_simple_mpmc")]
pub(crate) type Shared = SharedMsQueue;

#[cfg(feature = "shared_bounded_mpmc")]
pub(crate) type Shared = bounded_mpmc::BoundedMpmc<FiberRef>;

/// The per-worker queue, active for the `stealing_*` feature variants. Each
/// worker also has access to a shared [`Fallback`] for overflow and to
/// every other worker's `Local` for stealing.
#[cfg(feature = "stealing_mutex")]
pub(crate) type Local = MutexQueue<FiberRef>;

#[cfg(feature = "stealing_bounded_mpmc")]
pub(crate) type Local = bounded_mpmc::BoundedMpmc<FiberRef>;

#[cfg(feature = "stealing_bounded_spmc")]
pub(crate) type Local = bounded_spmc::BoundedSpmc<FiberRef>;

/// Default capacity for a per-worker bounded local queue.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;

/// How many fibers a stealing worker takes from a victim in one steal.
pub(crate) const STEAL_COUNT: usize = 32;

#[cfg(any(
    feature = "stealing_mutex",
    feature = "stealing_bounded_mpmc",
    feature = "stealing_bounded_spmc"
))]
pub(crate) fn new_local() -> Local {
    #[cfg(feature = "stealing_mutex")]
    {
        MutexQueue::new()
    }
    #[cfg(feature = "stealing_bounded_mpmc")]
    {
        bounded_mpmc::BoundedMpmc::new(LOCAL_QUEUE_CAPACITY)
    }
    #[cfg(feature = "stealing_bounded_spmc")]
    {
        bounded_spmc::BoundedSpmc::new(LOCAL_QUEUE_CAPACITY)
    }
}

/// Builds one [`Local`] queue per worker, indexed by worker id, so the
/// scheduler can own the whole registry up front (in `Arc<SchedulerInner>`,
/// alongside every worker thread) rather than each `Worker` owning a queue
/// no other thread could then steal from.
#[cfg(any(
    feature = "stealing_mutex",
    feature = "stealing_bounded_mpmc",
    feature = "stealing_bounded_spmc"
))]
pub(crate) fn new_locals(num_workers: usize) -> Vec<Local> {
    (0..num_workers.max(1)).map(|_| new_local()).collect()
}

/// Pushes onto a per-worker `Local` queue, normalizing the bounded/unbounded
/// variants' differing `push` signatures to one `Result<(), FiberRef>`
/// contract: `Err` means the queue was full and the fiber should spill into
/// the shared fallback list, per spec 4.3's `push_stq` overflow contract.
#[cfg(feature = "stealing_mutex")]
pub(crate) fn local_push(local: &Local, fiber: FiberRef) -> Result<(), FiberRef> {
    local.push(fiber);
    Ok(())
}

#[cfg(any(feature = "stealing_bounded_mpmc", feature = "stealing_bounded_spmc"))]
pub(crate) fn local_push(local: &Local, fiber: FiberRef) -> Result<(), FiberRef> {
    local.push(fiber)
}

#[cfg(any(feature = "shared_mutex", feature = "shared_simple_mpmc", feature = "shared_bounded_mpmc"))]
pub(crate) fn new_shared() -> Shared {
    #[cfg(feature = "shared_mutex")]
    {
        MutexQueue::new()
    }
    #[cfg(feature = "shared_simple_mpmc")]
    {
        SharedMsQueue::new()
    }
    #[cfg(feature = "shared_bounded_mpmc")]
    {
        bounded_mpmc::BoundedMpmc::new(LOCAL_QUEUE_CAPACITY)
    }
}
