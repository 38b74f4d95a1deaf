//! The scheduler: worker threads, run-queue distribution, sleep/wake
//! protocol, and termination detection (spec 4.13).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle as ThreadHandle;

use log::{debug, trace, warn};

use crate::fiber::{self, Fiber, FiberAttr, FiberRef};
use crate::queue::{self, STEAL_COUNT};
use crate::reactor::Reactor;
use crate::sync::qsbr::Qsbr;
use crate::timers::Timers;
use crate::worker::Worker;

/// How many local-queue pops a worker attempts before checking the poller,
/// reset to the current `num_run_fibers` every time the poller is polled
/// (spec 4.13 step 4).
const POLLER_BACKOFF_FLOOR: usize = 1;

/// A simple counting semaphore blocking OS threads (not fibers): the
/// "per-scheduler thread semaphore" spec 4.13 uses to wake sleeping
/// workers. Distinct from [`crate::sync::Semaphore`], which parks fibers.
struct ThreadSemaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl ThreadSemaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n > 1 {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

pub(crate) struct SchedulerInner {
    num_workers: usize,
    #[cfg(any(
        feature = "shared_mutex",
        feature = "shared_simple_mpmc",
        feature = "shared_bounded_mpmc"
    ))]
    shared: queue::Shared,
    /// One run queue per worker, indexed by worker id — lives here (not on
    /// `Worker` itself) so that a stealing worker can reach into a victim's
    /// queue through the same `Arc<SchedulerInner>` everyone already holds.
    #[cfg(any(
        feature = "stealing_mutex",
        feature = "stealing_bounded_mpmc",
        feature = "stealing_bounded_spmc"
    ))]
    worker_queues: Vec<queue::Local>,
    fallback: queue::Fallback,
    reactor: Reactor,
    timers: Timers,
    qsbr: Qsbr,
    thread_sem: ThreadSemaphore,
    num_fibers: AtomicUsize,
    num_run_fibers: AtomicUsize,
    num_waiting: AtomicUsize,
    poller_waiting: AtomicBool,
    started: AtomicBool,
}

/// A cheap, `Clone`-able handle to the scheduler, held by every fiber and
/// worker so they can push/pop/wake without threading a reference through
/// every call site.
#[derive(Clone)]
pub(crate) struct SchedulerHandle(Arc<SchedulerInner>);

impl SchedulerHandle {
    pub(crate) fn inner_ptr(&self) -> &Arc<SchedulerInner> {
        &self.0
    }

    pub(crate) fn timers(&self) -> &Timers {
        &self.0.timers
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.0.reactor
    }

    pub(crate) fn qsbr(&self) -> &Qsbr {
        &self.0.qsbr
    }

    pub(crate) fn dec_run_fibers(&self) {
        self.0.num_run_fibers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_fibers(&self) {
        self.0.num_fibers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn push_new_fiber(&self, fiber: FiberRef) {
        self.0.num_fibers.fetch_add(1, Ordering::AcqRel);
        self.push_and_wake(crate::worker::try_current_worker_id(), fiber);
    }

    /// Pushes `fiber` onto `pushing_worker`'s queue (stealing variants) or
    /// the shared queue, then wakes at most one sleeper — the "Wake"
    /// contract in spec 4.13.
    pub(crate) fn wake_push(&self, pushing_worker: usize, fiber: FiberRef) {
        self.push_and_wake(Some(pushing_worker), fiber);
    }

    fn push_and_wake(&self, worker_id: Option<usize>, fiber: FiberRef) {
        self.push(worker_id, fiber);
        self.0.num_run_fibers.fetch_add(1, Ordering::AcqRel);
        if self.0.num_waiting.load(Ordering::Acquire) > 0 {
            self.0.reactor.interrupt();
            self.0.thread_sem.post(1);
        }
    }

    #[cfg(any(
        feature = "shared_mutex",
        feature = "shared_simple_mpmc",
        feature = "shared_bounded_mpmc"
    ))]
    fn push(&self, _worker_id: Option<usize>, fiber: FiberRef) {
        self.0.shared.push(fiber);
    }

    #[cfg(any(
        feature = "stealing_mutex",
        feature = "stealing_bounded_mpmc",
        feature = "stealing_bounded_spmc"
    ))]
    fn push(&self, worker_id: Option<usize>, fiber: FiberRef) {
        match worker_id {
            // A fiber created or woken from inside a running worker lands on
            // that worker's own queue, the whole point of the stealing
            // variants — a different worker only ever touches it by
            // stealing, not by every push going through a shared lock.
            Some(id) => {
                if let Err(fiber) = queue::local_push(&self.0.worker_queues[id], fiber) {
                    self.0.fallback.push(fiber);
                }
            }
            // No worker context exists yet for fibers spawned before `run()`
            // starts any threads; land those on the fallback list, which
            // every worker's main loop drains on each poller poll (spec
            // 4.13 step 4).
            None => self.0.fallback.push(fiber),
        }
    }

    #[cfg(any(
        feature = "stealing_mutex",
        feature = "stealing_bounded_mpmc",
        feature = "stealing_bounded_spmc"
    ))]
    pub(crate) fn local_queue(&self, worker_id: usize) -> &queue::Local {
        &self.0.worker_queues[worker_id]
    }

    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        Self(Arc::new(SchedulerInner {
            num_workers: 1,
            #[cfg(any(
                feature = "shared_mutex",
                feature = "shared_simple_mpmc",
                feature = "shared_bounded_mpmc"
            ))]
            shared: queue::new_shared(),
            #[cfg(any(
                feature = "stealing_mutex",
                feature = "stealing_bounded_mpmc",
                feature = "stealing_bounded_spmc"
            ))]
            worker_queues: queue::new_locals(1),
            fallback: queue::Fallback::new(),
            reactor: Reactor::new_for_test(),
            timers: Timers::new(),
            qsbr: Qsbr::new(1),
            thread_sem: ThreadSemaphore::new(),
            num_fibers: AtomicUsize::new(0),
            num_run_fibers: AtomicUsize::new(0),
            num_waiting: AtomicUsize::new(0),
            poller_waiting: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }))
    }
}

/// Scheduler construction attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerAttr {
    num_workers: u32,
}

impl SchedulerAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0 means "use the number of online processors".
    pub fn with_num_workers(mut self, n: u32) -> Self {
        self.num_workers = n;
        self
    }
}

/// A process-wide runtime instance: a worker pool plus its reactor and
/// timers. Create once, optionally [`spawn`](Scheduler::spawn) initial
/// fibers, then call [`run`](Scheduler::run), which blocks until every
/// fiber has exited.
pub struct Scheduler {
    handle: SchedulerHandle,
}

impl Scheduler {
    pub fn new(attr: SchedulerAttr) -> crate::Result<Self> {
        let num_workers = if attr.num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            attr.num_workers as usize
        };

        let inner = SchedulerInner {
            num_workers,
            #[cfg(any(
                feature = "shared_mutex",
                feature = "shared_simple_mpmc",
                feature = "shared_bounded_mpmc"
            ))]
            shared: queue::new_shared(),
            #[cfg(any(
                feature = "stealing_mutex",
                feature = "stealing_bounded_mpmc",
                feature = "stealing_bounded_spmc"
            ))]
            worker_queues: queue::new_locals(num_workers),
            fallback: queue::Fallback::new(),
            reactor: Reactor::new()?,
            timers: Timers::new(),
            qsbr: Qsbr::new(num_workers),
            thread_sem: ThreadSemaphore::new(),
            num_fibers: AtomicUsize::new(0),
            num_run_fibers: AtomicUsize::new(0),
            num_waiting: AtomicUsize::new(0),
            poller_waiting: AtomicBool::new(false),
            started: AtomicBool::new(false),
        };

        debug!("scheduler created with {} workers", num_workers);
        Ok(Self {
            handle: SchedulerHandle(Arc::new(inner)),
        })
    }

    /// Creates a joinable fiber on this (not-yet-running) scheduler.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] if the scheduler is
    /// already running — use [`fiber::spawn_with_attr`] from inside a
    /// fiber instead.
    pub fn spawn<F, T>(&self, attr: FiberAttr, f: F) -> crate::Result<Fiber<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.handle.0.started.load(Ordering::Acquire) {
            return Err(crate::Error::InvalidArgument(
                "Scheduler::spawn can only create fibers before run() starts; \
                 spawn from inside a fiber once it is running",
            ));
        }
        fiber::create(&self.handle, attr, f)
    }

    /// Runs every worker thread until no fibers remain, then returns.
    pub fn run(self) {
        let inner = &self.handle.0;
        inner.started.store(true, Ordering::Release);
        let num_workers = inner.num_workers;

        let threads: Vec<ThreadHandle<()>> = (0..num_workers)
            .map(|id| {
                let handle = self.handle.clone();
                std::thread::Builder::new()
                    .name(format!("fevrt-worker-{id}"))
                    .spawn(move || worker_main(id, handle))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        for t in threads {
            let _ = t.join();
        }
        debug!("scheduler run() returning, all workers joined");
    }
}

fn worker_main(id: usize, handle: SchedulerHandle) {
    let worker = Worker::new(id, handle.clone());
    crate::worker::with_current_worker(&worker, || main_loop(id, &handle, &worker));
}

fn main_loop(id: usize, handle: &SchedulerHandle, worker: &Worker) {
    let inner = &handle.0;
    let mut poller_backoff: usize = POLLER_BACKOFF_FLOOR;

    loop {
        // Step 1-3: drain local/shared work until the backoff counter runs out.
        while poller_backoff > 0 {
            match pop_runnable(inner, worker) {
                Some(fiber) => {
                    run_fiber(handle, worker, fiber);
                    poller_backoff = poller_backoff.saturating_sub(1);
                }
                None => break,
            }
        }

        // Step 4: non-blocking poll, refill from fallback, reset backoff.
        inner.reactor.check(&inner.timers);
        worker.qsbr_quiescent();
        drain_fallback_into_local(inner, worker);
        poller_backoff = inner.num_run_fibers.load(Ordering::Acquire).max(POLLER_BACKOFF_FLOOR);
        if inner.num_run_fibers.load(Ordering::Acquire) > 0 {
            continue;
        }

        // Step 5: try to steal from another worker.
        if try_steal(inner, worker) {
            continue;
        }

        // Step 6: termination check.
        if inner.num_fibers.load(Ordering::Acquire) == 0 {
            trace!("worker {id} observes num_fibers == 0, terminating scheduler");
            inner.reactor.interrupt();
            inner.thread_sem.post(inner.num_workers);
            return;
        }

        // Step 7: park.
        inner.num_waiting.fetch_add(1, Ordering::AcqRel);
        let was_poller = !inner
            .poller_waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err();
        if was_poller {
            inner.reactor.wait(&inner.timers);
            inner.poller_waiting.store(false, Ordering::Release);
        } else {
            inner.thread_sem.wait();
        }
        inner.num_waiting.fetch_sub(1, Ordering::AcqRel);

        if inner.num_fibers.load(Ordering::Acquire) == 0 {
            return;
        }
        poller_backoff = POLLER_BACKOFF_FLOOR;
    }
}

fn run_fiber(handle: &SchedulerHandle, worker: &Worker, fiber: FiberRef) {
    let ctx = fiber.context_ptr();
    fiber::set_current_fiber(Some(fiber));
    unsafe {
        crate::context::switch(worker_sched_ctx(worker), ctx);
    }
    let _ = handle;
}

// `Worker::sched_ctx` is private to keep external code from switching into
// it directly; the scheduler main loop is the one legitimate caller.
fn worker_sched_ctx(worker: &Worker) -> *mut crate::context::Context {
    worker.sched_ctx_for_scheduler()
}

#[cfg(any(
    feature = "shared_mutex",
    feature = "shared_simple_mpmc",
    feature = "shared_bounded_mpmc"
))]
fn pop_runnable(inner: &SchedulerInner, _worker: &Worker) -> Option<FiberRef> {
    inner.shared.pop()
}

#[cfg(any(
    feature = "stealing_mutex",
    feature = "stealing_bounded_mpmc",
    feature = "stealing_bounded_spmc"
))]
fn pop_runnable(_inner: &SchedulerInner, worker: &Worker) -> Option<FiberRef> {
    worker.local_queue().pop()
}

#[cfg(any(
    feature = "shared_mutex",
    feature = "shared_simple_mpmc",
    feature = "shared_bounded_mpmc"
))]
fn drain_fallback_into_local(_inner: &SchedulerInner, _worker: &Worker) {
    // Shared variants have no per-worker capacity limit to spill from.
}

#[cfg(any(
    feature = "stealing_mutex",
    feature = "stealing_bounded_mpmc",
    feature = "stealing_bounded_spmc"
))]
fn drain_fallback_into_local(inner: &SchedulerInner, worker: &Worker) {
    while let Some(fiber) = inner.fallback.pop() {
        if let Err(fiber) = queue::local_push(worker.local_queue(), fiber) {
            inner.fallback.push(fiber);
            break;
        }
    }
}

#[cfg(any(
    feature = "shared_mutex",
    feature = "shared_simple_mpmc",
    feature = "shared_bounded_mpmc"
))]
fn try_steal(_inner: &SchedulerInner, _worker: &Worker) -> bool {
    false
}

#[cfg(any(
    feature = "stealing_mutex",
    feature = "stealing_bounded_mpmc",
    feature = "stealing_bounded_spmc"
))]
fn try_steal(inner: &SchedulerInner, worker: &Worker) -> bool {
    if inner.num_workers <= 1 {
        return false;
    }
    let victim = {
        let mut rng = worker.rng.borrow_mut();
        (rng.next() as usize) % (inner.num_workers - 1)
    };
    let victim = if victim >= worker.id { victim + 1 } else { victim };
    let stolen = inner_steal_from(inner, victim);
    if stolen.is_empty() {
        return false;
    }
    trace!(
        "worker {} stole {} fiber(s) from worker {victim}",
        worker.id,
        stolen.len()
    );
    for f in stolen {
        if let Err(f) = queue::local_push(worker.local_queue(), f) {
            inner.fallback.push(f);
        }
    }
    true
}

/// Pops up to [`STEAL_COUNT`] fibers straight out of `victim`'s local queue
/// (spec 4.13 step 5). Falls back to the shared overflow list too, since a
/// victim whose own queue is momentarily empty may still have fibers parked
/// there after a bounded-queue spill.
#[cfg(any(
    feature = "stealing_mutex",
    feature = "stealing_bounded_mpmc",
    feature = "stealing_bounded_spmc"
))]
fn inner_steal_from(inner: &SchedulerInner, victim: usize) -> Vec<FiberRef> {
    let mut batch = Vec::with_capacity(STEAL_COUNT);
    let victim_queue = &inner.worker_queues[victim];
    while batch.len() < STEAL_COUNT {
        match victim_queue.pop() {
            Some(f) => batch.push(f),
            None => break,
        }
    }
    while batch.len() < STEAL_COUNT {
        match inner.fallback.pop() {
            Some(f) => batch.push(f),
            None => break,
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_defaults_to_auto_worker_count() {
        let attr = SchedulerAttr::new();
        assert_eq!(attr.num_workers, 0);
    }
}
