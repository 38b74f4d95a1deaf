//! Scheduler-level scenarios exercising a real worker pool end to end:
//! nested joins, mutex/semaphore/condition-variable contention across
//! multiple fibers and workers, sleep precision, and an echo server over a
//! loopback socket.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use fevrt::sync::{Cond, Mutex, Semaphore};
use fevrt::{sleep_for, spawn, Fiber, FiberAttr, Scheduler, SchedulerAttr};

fn run_one_worker(body: impl FnOnce() + Send + 'static) {
    let scheduler = Scheduler::new(SchedulerAttr::new().with_num_workers(1)).unwrap();
    scheduler.spawn(FiberAttr::new(), body).unwrap().detach();
    scheduler.run();
}

/// `fib(n)` computed with each recursive call spawning two joinable
/// child fibers; the small `n` here keeps the fiber tree (and the test's
/// wall-clock cost) bounded without changing the shape of the recursion.
fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let left: Fiber<u64> = fevrt::fiber::spawn_with_attr(FiberAttr::new(), move || fib(n - 1)).unwrap();
    let right: Fiber<u64> = fevrt::fiber::spawn_with_attr(FiberAttr::new(), move || fib(n - 2)).unwrap();
    let a = left.join().unwrap();
    let b = right.join().unwrap();
    a + b
}

#[test]
fn fibonacci_via_nested_joinable_fibers() {
    let result = Arc::new(StdMutex::new(None));
    let result_for_fiber = result.clone();
    run_one_worker(move || {
        let value = fib(12);
        *result_for_fiber.lock().unwrap() = Some(value);
    });
    assert_eq!(result.lock().unwrap().take(), Some(144));
}

/// Two fibers handshake over a single condition variable guarding a
/// small piece of shared state, each waiting out the other's turn.
#[test]
fn condition_variable_handshake_between_two_fibers() {
    struct Shared {
        data: Option<String>,
        processed: bool,
    }

    let result = Arc::new(StdMutex::new(None));
    let result_for_fiber = result.clone();

    run_one_worker(move || {
        let mutex = Arc::new(Mutex::new(Shared {
            data: None,
            processed: false,
        }));
        let cond = Arc::new(Cond::new());

        let worker_mutex = mutex.clone();
        let worker_cond = cond.clone();
        let worker = fevrt::fiber::spawn_with_attr(FiberAttr::new(), move || {
            let mut guard = worker_mutex.lock();
            while guard.data.is_none() {
                guard = worker_cond.wait(guard);
            }
            let mut text = guard.data.take().unwrap();
            text.push_str(", world");
            guard.data = Some(text);
            guard.processed = true;
            worker_cond.notify_all();
        });

        {
            let mut guard = mutex.lock();
            guard.data = Some("hello".to_string());
            cond.notify_all();
        }

        worker.detach();

        let mut guard = mutex.lock();
        while !guard.processed {
            guard = cond.wait(guard);
        }
        *result_for_fiber.lock().unwrap() = guard.data.clone();
    });

    assert_eq!(result.lock().unwrap().take().as_deref(), Some("hello, world"));
}

/// `W` workers times `F` fibers each incrementing a shared counter `I`
/// times behind a mutex; the final count must equal `F * I` exactly.
#[test]
fn mutex_stress_across_workers_and_fibers() {
    const WORKERS: u32 = 2;
    const FIBERS: usize = 8;
    const ITERS: usize = 200;

    let scheduler = Scheduler::new(SchedulerAttr::new().with_num_workers(WORKERS)).unwrap();
    let counter = Arc::new(Mutex::new(0usize));

    for _ in 0..FIBERS {
        let counter = counter.clone();
        scheduler
            .spawn(FiberAttr::new(), move || {
                for _ in 0..ITERS {
                    let mut guard = counter.lock();
                    *guard += 1;
                }
            })
            .unwrap()
            .detach();
    }

    scheduler.run();
    assert_eq!(*counter.lock(), FIBERS * ITERS);
}

/// A semaphore initialized to 1, `F` fibers each looping `I` times and
/// alternating between an untimed `wait` and a long-timeout `wait_for` so
/// neither path starves; the final counter still equals `F * I`.
#[test]
fn semaphore_stress_with_timed_and_untimed_waits() {
    const WORKERS: u32 = 2;
    const FIBERS: usize = 8;
    const ITERS: usize = 100;

    let scheduler = Scheduler::new(SchedulerAttr::new().with_num_workers(WORKERS)).unwrap();
    let sem = Arc::new(Semaphore::new(1));
    let counter = Arc::new(AtomicUsize::new(0));

    for i in 0..FIBERS {
        let sem = sem.clone();
        let counter = counter.clone();
        scheduler
            .spawn(FiberAttr::new(), move || {
                for j in 0..ITERS {
                    if (i + j) % 2 == 0 {
                        sem.wait();
                    } else {
                        loop {
                            match sem.wait_for(Duration::from_secs(5)) {
                                Ok(()) => break,
                                Err(fevrt::Error::TimedOut) => continue,
                                Err(e) => panic!("unexpected semaphore error: {e}"),
                            }
                        }
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                    sem.post();
                }
            })
            .unwrap()
            .detach();
    }

    scheduler.run();
    assert_eq!(counter.load(Ordering::Relaxed), FIBERS * ITERS);
}

/// `sleep_for` must never return before the monotonic clock reaches
/// `start + duration`.
#[test]
fn sleep_for_never_returns_early() {
    let elapsed = Arc::new(StdMutex::new(None));
    let elapsed_for_fiber = elapsed.clone();
    let requested = Duration::from_millis(20);

    run_one_worker(move || {
        let start = Instant::now();
        sleep_for(requested).unwrap();
        *elapsed_for_fiber.lock().unwrap() = Some(start.elapsed());
    });

    assert!(elapsed.lock().unwrap().take().unwrap() >= requested);
}

/// A scheduler with only a fiber that immediately exits, and one with a
/// fiber that blocks on a mutex and is then unblocked by a second fiber,
/// must both have their `run()` call return: `num_run_fibers` has to drain
/// back to zero on every exit and every park/wake cycle, or step 6 of the
/// main loop (spec 4.13) never observes `num_fibers == 0` and `run()` hangs.
#[test]
fn scheduler_run_terminates_after_fiber_exits() {
    run_one_worker(|| {});
}

#[test]
fn scheduler_run_terminates_after_mutex_block_and_unblock() {
    let scheduler = Scheduler::new(SchedulerAttr::new().with_num_workers(1)).unwrap();
    let mutex = Arc::new(Mutex::new(0u32));

    // Holds the lock first so the second fiber parks in the waiters queue,
    // then releases it, handing the lock off and unblocking the waiter.
    let holder_mutex = mutex.clone();
    let guard = holder_mutex.lock();

    let waiter_mutex = mutex.clone();
    scheduler
        .spawn(FiberAttr::new(), move || {
            let mut guard = waiter_mutex.lock();
            *guard += 1;
        })
        .unwrap()
        .detach();

    scheduler
        .spawn(FiberAttr::new(), move || {
            drop(guard);
        })
        .unwrap()
        .detach();

    scheduler.run();
    assert_eq!(*mutex.lock(), 1);
}

/// An acceptor fiber spawns one handler fiber per connection; the
/// handler echoes back whatever it reads until the peer half-closes.
#[test]
fn echo_server_round_trip() {
    use fevrt::socket::Socket;

    // Reserve a loopback port with std (no conflicting bind races with other
    // tests), then hand the fd's address to the fiber-aware socket.
    let std_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = std_listener.local_addr().unwrap();
    drop(std_listener);

    let received = Arc::new(StdMutex::new(None));
    let received_for_fiber = received.clone();

    let scheduler = Scheduler::new(SchedulerAttr::new().with_num_workers(2)).unwrap();

    scheduler
        .spawn(FiberAttr::new(), move || {
            let listener = Socket::open(libc::AF_INET, libc::SOCK_STREAM).unwrap();
            listener.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1).unwrap();
            listener.bind(&addr).unwrap();
            listener.listen(16).unwrap();

            let client_addr = addr;
            spawn(move || {
                // `connect` completes at the kernel level as soon as the
                // listening socket's backlog accepts the SYN, independent of
                // whether this fiber's `accept()` has run yet.
                let client = Socket::open(libc::AF_INET, libc::SOCK_STREAM).unwrap();
                client.connect(&client_addr).unwrap();
                client.write(b"hello").unwrap();
                let mut buf = [0u8; 5];
                let mut got = 0;
                while got < buf.len() {
                    let n = client.read(&mut buf[got..]).unwrap();
                    assert!(n > 0, "peer closed before echoing all bytes");
                    got += n;
                }
                client.close();
            })
            .unwrap();

            let conn = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < buf.len() {
                let n = conn.read(&mut buf[got..]).unwrap();
                assert!(n > 0, "client closed before sending all bytes");
                got += n;
            }
            conn.write(&buf).unwrap();
            *received_for_fiber.lock().unwrap() = Some(buf);
            conn.close();
            listener.close();
        })
        .unwrap()
        .detach();

    scheduler.run();
    assert_eq!(received.lock().unwrap().take(), Some(*b"hello"));
}
