//! Non-blocking sockets integrated with the reactor (spec 4.11).
//!
//! Each direction (read/write) is owned by at most one fiber at a time; the
//! fiber currently blocked in that direction publishes a pointer to its own
//! stack-local [`Waiter`] so [`Socket`]'s [`IoSource`] impl can wake it when
//! the reactor observes readiness, a hangup, or an error on the underlying
//! fd.

use std::net::SocketAddr;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::reactor::{Interest, IoSource};
use crate::sync::waiter::{WakeReason, WakeResult, Waiter};
use crate::time::deadline_from;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct SocketInner {
    fd: RawFd,
    read_registered: AtomicBool,
    write_registered: AtomicBool,
    read_waiter: AtomicPtr<Waiter>,
    write_waiter: AtomicPtr<Waiter>,
    sticky_error: AtomicBool,
    closed: AtomicBool,
}

// Safety: the pointers in `read_waiter`/`write_waiter` are only ever
// dereferenced (by `IoSource` callbacks running on a worker thread) while
// the fiber that published them is still parked inside `blocking_op` below,
// which is the only place that ever stores or clears them.
unsafe impl Send for SocketInner {}
unsafe impl Sync for SocketInner {}

impl IoSource for SocketInner {
    fn on_readable(&self) {
        wake_direction(&self.read_waiter);
    }

    fn on_writable(&self) {
        wake_direction(&self.write_waiter);
    }

    fn on_error(&self) {
        self.sticky_error.store(true, Ordering::Release);
        wake_direction(&self.read_waiter);
        wake_direction(&self.write_waiter);
    }
}

fn wake_direction(slot: &AtomicPtr<Waiter>) {
    let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        return;
    }
    let waiter = unsafe { &*ptr };
    if let WakeResult::SetAndWakeUp = waiter.wake(WakeReason::Ready) {
        crate::worker::schedule_fiber(waiter.fiber().clone());
    }
}

fn would_block(err: &Error) -> bool {
    matches!(err, Error::Socket(e) if matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINPROGRESS
    ))
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// A non-blocking socket whose blocking-looking operations park the calling
/// fiber instead of the worker thread underneath it.
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Opens a new socket of the given address family/type (spec's
    /// `socket.open`), e.g. `Socket::open(libc::AF_INET, libc::SOCK_STREAM)`.
    pub fn open(domain: i32, ty: i32) -> Result<Self> {
        let fd = unsafe { libc::socket(domain, ty, 0) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        set_nonblocking(fd)?;
        Ok(Self::from_raw_fd(fd))
    }

    fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                fd,
                read_registered: AtomicBool::new(false),
                write_registered: AtomicBool::new(false),
                read_waiter: AtomicPtr::new(ptr::null_mut()),
                write_waiter: AtomicPtr::new(ptr::null_mut()),
                sticky_error: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn native_handle(&self) -> RawFd {
        self.inner.fd
    }

    pub fn set_opt(&self, level: i32, name: i32, value: i32) -> Result<()> {
        let value = value as libc::c_int;
        if unsafe {
            libc::setsockopt(
                self.inner.fd,
                level,
                name,
                &value as *const _ as *const c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn bind(&self, addr: &SocketAddr) -> Result<()> {
        let (storage, len) = sockaddr_from(addr);
        if unsafe { libc::bind(self.inner.fd, &storage as *const _ as *const libc::sockaddr, len) } < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        if unsafe { libc::listen(self.inner.fd, backlog) } < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn accept(&self) -> Result<Socket> {
        blocking_op(&self.inner, Direction::Read, None, || self.try_accept())
    }

    pub fn accept_for(&self, timeout: Duration) -> Result<Socket> {
        self.accept_until(deadline_from(timeout)?)
    }

    pub fn accept_until(&self, deadline: Instant) -> Result<Socket> {
        blocking_op(&self.inner, Direction::Read, Some(deadline), || self.try_accept())
    }

    fn try_accept(&self) -> Result<Socket> {
        let fd = unsafe {
            libc::accept4(
                self.inner.fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self::from_raw_fd(fd))
    }

    /// Non-blocking connect: if the kernel reports `EINPROGRESS`, waits for
    /// the socket to become writable, then inspects `SO_ERROR`.
    pub fn connect(&self, addr: &SocketAddr) -> Result<()> {
        self.connect_until_inner(addr, None)
    }

    pub fn connect_for(&self, addr: &SocketAddr, timeout: Duration) -> Result<()> {
        self.connect_until_inner(addr, Some(deadline_from(timeout)?))
    }

    pub fn connect_until(&self, addr: &SocketAddr, deadline: Instant) -> Result<()> {
        self.connect_until_inner(addr, Some(deadline))
    }

    fn connect_until_inner(&self, addr: &SocketAddr, deadline: Option<Instant>) -> Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe {
            libc::connect(self.inner.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        blocking_op(&self.inner, Direction::Write, deadline, || self.check_connect_error())
    }

    fn check_connect_error(&self) -> Result<()> {
        let mut errno: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        if unsafe {
            libc::getsockopt(
                self.inner.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errno as *mut _ as *mut c_void,
                &mut len,
            )
        } < 0
        {
            return Err(Error::last_os_error());
        }
        if errno == 0 {
            Ok(())
        } else {
            Err(Error::Socket(std::io::Error::from_raw_os_error(errno)))
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        blocking_op(&self.inner, Direction::Read, None, || self.try_read(buf))
    }

    pub fn read_for(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_until(buf, deadline_from(timeout)?)
    }

    pub fn read_until(&self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        blocking_op(&self.inner, Direction::Read, Some(deadline), || self.try_read(buf))
    }

    fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::read(self.inner.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        blocking_op(&self.inner, Direction::Write, None, || self.try_write(buf))
    }

    pub fn write_for(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.write_until(buf, deadline_from(timeout)?)
    }

    pub fn write_until(&self, buf: &[u8], deadline: Instant) -> Result<usize> {
        blocking_op(&self.inner, Direction::Write, Some(deadline), || self.try_write(buf))
    }

    fn try_write(&self, buf: &[u8]) -> Result<usize> {
        let n = unsafe { libc::write(self.inner.fd, buf.as_ptr() as *const c_void, buf.len()) };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Unregisters and closes the underlying fd. Idempotent. With more than
    /// one worker the actual `close(2)` is deferred through QSBR, since a
    /// concurrent worker's epoll event array may still reference this fd's
    /// `Arc<dyn IoSource>` entry; with exactly one worker nobody else can be
    /// holding such a reference, so it closes immediately (spec 4.11's
    /// "unless only one worker exists").
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(scheduler) = crate::worker::try_current_scheduler() else {
            // No scheduler running (e.g. a socket opened and dropped from a
            // plain unit test): nothing could hold a concurrent reference
            // into a reactor we were never registered with.
            unsafe {
                libc::close(self.inner.fd);
            }
            return;
        };
        scheduler.reactor().unregister(self.inner.fd);
        let qsbr = scheduler.qsbr();
        if qsbr.single_threaded() {
            unsafe {
                libc::close(self.inner.fd);
            }
        } else {
            let fd = self.inner.fd;
            qsbr.free(Box::new(FdCloser(fd)));
        }
    }
}

struct FdCloser(RawFd);

impl Drop for FdCloser {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.close();
        }
    }
}

fn blocking_op<T>(
    inner: &Arc<SocketInner>,
    direction: Direction,
    deadline: Option<Instant>,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    match attempt() {
        Ok(v) => return Ok(v),
        Err(e) if would_block(&e) => {}
        Err(e) => return Err(e),
    }

    loop {
        if inner.sticky_error.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset);
        }
        ensure_registered(inner, direction)?;

        let fiber = crate::fiber::this_fiber();
        let waiter = Waiter::new(fiber);
        let slot = match direction {
            Direction::Read => &inner.read_waiter,
            Direction::Write => &inner.write_waiter,
        };
        slot.store(&waiter as *const Waiter as *mut Waiter, Ordering::Release);

        let timed_out = match deadline {
            None => {
                let waiter_ptr = &waiter as *const Waiter as *mut c_void;
                crate::sync::waiter::park(
                    &waiter,
                    || crate::worker::park_current_with_waiter(waiter_ptr),
                    || crate::fiber::yield_now(),
                );
                false
            }
            Some(d) => match crate::timers::timed_wait(&waiter, d) {
                Ok(()) => false,
                Err(Error::TimedOut) => true,
                Err(e) => return Err(e),
            },
        };

        slot.store(ptr::null_mut(), Ordering::Release);

        if timed_out {
            return Err(Error::TimedOut);
        }

        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) if would_block(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn ensure_registered(inner: &Arc<SocketInner>, direction: Direction) -> Result<()> {
    match direction {
        Direction::Read => inner.read_registered.store(true, Ordering::Release),
        Direction::Write => inner.write_registered.store(true, Ordering::Release),
    }
    let interest = Interest {
        read: inner.read_registered.load(Ordering::Acquire),
        write: inner.write_registered.load(Ordering::Acquire),
    };
    let source: Arc<dyn IoSource> = inner.clone();
    crate::worker::current_scheduler()
        .reactor()
        .register(inner.fd, source, interest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_round_trip_does_not_panic() {
        let sock = Socket::open(libc::AF_INET, libc::SOCK_STREAM).unwrap();
        assert!(sock.native_handle() >= 0);
        // `close` needs a current scheduler to reach the reactor/qsbr;
        // exercised end-to-end in the scheduler-level integration tests.
    }

    #[test]
    fn would_block_recognizes_eagain_and_einprogress() {
        let eagain = Error::Socket(std::io::Error::from_raw_os_error(libc::EAGAIN));
        let einprogress = Error::Socket(std::io::Error::from_raw_os_error(libc::EINPROGRESS));
        let reset = Error::Socket(std::io::Error::from_raw_os_error(libc::ECONNRESET));
        assert!(would_block(&eagain));
        assert!(would_block(&einprogress));
        assert!(!would_block(&reset));
    }
}
