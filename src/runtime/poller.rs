//! Readiness multiplexer backed by a single epoll instance.
//!
//! Unlike `mio::Poll`, waiting only needs `&self`: every worker thread calls
//! [`Poller::wait`] on the same instance concurrently, and registration
//! changes may be made from any thread while others are blocked in a wait.
//!
//! Connections are registered [`Trigger::EdgeOneshot`], so the kernel hands
//! each arming to exactly one waiter. The worker that received the event
//! re-arms the registration once it has drained the socket.

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Identifies a registration in the events returned by [`Poller::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Readiness a registration is interested in.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);

    pub fn is_readable(self) -> bool {
        self.0 & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READABLE | WRITABLE"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (false, false) => f.write_str("(empty)"),
        }
    }
}

/// How readiness is reported for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Reported on every wait while the condition holds.
    Level,
    /// Reported once per transition to ready.
    Edge,
    /// Edge-triggered and disabled after one delivery until [`Poller::rearm`].
    EdgeOneshot,
}

impl Trigger {
    fn bits(self) -> u32 {
        match self {
            Trigger::Level => 0,
            Trigger::Edge => libc::EPOLLET as u32,
            Trigger::EdgeOneshot => libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
        }
    }
}

/// Failure to add a descriptor to the poller.
#[derive(Debug)]
pub enum RegistrationError {
    /// The descriptor is already registered.
    AlreadyRegistered(RawFd),
    /// The descriptor is closed or cannot be polled.
    InvalidDescriptor(RawFd),
    Io(io::Error),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::AlreadyRegistered(fd) => {
                write!(f, "descriptor {fd} is already registered")
            }
            RegistrationError::InvalidDescriptor(fd) => {
                write!(f, "descriptor {fd} cannot be registered")
            }
            RegistrationError::Io(e) => write!(f, "registration failed: {e}"),
        }
    }
}

impl std::error::Error for RegistrationError {}

impl From<RegistrationError> for io::Error {
    fn from(err: RegistrationError) -> io::Error {
        match err {
            RegistrationError::Io(e) => e,
            RegistrationError::AlreadyRegistered(_) => {
                io::Error::new(io::ErrorKind::AlreadyExists, err)
            }
            RegistrationError::InvalidDescriptor(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
        }
    }
}

/// A single readiness notification.
#[derive(Clone, Copy)]
pub struct Event {
    token: Token,
    flags: u32,
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.flags & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & libc::EPOLLERR as u32 != 0
    }

    /// Peer closed its write side, or the connection hung up entirely.
    pub fn is_read_closed(&self) -> bool {
        self.flags & (libc::EPOLLRDHUP as u32 | libc::EPOLLHUP as u32) != 0
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token)
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .field("read_closed", &self.is_read_closed())
            .finish()
    }
}

/// Reusable batch buffer for [`Poller::wait`].
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(|raw| {
            let flags = raw.events;
            let data = raw.u64;
            Event {
                token: Token(data as usize),
                flags,
            }
        })
    }
}

#[cfg(test)]
impl Events {
    /// Append a raw event, as if the kernel had reported it.
    pub(crate) fn push(&mut self, token: Token, flags: u32) {
        self.inner.push(libc::epoll_event {
            events: flags,
            u64: token.0 as u64,
        });
    }
}

/// The shared epoll instance.
#[derive(Debug)]
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 returned a fresh descriptor we now own.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    /// Add `fd` to the interest list.
    pub fn register(
        &self,
        fd: RawFd,
        token: Token,
        interest: Interest,
        trigger: Trigger,
    ) -> Result<(), RegistrationError> {
        let mut event = Self::event(token, interest, trigger);
        self.ctl(libc::EPOLL_CTL_ADD, fd, &mut event)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EEXIST) => RegistrationError::AlreadyRegistered(fd),
                Some(libc::EBADF) | Some(libc::EPERM) => RegistrationError::InvalidDescriptor(fd),
                _ => RegistrationError::Io(e),
            })
    }

    /// Replace the interest of an existing registration.
    ///
    /// For [`Trigger::EdgeOneshot`] this re-enables delivery; the kernel
    /// re-checks readiness, so data that arrived while disarmed is reported.
    pub fn rearm(
        &self,
        fd: RawFd,
        token: Token,
        interest: Interest,
        trigger: Trigger,
    ) -> io::Result<()> {
        let mut event = Self::event(token, interest, trigger);
        self.ctl(libc::EPOLL_CTL_MOD, fd, &mut event)
    }

    /// Remove `fd` from the interest list. Unknown or closed descriptors are
    /// ignored.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        match self.ctl(libc::EPOLL_CTL_DEL, fd, &mut event) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Block until at least one registration is ready or `timeout` elapses.
    /// `None` waits forever. An interrupted wait yields an empty batch.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a sub-millisecond timeout does not turn into a busy poll.
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
        };

        events.inner.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.inner.as_mut_ptr(),
                events.inner.capacity().min(i32::MAX as usize) as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        // SAFETY: the kernel initialized the first `n` entries.
        unsafe { events.inner.set_len(n as usize) };
        Ok(n as usize)
    }

    fn event(token: Token, interest: Interest, trigger: Trigger) -> libc::epoll_event {
        libc::epoll_event {
            events: interest.bits() | trigger.bits(),
            u64: token.0 as u64,
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: &mut libc::epoll_event) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
