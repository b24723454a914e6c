//! Accept loop for the shared listener.
//!
//! The listener is registered one-shot like every connection, so a single
//! worker drains the backlog and re-arms it afterwards. When the process runs
//! out of descriptors the listener is left disarmed for [`ACCEPT_BACKOFF`]
//! instead of waking every worker in a loop it cannot make progress in.

use crate::runtime::connection::{Connection, LISTENER_TOKEN};
use crate::runtime::poller::{Interest, Trigger};
use crate::runtime::socket::set_nonblocking;
use crate::runtime::Shared;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Consecutive unexpected accept failures before a pass gives up.
const MAX_ACCEPT_FAILURES: usize = 16;

/// How long accepting stays paused after descriptor exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Pause state for the listener, shared by all workers.
#[derive(Debug, Default)]
pub(crate) struct AcceptPause {
    paused: AtomicBool,
    until: Mutex<Option<Instant>>,
}

impl AcceptPause {
    pub fn pause(&self, backoff: Duration) {
        *self.until.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + backoff);
        self.paused.store(true, Ordering::Release);
    }

    /// Time left until accepting resumes, or `None` if it is not paused.
    pub fn remaining(&self) -> Option<Duration> {
        if !self.paused.load(Ordering::Acquire) {
            return None;
        }
        let until = *self.until.lock().unwrap_or_else(PoisonError::into_inner);
        until.map(|until| until.saturating_duration_since(Instant::now()))
    }

    /// Clear an expired pause. Exactly one caller per pause gets `true`.
    pub fn take_expired(&self) -> bool {
        if !self.paused.load(Ordering::Acquire) {
            return false;
        }
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        match *until {
            Some(deadline) if Instant::now() >= deadline => {
                *until = None;
                self.paused.store(false, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

/// Accept until the listener reports would-block, then re-arm it.
///
/// Returns the number of connections registered. Accept failures are logged
/// and never end the worker; only a failure to re-arm the listener does.
pub(crate) fn accept_pending(shared: &Shared, worker_id: usize) -> io::Result<usize> {
    let mut registered = 0;
    let mut failures = 0;

    loop {
        let accepted = shared.listener.accept();
        if accepted.is_ok() {
            failures = 0;
        }

        match accepted {
            Ok((stream, peer)) => match admit(shared, stream, peer, worker_id) {
                Ok(true) => registered += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    worker = worker_id,
                    peer = %peer,
                    error = %e,
                    "Failed to register connection"
                ),
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                debug!(worker = worker_id, error = %e, "Accept interrupted, retrying");
                continue;
            }
            Err(e) if out_of_resources(&e) => {
                warn!(
                    worker = worker_id,
                    error = %e,
                    backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                    "Accept failed, pausing accepts"
                );
                // Listener stays disarmed until the pause expires.
                shared.accept_pause.pause(ACCEPT_BACKOFF);
                return Ok(registered);
            }
            Err(e) => {
                warn!(worker = worker_id, error = %e, "Accept failed");
                failures += 1;
                if failures >= MAX_ACCEPT_FAILURES {
                    break;
                }
            }
        }
    }

    rearm_listener(shared)?;
    Ok(registered)
}

/// Re-arm the listener once an accept pause has run out.
pub(crate) fn resume_if_expired(shared: &Shared, worker_id: usize) -> io::Result<()> {
    if shared.accept_pause.take_expired() {
        debug!(worker = worker_id, "Resuming accepts");
        rearm_listener(shared)?;
    }
    Ok(())
}

fn rearm_listener(shared: &Shared) -> io::Result<()> {
    shared.poller.rearm(
        shared.listener.as_raw_fd(),
        LISTENER_TOKEN,
        Interest::READABLE,
        Trigger::EdgeOneshot,
    )
}

/// Register an accepted stream. `Ok(false)` means it was refused.
fn admit(
    shared: &Shared,
    stream: TcpStream,
    peer: SocketAddr,
    worker_id: usize,
) -> io::Result<bool> {
    set_nonblocking(stream.as_raw_fd())?;
    if shared.settings.nodelay {
        stream.set_nodelay(true)?;
    }

    let fd = stream.as_raw_fd();
    let Some((token, conn)) = shared.registry.insert(Connection::new(stream, peer)) else {
        warn!(worker = worker_id, peer = %peer, "Connection limit reached");
        return Ok(false);
    };

    if let Err(e) = shared
        .poller
        .register(fd, token, Interest::READABLE, Trigger::EdgeOneshot)
    {
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        shared.registry.teardown(token, &mut conn, &shared.poller);
        return Err(e.into());
    }

    debug!(worker = worker_id, token = token.0, peer = %peer, "Accepted connection");
    Ok(true)
}

fn out_of_resources(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
