//! Worker loop.
//!
//! Every worker blocks in `wait` on the same poller and handles whatever
//! batch it gets back. There is no affinity between workers and connections:
//! the one-shot registration guarantees only one worker holds a connection's
//! event at a time, and the connection lock covers stale lookups.

use crate::runtime::connection::{Connection, LISTENER_TOKEN};
use crate::runtime::handler::{CloseReason, Outcome};
use crate::runtime::poller::{Event, Events, Token, Trigger};
use crate::runtime::{acceptor, Shared};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::PoisonError;
use tracing::{debug, info, trace};

/// Run one worker until the poller fails.
pub(crate) fn run(worker_id: usize, shared: &Shared) -> io::Result<()> {
    let mut events = Events::with_capacity(shared.settings.max_events);
    info!(worker = worker_id, "Worker started");

    loop {
        // Bounded only while accepting is paused, so someone re-arms the listener.
        let timeout = shared.accept_pause.remaining();
        shared.poller.wait(&mut events, timeout)?;
        acceptor::resume_if_expired(shared, worker_id)?;
        dispatch(worker_id, shared, &events)?;
    }
}

/// Handle one batch of events.
///
/// Only a failure to re-arm the listener is returned; connection errors end
/// that connection.
pub(crate) fn dispatch(worker_id: usize, shared: &Shared, events: &Events) -> io::Result<()> {
    for event in events.iter() {
        match event.token() {
            LISTENER_TOKEN => {
                let accepted = acceptor::accept_pending(shared, worker_id)?;
                if accepted > 0 {
                    trace!(worker = worker_id, accepted, "Accept pass finished");
                }
            }
            token => handle_connection_event(worker_id, shared, token, event),
        }
    }
    Ok(())
}

fn handle_connection_event(worker_id: usize, shared: &Shared, token: Token, event: Event) {
    let Some(conn) = shared.registry.get(token) else {
        trace!(worker = worker_id, token = token.0, "Event for closed connection");
        return;
    };
    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
    if !conn.is_open() {
        return;
    }

    let settings = &shared.settings;
    let mut outcome = Outcome::Open;
    if event.is_writable() || event.is_error() {
        outcome = conn.on_writable();
    }
    if matches!(outcome, Outcome::Open)
        && (event.is_readable() || event.is_read_closed() || event.is_error())
    {
        outcome = conn.on_readable(settings.buffer_size, settings.max_pending);
    }

    match outcome {
        Outcome::Open => {
            let Some(fd) = conn.stream().map(AsRawFd::as_raw_fd) else {
                return;
            };
            let interest = conn.interest(settings.max_pending);
            if interest.is_writable() {
                trace!(
                    worker = worker_id,
                    token = token.0,
                    pending = conn.pending_len(),
                    "Waiting for writable"
                );
            }
            if let Err(e) = shared
                .poller
                .rearm(fd, token, interest, Trigger::EdgeOneshot)
            {
                close(worker_id, shared, token, &mut conn, CloseReason::Rearm(e));
            }
        }
        Outcome::Close(reason) => close(worker_id, shared, token, &mut conn, reason),
    }
}

fn close(
    worker_id: usize,
    shared: &Shared,
    token: Token,
    conn: &mut Connection,
    reason: CloseReason,
) {
    let peer = conn.peer();
    if shared.registry.teardown(token, conn, &shared.poller) {
        match reason {
            CloseReason::PeerClosed => {
                debug!(worker = worker_id, token = token.0, peer = %peer, "Client disconnected")
            }
            reason => debug!(
                worker = worker_id,
                token = token.0,
                peer = %peer,
                reason = %reason,
                "Connection closed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::Server;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};

    const READ_CLOSED: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    const READABLE: u32 = libc::EPOLLIN as u32;

    fn server() -> Server {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        Server::bind(&config).unwrap()
    }

    fn accept_one(shared: &Shared) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while acceptor::accept_pending(shared, 0).unwrap() == 0 {
            assert!(Instant::now() < deadline, "timed out accepting");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Wait for the kernel to report a connection event matching `want`.
    fn connection_event(shared: &Shared, want: impl Fn(&Event) -> bool) -> Token {
        let mut events = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for event");
            shared
                .poller
                .wait(&mut events, Some(Duration::from_millis(50)))
                .unwrap();
            if let Some(event) = events
                .iter()
                .find(|e| e.token() != LISTENER_TOKEN && want(e))
            {
                return event.token();
            }
        }
    }

    fn batch(token: Token, flags: u32) -> Events {
        let mut events = Events::with_capacity(1);
        events.push(token, flags);
        events
    }

    #[test]
    fn test_concurrent_dispatch_closes_once() {
        let server = server();
        let shared = &*server.shared;
        let addr = server.local_addr().unwrap();
        let workers = 4;

        for round in 0..50u64 {
            let client = TcpStream::connect(addr).unwrap();
            accept_one(shared);
            client.shutdown(Shutdown::Write).unwrap();
            let token = connection_event(shared, |e| e.is_read_closed());

            let barrier = Barrier::new(workers);
            thread::scope(|s| {
                for worker_id in 0..workers {
                    let barrier = &barrier;
                    s.spawn(move || {
                        let events = batch(token, READ_CLOSED);
                        barrier.wait();
                        dispatch(worker_id, shared, &events).unwrap();
                    });
                }
            });

            let stats = server.stats();
            assert_eq!(stats.closed, round + 1);
            assert_eq!(stats.active, 0);
        }
    }

    #[test]
    fn test_stale_generation_event_is_ignored() {
        let server = server();
        let shared = &*server.shared;
        let addr = server.local_addr().unwrap();

        let old_client = TcpStream::connect(addr).unwrap();
        accept_one(shared);
        old_client.shutdown(Shutdown::Write).unwrap();
        let old = connection_event(shared, |e| e.is_read_closed());
        dispatch(0, shared, &batch(old, READ_CLOSED)).unwrap();
        assert_eq!(server.stats().closed, 1);

        // The new connection reuses the slot under a new generation.
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        accept_one(shared);
        client.write_all(b"ping").unwrap();
        let current = connection_event(shared, |e| e.is_readable());
        assert_ne!(old, current);

        dispatch(0, shared, &batch(old, READ_CLOSED)).unwrap();
        let mut buf = [0u8; 4];
        assert!(client.read(&mut buf).is_err(), "stale event must not echo");
        let stats = server.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.closed, 1);

        dispatch(0, shared, &batch(current, READABLE)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(server.stats().active, 1);
    }
}
