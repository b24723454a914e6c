//! Connection state and the registry shared by all workers.
//!
//! A connection is owned by the registry and borrowed by whichever worker is
//! processing its current event. Tokens carry a generation next to the slab
//! key so an event for a closed connection can never resolve to a newer
//! connection that reused the slot.

use crate::runtime::poller::{Interest, Poller, Token};
use bytes::BytesMut;
use slab::Slab;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

const KEY_BITS: u32 = usize::BITS / 2;
const KEY_MASK: usize = (1 << KEY_BITS) - 1;

/// Liveness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    /// `None` once the connection has been torn down.
    pub(crate) stream: Option<S>,
    peer: SocketAddr,
    /// Echo bytes the socket has not accepted yet.
    pub(crate) pending: BytesMut,
}

impl<S> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
            pending: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        if self.stream.is_some() {
            ConnState::Open
        } else {
            ConnState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Interest to arm after an event has been handled.
    ///
    /// Reading pauses while `max_pending` or more echo bytes are queued.
    pub fn interest(&self, max_pending: usize) -> Interest {
        if self.pending.is_empty() {
            Interest::READABLE
        } else if self.pending.len() >= max_pending {
            Interest::WRITABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Mark closed, handing back the stream so the caller controls when the
    /// descriptor is released.
    fn take_stream(&mut self) -> Option<S> {
        self.pending.clear();
        self.stream.take()
    }
}

/// Handle to a registered connection.
pub type SharedConnection<S = TcpStream> = Arc<Mutex<Connection<S>>>;

struct Slot<S> {
    generation: usize,
    conn: SharedConnection<S>,
}

struct Slots<S> {
    entries: Slab<Slot<S>>,
    next_generation: usize,
}

/// Point-in-time connection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: usize,
    pub accepted: u64,
    pub closed: u64,
}

/// Registry of live connections, shared by every worker.
pub struct ConnectionRegistry<S = TcpStream> {
    slots: Mutex<Slots<S>>,
    max_connections: usize,
    accepted: AtomicU64,
    closed: AtomicU64,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.min(KEY_MASK - 1);
        Self {
            slots: Mutex::new(Slots {
                entries: Slab::with_capacity(max_connections.min(1024)),
                next_generation: 0,
            }),
            max_connections,
            accepted: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    /// Insert a new connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&self, conn: Connection<S>) -> Option<(Token, SharedConnection<S>)> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.entries.len() >= self.max_connections {
            return None;
        }

        let generation = slots.next_generation;
        slots.next_generation = (generation + 1) & KEY_MASK;

        let conn = Arc::new(Mutex::new(conn));
        let key = slots.entries.insert(Slot {
            generation,
            conn: Arc::clone(&conn),
        });
        self.accepted.fetch_add(1, Ordering::Relaxed);

        Some((encode(key, generation), conn))
    }

    /// Look up a live connection. Stale tokens return `None`.
    pub fn get(&self, token: Token) -> Option<SharedConnection<S>> {
        let (key, generation) = decode(token);
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entries
            .get(key)
            .filter(|slot| slot.generation == generation)
            .map(|slot| Arc::clone(&slot.conn))
    }

    /// Drop the registry's reference. Only the first caller for a token
    /// succeeds.
    pub fn remove(&self, token: Token) -> bool {
        let (key, generation) = decode(token);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.entries.get(key) {
            Some(slot) if slot.generation == generation => {
                slots.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

impl<S: AsRawFd> ConnectionRegistry<S> {
    /// Remove, deregister and close a connection.
    ///
    /// The caller must hold the connection's lock. Exactly one call per
    /// connection returns `true`; the descriptor is deregistered before it is
    /// closed, so its number cannot be handed to a new connection while the
    /// old registration still exists.
    pub fn teardown(&self, token: Token, conn: &mut Connection<S>, poller: &Poller) -> bool {
        if !self.remove(token) {
            return false;
        }

        if let Some(stream) = conn.take_stream() {
            if let Err(e) = poller.deregister(stream.as_raw_fd()) {
                debug!(token = token.0, error = %e, "Deregister failed");
            }
            drop(stream);
        }

        self.closed.fetch_add(1, Ordering::Relaxed);
        true
    }
}

fn encode(key: usize, generation: usize) -> Token {
    Token((generation << KEY_BITS) | key)
}

fn decode(token: Token) -> (usize, usize) {
    (token.0 & KEY_MASK, token.0 >> KEY_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::poller::Trigger;
    use std::net::TcpListener;
    use std::sync::Barrier;
    use std::thread;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn test_connection_state_transitions() {
        let (server, _client) = tcp_pair();
        let mut conn = Connection::new(server, peer());
        assert_eq!(conn.state(), ConnState::Open);
        assert_eq!(conn.interest(1024), Interest::READABLE);

        conn.pending.extend_from_slice(b"queued");
        assert_eq!(conn.interest(1024), Interest::READABLE | Interest::WRITABLE);
        assert_eq!(conn.interest(4), Interest::WRITABLE);

        assert!(conn.take_stream().is_some());
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.pending_len(), 0);
        assert!(conn.take_stream().is_none());
    }

    #[test]
    fn test_connection_registry() {
        let registry = ConnectionRegistry::new(2);
        let (s1, _c1) = tcp_pair();
        let (s2, _c2) = tcp_pair();
        let (s3, _c3) = tcp_pair();

        let (t1, _) = registry.insert(Connection::new(s1, peer())).unwrap();
        let (t2, _) = registry.insert(Connection::new(s2, peer())).unwrap();
        assert_ne!(t1, t2);

        // At capacity
        assert!(registry.insert(Connection::new(s3, peer())).is_none());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(t1));
        assert!(!registry.remove(t1));
        assert!(registry.get(t1).is_none());
        assert!(registry.get(t2).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_token_after_slot_reuse() {
        let registry = ConnectionRegistry::new(4);
        let (s1, _c1) = tcp_pair();
        let (s2, _c2) = tcp_pair();

        let (old, _) = registry.insert(Connection::new(s1, peer())).unwrap();
        assert!(registry.remove(old));

        let (new, _) = registry.insert(Connection::new(s2, peer())).unwrap();
        assert_eq!(decode(old).0, decode(new).0, "slab slot is reused");
        assert_ne!(old, new);

        assert!(registry.get(old).is_none());
        assert!(!registry.remove(old));
        assert!(registry.get(new).is_some());
    }

    #[test]
    fn test_listener_token_never_allocated() {
        let registry: ConnectionRegistry = ConnectionRegistry::new(usize::MAX);
        assert!(registry.capacity() < KEY_MASK);
        assert!(registry.get(LISTENER_TOKEN).is_none());
    }

    #[test]
    fn test_concurrent_teardown_closes_once() {
        let poller = Arc::new(Poller::new().unwrap());
        let registry = Arc::new(ConnectionRegistry::new(16));

        for _ in 0..20 {
            let (server, _client) = tcp_pair();
            let fd = server.as_raw_fd();
            let (token, _) = registry.insert(Connection::new(server, peer())).unwrap();
            poller
                .register(fd, token, Interest::READABLE, Trigger::EdgeOneshot)
                .unwrap();

            let workers = 8;
            let barrier = Arc::new(Barrier::new(workers));
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let poller = Arc::clone(&poller);
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        match registry.get(token) {
                            Some(conn) => {
                                let mut conn = conn.lock().unwrap();
                                registry.teardown(token, &mut conn, &poller)
                            }
                            None => false,
                        }
                    })
                })
                .collect();

            let closes = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|closed| *closed)
                .count();
            assert_eq!(closes, 1);
        }

        let stats = registry.stats();
        assert_eq!(stats.accepted, 20);
        assert_eq!(stats.closed, 20);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_teardown_marks_stale_holders_closed() {
        let poller = Poller::new().unwrap();
        let registry = ConnectionRegistry::new(4);
        let (server, _client) = tcp_pair();
        let (token, held) = registry.insert(Connection::new(server, peer())).unwrap();

        let other = registry.get(token).unwrap();
        {
            let mut conn = held.lock().unwrap();
            assert!(registry.teardown(token, &mut conn, &poller));
        }

        // A worker that looked the connection up earlier sees it closed.
        let mut conn = other.lock().unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(!registry.teardown(token, &mut conn, &poller));
        assert_eq!(registry.stats().closed, 1);
    }
}
