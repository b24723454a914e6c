//! Event-driven echo runtime.
//!
//! One epoll instance is shared by a fixed pool of worker threads:
//! - `poller`: the readiness multiplexer every worker waits on
//! - `connection`: connection state and the generation-tagged registry
//! - `acceptor`: drains the listener backlog
//! - `handler`: drain-until-would-block echo with a pending-output queue
//! - `worker`: the per-thread wait/dispatch loop
//!
//! Linux only; other platforms get `Unsupported` from [`run`].

#[cfg(target_os = "linux")]
mod acceptor;
#[cfg(target_os = "linux")]
mod connection;
#[cfg(target_os = "linux")]
mod handler;
#[cfg(target_os = "linux")]
mod poller;
#[cfg(target_os = "linux")]
mod socket;
#[cfg(target_os = "linux")]
mod worker;

#[cfg(target_os = "linux")]
pub use server::Server;

use crate::config::Config;
use tracing::info;

/// Bind and serve until a worker fails.
pub fn run(config: Config) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let server = Server::bind(&config)?;
        info!(
            addr = %server.local_addr()?,
            workers = config.workers,
            buffer_size = config.buffer_size,
            max_connections = server.shared.registry.capacity(),
            "Server is running"
        );
        server.run()
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unsupported platform: only Linux is supported",
        ))
    }
}

#[cfg(target_os = "linux")]
pub(crate) use server::Shared;

#[cfg(target_os = "linux")]
mod server {
    use super::acceptor::AcceptPause;
    use super::connection::{ConnectionRegistry, RegistryStats, LISTENER_TOKEN};
    use super::poller::{Interest, Poller, Trigger};
    use super::{socket, worker};
    use crate::config::Config;
    use std::any::Any;
    use std::io;
    use std::net::{SocketAddr, TcpListener};
    use std::os::fd::AsRawFd;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use tracing::error;

    /// Limits every worker applies.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct Settings {
        pub buffer_size: usize,
        pub max_pending: usize,
        pub max_events: usize,
        pub nodelay: bool,
    }

    /// State shared by the worker pool.
    pub(crate) struct Shared {
        pub poller: Poller,
        pub registry: ConnectionRegistry,
        pub listener: TcpListener,
        pub accept_pause: AcceptPause,
        pub settings: Settings,
    }

    /// A bound listener plus the poller its workers will share.
    pub struct Server {
        pub(crate) shared: Arc<Shared>,
        workers: usize,
    }

    impl Server {
        /// Create the listener and poller. Fails on any setup error.
        pub fn bind(config: &Config) -> io::Result<Self> {
            let addr = socket::parse_addr(&config.listen_addr())?;
            let listener = socket::bind_listener(addr, config.backlog)?;
            let poller = Poller::new()?;
            poller.register(
                listener.as_raw_fd(),
                LISTENER_TOKEN,
                Interest::READABLE,
                Trigger::EdgeOneshot,
            )?;

            let shared = Shared {
                poller,
                registry: ConnectionRegistry::new(config.max_connections),
                listener,
                accept_pause: AcceptPause::default(),
                settings: Settings {
                    buffer_size: config.buffer_size,
                    max_pending: config.max_pending,
                    max_events: config.max_events,
                    nodelay: config.nodelay,
                },
            };

            Ok(Self {
                shared: Arc::new(shared),
                workers: config.workers.max(1),
            })
        }

        pub fn local_addr(&self) -> io::Result<SocketAddr> {
            self.shared.listener.local_addr()
        }

        pub fn stats(&self) -> RegistryStats {
            self.shared.registry.stats()
        }

        /// Start the worker pool and supervise it.
        ///
        /// Workers only return when waiting on the poller fails; the first
        /// such failure (or panic) is returned.
        pub fn run(self) -> io::Result<()> {
            let (tx, rx) = mpsc::channel();

            for worker_id in 0..self.workers {
                let shared = Arc::clone(&self.shared);
                let tx = tx.clone();

                thread::Builder::new()
                    .name(format!("worker-{worker_id}"))
                    .spawn(move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            worker::run(worker_id, &shared)
                        }))
                        .unwrap_or_else(|payload| Err(panicked(payload)));
                        let _ = tx.send((worker_id, result));
                    })?;
            }
            drop(tx);

            for (worker_id, result) in rx {
                if let Err(e) = result {
                    let stats = self.stats();
                    error!(
                        worker = worker_id,
                        error = %e,
                        active = stats.active,
                        accepted = stats.accepted,
                        closed = stats.closed,
                        "Worker failed"
                    );
                    return Err(e);
                }
            }

            Ok(())
        }
    }

    fn panicked(payload: Box<dyn Any + Send>) -> io::Error {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        io::Error::new(io::ErrorKind::Other, format!("worker panicked: {msg}"))
    }
}
