//! Servers that accept connections and feed them through the request pipeline.
//!
//! [`HttpServer`] accepts on a blocking socket and hands every connection to
//! a worker pool. [`EventedHttpServer`] accepts through the mio reactor and
//! runs connections as tasks on a fixed set of event loop threads. Both
//! register routes through [`Routing`](crate::Routing) and produce the same
//! bytes for the same request.

mod evented;
mod threaded;

pub use evented::{EventedHttpServer, RunningServer};
pub use threaded::{BoundServer, HttpServer};

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long a closing connection keeps reading so that unread request bytes
/// do not turn the close into a reset that discards the response.
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);
const LINGER_BYTES: usize = 64 * 1024;

/// How a stop request reaches a blocked accept loop.
pub(crate) enum Wake {
    /// Connect to the listener so a blocking `accept` returns.
    Connect,
    /// Notify the async accept loop.
    Notify(Arc<Notify>),
}

/// A cloneable handle to a running server.
///
/// [`stop`](ServerHandle::stop) makes the server stop accepting. Requests
/// already being processed are left to finish; use
/// [`wait_idle`](ServerHandle::wait_idle) to wait for them.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    local_addr: SocketAddr,
    stopped: AtomicBool,
    wake: Wake,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl ServerHandle {
    pub(crate) fn new(local_addr: SocketAddr, wake: Wake) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                local_addr,
                stopped: AtomicBool::new(false),
                wake,
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops accepting new connections. Calling it again has no effect.
    pub fn stop(&self) {
        if self
            .inner
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        log::info!("Stopping HTTP server on {}", self.inner.local_addr);
        match &self.inner.wake {
            Wake::Connect => {
                let addr = connectable(self.inner.local_addr);
                if let Err(e) = TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
                    log::debug!("Wake-up connection to {} failed: {}", addr, e);
                }
            }
            Wake::Notify(notify) => notify.notify_one(),
        }
    }

    /// Number of connections currently being served.
    pub fn in_flight(&self) -> usize {
        *self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until no connection is in flight or `timeout` elapses.
    ///
    /// Returns `true` if the server went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        // A timeout too large to represent as an instant means wait forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while *count > 0 {
            count = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    match self.inner.idle.wait_timeout(count, remaining) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .inner
                    .idle
                    .wait(count)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    /// Counts a connection as in flight until the guard is dropped.
    pub(crate) fn track(&self) -> ConnectionGuard {
        *self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        ConnectionGuard {
            handle: self.clone(),
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.inner.local_addr)
            .field("stopped", &self.is_stopped())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

pub(crate) struct ConnectionGuard {
    handle: ServerHandle,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        let mut count = inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            inner.idle.notify_all();
        }
    }
}

/// Handles a failed `accept`. Returns `false` when the failure comes from the
/// server stopping and the accept loop should exit.
fn accept_failed(handle: &ServerHandle, err: &io::Error) -> bool {
    if handle.is_stopped() {
        return false;
    }
    log::warn!("Failed to accept connection on {}: {}", handle.local_addr(), err);
    true
}

/// An unspecified listen address cannot be connected to; use loopback instead.
fn connectable(mut addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let ip = match addr {
            SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
        };
        addr.set_ip(ip);
    }
    addr
}
