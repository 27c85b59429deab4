use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::executor::Executor;
use crate::http::ConnectionInfo;
use crate::pipeline::{Action, Limits, Pipeline, READ_CHUNK};
use crate::router::{RouteTable, Router, Routing};

use super::{accept_failed, ServerHandle, Wake, ACCEPT_BACKOFF, LINGER_BYTES, LINGER_TIMEOUT};

/// An HTTP server that serves each connection on a pooled worker thread.
///
/// ```no_run
/// use trellis::{handler, HttpServer, Routing, StatusCode};
///
/// fn main() -> Result<(), trellis::ServerError> {
///     let mut server = HttpServer::port(3000);
///     server.get("/health", handler(|_req, res, _next| Ok(res.text(StatusCode::OK, "OK"))));
///     server.start()
/// }
/// ```
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
        }
    }

    /// A server with default configuration listening on `port`.
    pub fn port(port: u16) -> Self {
        Self::new(ServerConfig::with_port(port))
    }

    /// Binds the listener and freezes the routes, without accepting yet.
    ///
    /// # Errors
    /// Returns `ServerError::Bind` if the address cannot be bound.
    pub fn bind(self) -> ServerResult<BoundServer> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        Ok(BoundServer {
            listener,
            routes: self.router.freeze(),
            executor: Executor::new(
                Some(self.config.max_workers),
                Some(self.config.worker_keep_alive()),
            ),
            limits: Limits::from_config(&self.config),
            handle: ServerHandle::new(local_addr, Wake::Connect),
        })
    }

    /// Binds and runs the accept loop on the calling thread until stopped.
    pub fn start(self) -> ServerResult<()> {
        self.bind()?.run()
    }
}

impl Routing for HttpServer {
    fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }
}

/// A bound blocking server whose routes can no longer change.
pub struct BoundServer {
    listener: TcpListener,
    routes: Arc<RouteTable>,
    executor: Executor,
    limits: Limits,
    handle: ServerHandle,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accepts connections on the calling thread until the server is stopped.
    pub fn run(self) -> ServerResult<()> {
        log::info!("Started HTTP server on {}", self.local_addr());
        self.accept_from(self.listener.incoming());
        log::info!("Stopped HTTP server on {}", self.local_addr());
        Ok(())
    }

    fn accept_from<I>(&self, incoming: I)
    where
        I: IntoIterator<Item = io::Result<TcpStream>>,
    {
        for conn in incoming {
            match conn {
                Ok(_) if self.handle.is_stopped() => break,
                Ok(stream) => self.dispatch(stream),
                Err(e) => {
                    if !accept_failed(&self.handle, &e) {
                        break;
                    }
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }

    /// Runs the accept loop on a dedicated thread.
    pub fn spawn(self) -> ServerResult<JoinHandle<ServerResult<()>>> {
        thread::Builder::new()
            .name("trellis-acceptor".to_owned())
            .spawn(move || self.run())
            .map_err(ServerError::Io)
    }

    fn dispatch(&self, stream: TcpStream) {
        let guard = self.handle.track();
        let routes = Arc::clone(&self.routes);
        let limits = self.limits;

        let submitted = self.executor.submit(move || {
            let _guard = guard;
            handle_connection(stream, routes, limits);
        });
        if let Err(e) = submitted {
            log::error!(
                "Failed to schedule connection ({}/{} workers): {}",
                self.executor.workers(),
                self.executor.max_workers(),
                e
            );
        }
    }
}

fn handle_connection(mut stream: TcpStream, routes: Arc<RouteTable>, limits: Limits) {
    let info = ConnectionInfo::new(stream.peer_addr().ok(), stream.local_addr().ok());
    if let Err(e) = stream.set_read_timeout(limits.read_timeout) {
        log::debug!("Failed to set read timeout: {}", e);
    }

    let mut pipeline = Pipeline::new(routes, info, limits.max_request_bytes);
    match serve(&mut stream, &mut pipeline) {
        Ok(()) => linger(&mut stream),
        Err(e) => log::debug!("Connection from {:?} ended early: {}", info.peer_addr, e),
    }
}

/// Drives a pipeline over a blocking stream until it closes.
pub(crate) fn serve<S: Read + Write>(stream: &mut S, pipeline: &mut Pipeline) -> io::Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match pipeline.next_action() {
            Action::Read => match stream.read(&mut buf) {
                Ok(0) => pipeline.on_eof(),
                Ok(n) => pipeline.on_read(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    pipeline.abort();
                    return Err(e);
                }
            },
            Action::Write(bytes) => {
                if let Err(e) = stream.write_all(bytes).and_then(|_| stream.flush()) {
                    pipeline.abort();
                    return Err(e);
                }
                pipeline.on_written();
            }
            Action::Close => return Ok(()),
        }
    }
}

fn linger(stream: &mut TcpStream) {
    if stream.shutdown(Shutdown::Write).is_err() {
        return;
    }
    let deadline = Instant::now() + LINGER_TIMEOUT;
    let mut buf = [0u8; READ_CHUNK];
    let mut drained = 0;
    while drained < LINGER_BYTES {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || stream.set_read_timeout(Some(remaining)).is_err() {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => drained += n,
        }
    }
}
