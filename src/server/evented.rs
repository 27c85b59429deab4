use std::io;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::http::ConnectionInfo;
use crate::net::{Reactor, TcpListener, TcpStream};
use crate::pipeline::{Action, Limits, Pipeline, READ_CHUNK};
use crate::router::{RouteTable, Router, Routing};

use super::{accept_failed, ServerHandle, Wake, ACCEPT_BACKOFF, LINGER_BYTES, LINGER_TIMEOUT};

/// An HTTP server that multiplexes connections over a few event loop threads.
///
/// Readiness comes from the crate's mio reactor; the event loop threads only
/// run connection tasks. Handlers run on those threads too, so a handler that
/// blocks holds up every connection scheduled on its thread.
///
/// ```no_run
/// use trellis::{handler, EventedHttpServer, Routing, StatusCode};
///
/// fn main() -> Result<(), trellis::ServerError> {
///     let mut server = EventedHttpServer::port(3001);
///     server.get("/health", handler(|_req, res, _next| Ok(res.text(StatusCode::OK, "OK"))));
///     let running = server.start()?;
///     std::thread::park();
///     running.shutdown();
///     Ok(())
/// }
/// ```
pub struct EventedHttpServer {
    config: ServerConfig,
    router: Router,
}

impl EventedHttpServer {
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

    /// Binds, arms the first accept and returns while the server runs in the
    /// background.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound or the reactor or
    /// event loop threads cannot be created.
    pub fn start(self) -> ServerResult<RunningServer> {
        let addr = self.config.bind_addr();
        let listener = StdListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let reactor = Reactor::new()?;
        let listener = reactor.register_listener(listener)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.event_loop_threads.max(1))
            .thread_name("trellis-event-loop")
            .enable_time()
            .build()
            .map_err(|e| {
                reactor.shutdown();
                ServerError::Runtime(e)
            })?;

        let notify = Arc::new(Notify::new());
        let handle = ServerHandle::new(local_addr, Wake::Notify(notify.clone()));

        runtime.spawn(accept_loop(
            incoming(listener),
            self.router.freeze(),
            Limits::from_config(&self.config),
            handle.clone(),
            notify,
        ));
        log::info!("Started evented HTTP server on {}", local_addr);

        Ok(RunningServer {
            handle,
            runtime: Some(runtime),
            reactor,
            drain_timeout: self.config.drain_timeout(),
        })
    }
}

impl Routing for EventedHttpServer {
    fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }
}

/// A started evented server.
///
/// Dropping it stops the server, waits up to the configured drain timeout
/// for in-flight connections and tears down the event loop.
pub struct RunningServer {
    handle: ServerHandle,
    runtime: Option<Runtime>,
    reactor: Reactor,
    drain_timeout: Duration,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stops accepting new connections.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stops the server and releases its threads once in-flight work is done.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.handle.stop();
        if !self.handle.wait_idle(self.drain_timeout) {
            log::warn!(
                "{} connections still in flight on {} after {:?}",
                self.handle.in_flight(),
                self.handle.local_addr(),
                self.drain_timeout
            );
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        self.reactor.shutdown();
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// The listener's accepted connections as an endless stream.
fn incoming(listener: TcpListener) -> impl Stream<Item = io::Result<TcpStream>> {
    stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(stream, _)| stream);
        Some((accepted, listener))
    })
}

async fn accept_loop<S>(
    incoming: S,
    routes: Arc<RouteTable>,
    limits: Limits,
    handle: ServerHandle,
    notify: Arc<Notify>,
) where
    S: Stream<Item = io::Result<TcpStream>>,
{
    let mut incoming = Box::pin(incoming);
    loop {
        tokio::select! {
            biased;

            _ = notify.notified() => break,
            accepted = incoming.next() => match accepted {
                Some(Ok(stream)) => {
                    // Each connection is its own task so the next accept is armed at once.
                    let guard = handle.track();
                    let routes = Arc::clone(&routes);
                    tokio::spawn(async move {
                        let _guard = guard;
                        handle_connection(stream, routes, limits).await;
                    });
                }
                Some(Err(e)) => {
                    if !accept_failed(&handle, &e) {
                        break;
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                None => break,
            },
        }
    }

    // Closes the listener.
    drop(incoming);
    log::info!("Stopped evented HTTP server on {}", handle.local_addr());
}

async fn handle_connection(mut stream: TcpStream, routes: Arc<RouteTable>, limits: Limits) {
    let info = ConnectionInfo::new(stream.peer_addr().ok(), stream.local_addr().ok());
    let mut pipeline = Pipeline::new(routes, info, limits.max_request_bytes);

    match serve(&mut stream, &mut pipeline, limits.read_timeout).await {
        Ok(()) => linger(&mut stream).await,
        Err(e) => log::debug!("Connection from {:?} ended early: {}", info.peer_addr, e),
    }
}

/// Drives a pipeline over an async stream until it closes.
pub(crate) async fn serve<S>(
    stream: &mut S,
    pipeline: &mut Pipeline,
    read_timeout: Option<Duration>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipeline.next_action() {
            Action::Read => {
                let read = stream.read(&mut buf);
                let result = match read_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, read).await {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
                    },
                    None => read.await,
                };
                match result {
                    Ok(0) => pipeline.on_eof(),
                    Ok(n) => pipeline.on_read(&buf[..n]),
                    Err(e) => {
                        pipeline.abort();
                        return Err(e);
                    }
                }
            }
            Action::Write(bytes) => {
                let written = match stream.write_all(bytes).await {
                    Ok(()) => stream.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    pipeline.abort();
                    return Err(e);
                }
                pipeline.on_written();
            }
            Action::Close => return Ok(()),
        }
    }
}

async fn linger<S>(stream: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if stream.shutdown().await.is_err() {
        return;
    }
    let drain = async {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut drained = 0;
        while drained < LINGER_BYTES {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
    };
    let _ = tokio::time::timeout(LINGER_TIMEOUT, drain).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use crate::pipeline::State;
    use crate::server::threaded;
    use hyper::StatusCode;
    use std::io::{Cursor, Read, Write};

    fn routes() -> Arc<RouteTable> {
        let mut router = Router::new();
        router
            .middleware(handler(|_req, res, next| {
                res.set_header("x-layer", "mw")?;
                Ok(next.proceed())
            }))
            .get("/hello", handler(|req, res, _next| {
                let name = req.query_param("name").unwrap_or("world");
                Ok(res.text(StatusCode::OK, format!("hello {}", name)))
            }));
        router.freeze()
    }

    async fn serve_in_memory(raw: &'static [u8], read_timeout: Option<Duration>) -> (Vec<u8>, State) {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut pipeline = Pipeline::new(routes(), ConnectionInfo::default(), 1024);

        let client_task = tokio::spawn(async move {
            client.write_all(raw).await.unwrap();
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            out
        });

        let _ = serve(&mut server, &mut pipeline, read_timeout).await;
        drop(server);
        (client_task.await.unwrap(), pipeline.state())
    }

    /// Runs the blocking driver over the same bytes.
    fn serve_blocking(raw: &[u8]) -> Vec<u8> {
        struct Memory(Cursor<Vec<u8>>, Vec<u8>);
        impl Read for Memory {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                Read::read(&mut self.0, buf)
            }
        }
        impl Write for Memory {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Write::write(&mut self.1, buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut stream = Memory(Cursor::new(raw.to_vec()), Vec::new());
        let mut pipeline = Pipeline::new(routes(), ConnectionInfo::default(), 1024);
        threaded::serve(&mut stream, &mut pipeline).unwrap();
        stream.1
    }

    #[tokio::test]
    async fn test_drivers_write_identical_bytes() {
        let requests: [&'static [u8]; 4] = [
            b"GET /hello?name=ada HTTP/1.1\r\nHost: x\r\n\r\n",
            b"GET /nowhere HTTP/1.1\r\n\r\n",
            b"GET /hello HTTP/9.9\r\n\r\n",
            b"DELETE /hello HTTP/1.0\r\n\r\n",
        ];

        for raw in requests {
            let (evented, state) = serve_in_memory(raw, None).await;
            assert_eq!(state, State::Closed);
            assert_eq!(evented, serve_blocking(raw), "{}", String::from_utf8_lossy(raw));
        }
    }

    #[tokio::test]
    async fn test_read_timeout_aborts_idle_connection() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut pipeline = Pipeline::new(routes(), ConnectionInfo::default(), 1024);

        let err = serve(&mut server, &mut pipeline, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(pipeline.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_accept_error_does_not_stop_the_loop() {
        let reactor = Reactor::new().unwrap();
        let listener = reactor
            .register_listener(StdListener::bind("127.0.0.1:0").unwrap())
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let handle = ServerHandle::new(addr, Wake::Notify(notify.clone()));

        let failure = io::Error::new(io::ErrorKind::Other, "too many open files");
        let accepts = stream::once(async move { Err(failure) }).chain(incoming(listener));
        let acceptor = tokio::spawn(accept_loop(
            accepts,
            routes(),
            Limits::default(),
            handle.clone(),
            notify,
        ));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.ends_with("hello world"));

        handle.stop();
        acceptor.await.unwrap();
        reactor.shutdown();
    }

    #[test]
    fn test_running_server_shuts_down_cleanly() {
        let mut server = EventedHttpServer::new(ServerConfig {
            port: 0,
            event_loop_threads: 1,
            drain_timeout_secs: 1,
            ..ServerConfig::default()
        });
        server.get("/", handler(|_req, res, _next| Ok(res.end())));

        let running = server.start().unwrap();
        let handle = running.handle();
        assert_ne!(running.local_addr().port(), 0);
        running.shutdown();

        assert!(handle.is_stopped());
        assert_eq!(handle.in_flight(), 0);
    }
}
