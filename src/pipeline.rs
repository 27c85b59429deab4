//! The per-connection request pipeline.
//!
//! A [`Pipeline`] is a state machine with no I/O of its own. A transport asks
//! it what to do next with [`next_action`](Pipeline::next_action), performs
//! that read or write however it likes (blocking or evented), and reports the
//! outcome back. Both transports therefore share one dispatch algorithm.
//!
//! ```text
//! Accepted -> Parsing -> Dispatching -> Responding -> Closed
//!                |            |
//!                +--> Failed <+------------------> Closed
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;

use crate::config::ServerConfig;
use crate::error::{panic_message, HandlerError, ParseError};
use crate::handler::{Handler, HandlerResult, Next};
use crate::http::{ConnectionInfo, Request, Response};
use crate::parser;
use crate::router::RouteTable;

/// Size of the buffer transports read into.
pub const READ_CHUNK: usize = 8 * 1024;

/// Per-connection limits, shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_request_bytes: usize,
    pub read_timeout: Option<Duration>,
}

impl Limits {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_request_bytes: config.max_request_bytes,
            read_timeout: config.read_timeout(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Lifecycle states of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accepted,
    Parsing,
    Dispatching,
    Responding,
    /// An error response is pending; the connection closes after it is written.
    Failed,
    Closed,
}

impl State {
    fn can_become(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Accepted, Parsing)
                | (Parsing, Dispatching)
                | (Parsing, Failed)
                | (Dispatching, Responding)
                | (Dispatching, Failed)
                | (Accepted | Parsing | Dispatching | Responding | Failed, Closed)
        )
    }
}

/// What the transport should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Action<'a> {
    /// Read more bytes and pass them to [`Pipeline::on_read`], or call
    /// [`Pipeline::on_eof`] if the peer closed.
    Read,
    /// Write all of these bytes, then call [`Pipeline::on_written`].
    Write(&'a [u8]),
    /// Close the connection.
    Close,
}

/// One connection's trip from raw bytes to a written response.
pub struct Pipeline {
    routes: Arc<RouteTable>,
    info: ConnectionInfo,
    max_request_bytes: usize,
    state: State,
    buffer: Vec<u8>,
    request: Option<Request>,
    output: Vec<u8>,
    status: Option<StatusCode>,
}

impl Pipeline {
    pub fn new(routes: Arc<RouteTable>, info: ConnectionInfo, max_request_bytes: usize) -> Self {
        Self {
            routes,
            info,
            max_request_bytes,
            state: State::Accepted,
            buffer: Vec::new(),
            request: None,
            output: Vec::new(),
            status: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The status of the response produced, once there is one.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn next_action(&mut self) -> Action<'_> {
        match self.state {
            State::Accepted => {
                self.transition(State::Parsing);
                Action::Read
            }
            State::Parsing => Action::Read,
            State::Dispatching => {
                self.dispatch();
                self.next_action()
            }
            State::Responding | State::Failed => Action::Write(&self.output),
            State::Closed => Action::Close,
        }
    }

    /// Feeds bytes read from the connection.
    pub fn on_read(&mut self, bytes: &[u8]) {
        if self.state != State::Parsing {
            log::trace!("ignoring {} bytes read in state {:?}", bytes.len(), self.state);
            return;
        }

        self.buffer.extend_from_slice(bytes);
        let too_large = ParseError::TooLarge {
            limit: self.max_request_bytes,
        };

        // Only the request itself counts against the limit, not bytes the
        // client sent after it.
        match parser::parse_prefix(&self.buffer) {
            Ok((_, len)) if len > self.max_request_bytes => self.fail_parse(too_large),
            Ok((request, _)) => {
                self.request = Some(request);
                self.buffer = Vec::new();
                self.transition(State::Dispatching);
            }
            Err(ParseError::Incomplete) if self.buffer.len() > self.max_request_bytes => {
                self.fail_parse(too_large)
            }
            Err(ParseError::Incomplete) => {}
            Err(err) => self.fail_parse(err),
        }
    }

    /// The peer closed its side before a full request arrived.
    pub fn on_eof(&mut self) {
        if self.state != State::Parsing {
            return;
        }
        if self.buffer.is_empty() {
            // Nothing was sent; there is no one to answer.
            self.transition(State::Closed);
        } else {
            self.fail_parse(ParseError::UnexpectedEof);
        }
    }

    /// The bytes from the last [`Action::Write`] were fully written.
    pub fn on_written(&mut self) {
        if matches!(self.state, State::Responding | State::Failed) {
            self.transition(State::Closed);
        }
    }

    /// Abandons the connection after an I/O failure.
    pub fn abort(&mut self) {
        if self.state != State::Closed {
            self.transition(State::Closed);
        }
    }

    fn transition(&mut self, next: State) {
        debug_assert!(
            self.state.can_become(next),
            "invalid pipeline transition {:?} -> {:?}",
            self.state,
            next
        );
        log::trace!("connection {:?}: {:?} -> {:?}", self.info.peer_addr, self.state, next);
        self.state = next;
    }

    fn fail_parse(&mut self, err: ParseError) {
        log::debug!("rejecting request from {:?}: {}", self.info.peer_addr, err);
        self.buffer = Vec::new();
        self.respond(Response::plain(StatusCode::BAD_REQUEST, "Bad Request"), State::Failed);
    }

    fn dispatch(&mut self) {
        let mut request = match self.request.take() {
            Some(request) => request,
            None => {
                self.respond(
                    Response::plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
                    State::Failed,
                );
                return;
            }
        };
        request.connection = self.info;

        match run_chain(&self.routes, &mut request) {
            Ok(response) => {
                log::debug!(
                    "{} {} -> {}",
                    request.method_token(),
                    request.path(),
                    response.status_code()
                );
                self.respond(response, State::Responding);
            }
            Err(err) => {
                log::error!(
                    "handler failed for {} {}: {}",
                    request.method_token(),
                    request.path(),
                    err
                );
                self.respond(
                    Response::plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
                    State::Failed,
                );
            }
        }
    }

    fn respond(&mut self, response: Response, next: State) {
        self.status = Some(response.status_code());
        self.output = response.to_bytes();
        self.transition(next);
    }
}

/// Runs the effective chain for `req` and returns the finalized response.
///
/// The chain is the global middleware followed by the first matching route's
/// handlers. Without a matching route only the built-in not-found handler
/// runs.
pub fn run_chain(routes: &RouteTable, req: &mut Request) -> Result<Response, HandlerError> {
    let mut res = Response::new();

    match routes.resolve(req.method(), req.path()) {
        Some(entry) => {
            for handler in routes.middleware().iter().chain(entry.chain().iter()) {
                let step = invoke(handler.as_ref(), req, &mut res)?;
                if !step.is_continue() || res.is_finalized() {
                    break;
                }
            }
        }
        None => {
            let _ = invoke(&not_found, req, &mut res)?;
        }
    }

    res.finalize();
    Ok(res)
}

fn invoke(handler: &dyn Handler, req: &mut Request, res: &mut Response) -> HandlerResult {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(req, res, Next::new()))) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn not_found(_req: &mut Request, res: &mut Response, _next: Next) -> HandlerResult {
    Ok(res.text(StatusCode::NOT_FOUND, "Not Found"))
}
