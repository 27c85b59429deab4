#![allow(clippy::return_self_not_must_use)]

//! # Trellis
//!
//! A small embeddable HTTP/1.1 server with Express-style routing and
//! middleware, served over a choice of two transports.
//!
//! ## Features
//! - Exact-path routes per method, plus prefix routes for every method
//! - Global middleware and per-route handler chains with explicit continuation
//! - A blocking transport backed by a growable worker pool
//! - An evented transport backed by a custom mio reactor
//! - Identical response bytes from both transports
//! - Graceful stop: in-flight requests finish, new connections are refused
//!
//! ## Example
//! ```no_run
//! use trellis::{handler, HttpServer, Routing, StatusCode};
//!
//! fn main() -> Result<(), trellis::ServerError> {
//!     let mut server = HttpServer::port(3000);
//!
//!     server
//!         .middleware(handler(|_req, res, next| {
//!             res.set_header("x-powered-by", "trellis")?;
//!             Ok(next.proceed())
//!         }))
//!         .get("/health", handler(|_req, res, _next| Ok(res.text(StatusCode::OK, "OK"))));
//!
//!     server.start()
//! }
//! ```
//!
//! ## Architecture
//! The server is built on several key components:
//!
//! - `Router`: collects routes and middleware, then freezes into a shared `RouteTable`
//! - `Pipeline`: per-connection state machine from raw bytes to a written response
//! - `HttpServer`: blocking accept loop feeding connections to the `Executor`
//! - `EventedHttpServer`: async accept loop driven by the `Reactor`
//!
//! ## Configuration
//! Server settings can be configured via:
//! - Environment variables (prefixed with `TRELLIS_`)
//! - Configuration file (`config.toml`)
//! - The `ServerConfig` struct directly

pub use crate::config::ServerConfig;
pub use crate::error::{
    ExecutorError, HandlerError, ParseError, ReactorError, ServerError, ServerResult,
};
pub use crate::handler::{handler, Chain, Handler, HandlerResult, IntoChain, Next, Step};
pub use crate::http::{Bytes, ConnectionInfo, Method, Request, Response};
pub use crate::pipeline::{Action, Pipeline, State};
pub use crate::router::{PathPattern, RouteEntry, RouteTable, Router, Routing};
pub use crate::server::{BoundServer, EventedHttpServer, HttpServer, RunningServer, ServerHandle};

pub use hyper::{HeaderMap, StatusCode};

mod config;
mod error;
mod executor;
mod handler;
mod http;
mod net;
mod parser;
mod pipeline;
mod router;
mod server;
