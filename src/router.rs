//! Route registration and resolution.
//!
//! Routes and middleware are collected in a mutable [`Router`] while the
//! server is being configured. Starting a server freezes the router into a
//! [`RouteTable`], which is shared read-only by every connection.

use std::sync::Arc;

use crate::handler::{Chain, IntoChain};
use crate::http::Method;

/// How a route's path is compared against a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// The request path must equal the pattern.
    Exact(String),
    /// The request path must start with the pattern.
    Prefix(String),
}

impl PathPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => p == path,
            PathPattern::Prefix(p) => path.starts_with(p.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p,
        }
    }
}

/// One registered route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    method: Method,
    pattern: PathPattern,
    chain: Chain,
}

impl RouteEntry {
    pub fn new(method: Method, pattern: PathPattern, chain: Chain) -> Self {
        Self {
            method,
            pattern,
            chain,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn matches(&self, method: Method, path: &str) -> bool {
        self.method.accepts(method) && self.pattern.matches(path)
    }
}

/// Routes and middleware under construction.
#[derive(Debug, Default)]
pub struct Router {
    middleware: Chain,
    routes: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freezes the configuration for serving.
    pub fn freeze(self) -> Arc<RouteTable> {
        Arc::new(RouteTable {
            middleware: self.middleware,
            routes: self.routes,
        })
    }

    fn push(&mut self, entry: RouteEntry) {
        log::debug!(
            "registered {} {:?} ({} handlers)",
            entry.method,
            entry.pattern,
            entry.chain.len()
        );
        self.routes.push(entry);
    }
}

/// The registration surface shared by [`Router`] and both servers.
pub trait Routing {
    /// The router that registrations are written to.
    fn router_mut(&mut self) -> &mut Router;

    /// Registers `handlers` for requests with `method` whose path equals `path`.
    fn add_handler(&mut self, method: Method, path: &str, handlers: impl IntoChain) -> &mut Self {
        self.router_mut().push(RouteEntry::new(
            method,
            PathPattern::Exact(path.to_owned()),
            handlers.into_chain(),
        ));
        self
    }

    fn get(&mut self, path: &str, handlers: impl IntoChain) -> &mut Self {
        self.add_handler(Method::Get, path, handlers)
    }

    fn post(&mut self, path: &str, handlers: impl IntoChain) -> &mut Self {
        self.add_handler(Method::Post, path, handlers)
    }

    fn put(&mut self, path: &str, handlers: impl IntoChain) -> &mut Self {
        self.add_handler(Method::Put, path, handlers)
    }

    fn delete(&mut self, path: &str, handlers: impl IntoChain) -> &mut Self {
        self.add_handler(Method::Delete, path, handlers)
    }

    /// Appends handlers that run before the matched route's handlers on
    /// every routed request.
    fn middleware(&mut self, handlers: impl IntoChain) -> &mut Self {
        self.router_mut().middleware.extend(handlers.into_chain());
        self
    }

    /// Registers handlers for every method on every path starting with `prefix`.
    ///
    /// This is an ordinary route entry, so it takes part in first-match
    /// resolution: it shadows routes registered after it that it matches.
    fn middleware_at(&mut self, prefix: &str, handlers: impl IntoChain) -> &mut Self {
        self.router_mut().push(RouteEntry::new(
            Method::All,
            PathPattern::Prefix(prefix.to_owned()),
            handlers.into_chain(),
        ));
        self
    }
}

impl Routing for Router {
    fn router_mut(&mut self) -> &mut Router {
        self
    }
}

/// The frozen, shareable form of a [`Router`].
#[derive(Debug)]
pub struct RouteTable {
    middleware: Chain,
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    /// Returns the first entry, in registration order, that accepts `method`
    /// and matches `path`.
    pub fn resolve(&self, method: Method, path: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|entry| entry.matches(method, path))
    }

    /// Global middleware, in registration order.
    pub fn middleware(&self) -> &Chain {
        &self.middleware
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }
}
