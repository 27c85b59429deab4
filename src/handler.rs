//! Handlers and the continuation passed between them.
//!
//! Every handler receives the request, the response being accumulated and a
//! [`Next`] value. Returning `next.proceed()` hands control to the following
//! handler; returning anything else (or finalizing the response) ends the
//! chain.

use std::fmt;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::http::{Request, Response};

/// What a handler returns.
pub type HandlerResult = Result<Step, HandlerError>;

/// A unit of request processing.
///
/// Implemented for every `Fn(&mut Request, &mut Response, Next) -> HandlerResult`.
/// Handlers run synchronously on whichever thread drives the connection, so
/// they are shared between connections and must be `Send + Sync`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &mut Request, res: &mut Response, next: Next) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response, Next) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, req: &mut Request, res: &mut Response, next: Next) -> HandlerResult {
        self(req, res, next)
    }
}

/// Pins a closure to the handler signature so its argument types are inferred.
///
/// ```
/// use trellis::{handler, StatusCode};
///
/// let health = handler(|_req, res, _next| Ok(res.text(StatusCode::OK, "up")));
/// # let _ = health;
/// ```
pub fn handler<F>(f: F) -> F
where
    F: Fn(&mut Request, &mut Response, Next) -> HandlerResult + Send + Sync + 'static,
{
    f
}

/// The continuation handed to a handler.
///
/// It is consumed by [`proceed`](Next::proceed), which is the only way to
/// build a [`Step`] that lets the chain continue.
#[must_use = "dropping `Next` without calling `proceed` ends the chain"]
#[derive(Debug)]
pub struct Next {
    _private: (),
}

impl Next {
    pub(crate) fn new() -> Self {
        Next { _private: () }
    }

    /// Continue with the next handler in the chain.
    pub fn proceed(self) -> Step {
        Step(Flow::Continue)
    }
}

/// The outcome of one handler.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step(Flow);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Halt,
}

impl Step {
    /// Stop the chain here.
    pub fn halt() -> Step {
        Step(Flow::Halt)
    }

    pub fn is_continue(&self) -> bool {
        self.0 == Flow::Continue
    }
}

/// An ordered list of shared handlers.
#[derive(Clone, Default)]
pub struct Chain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler, builder style.
    pub fn then<H: Handler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Appends every handler of `other`.
    pub fn extend(&mut self, other: Chain) {
        self.handlers.extend(other.handlers);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> + '_ {
        self.handlers.iter()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Anything that can be registered as a route's handlers: a single handler
/// or a whole [`Chain`].
pub trait IntoChain {
    fn into_chain(self) -> Chain;
}

impl IntoChain for Chain {
    fn into_chain(self) -> Chain {
        self
    }
}

impl<H: Handler> IntoChain for H {
    fn into_chain(self) -> Chain {
        Chain::new().then(self)
    }
}

/// Builds a [`Chain`] from a list of handlers.
///
/// ```
/// use trellis::{chain, handler, StatusCode};
///
/// let chain = chain![
///     handler(|_req, _res, next| Ok(next.proceed())),
///     handler(|_req, res, _next| Ok(res.text(StatusCode::OK, "done"))),
/// ];
/// assert_eq!(chain.len(), 2);
/// ```
#[macro_export]
macro_rules! chain {
    ($($handler:expr),* $(,)?) => {
        $crate::Chain::new()$(.then($handler))*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use hyper::StatusCode;

    fn teapot(_req: &mut Request, res: &mut Response, _next: Next) -> HandlerResult {
        Ok(res.text(StatusCode::IM_A_TEAPOT, "short and stout"))
    }

    #[test]
    fn test_fn_items_are_handlers() {
        let mut req = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut res = Response::new();
        let step = teapot.handle(&mut req, &mut res, Next::new()).unwrap();
        assert!(!step.is_continue());
        assert_eq!(res.status_code(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn test_proceed_is_the_only_continue() {
        assert!(Next::new().proceed().is_continue());
        assert!(!Step::halt().is_continue());
    }

    #[test]
    fn test_chain_macro_and_into_chain() {
        let single = teapot.into_chain();
        assert_eq!(single.len(), 1);

        let mut many = chain![teapot, handler(|_req, _res, next| Ok(next.proceed()))];
        assert_eq!(many.len(), 2);
        many.extend(single);
        assert_eq!(many.len(), 3);
        assert_eq!(many.clone().into_chain().len(), 3);

        let empty = chain![];
        assert!(empty.is_empty());
    }
}
