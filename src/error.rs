use std::io;
use thiserror::Error;

/// Represents errors that can occur during task execution in the executor system.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// A submitted task panicked; the payload message is kept when it is a string
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Malformed or unacceptable request bytes.
///
/// Every variant except [`ParseError::Incomplete`] is answered with a
/// `400 Bad Request` and the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// More bytes are needed before the request can be parsed.
    #[error("request is incomplete")]
    Incomplete,

    /// The request line is not `METHOD SP target SP HTTP/1.x`.
    #[error("invalid request line")]
    InvalidRequestLine,

    /// The method token contains characters outside the token grammar.
    #[error("invalid method token")]
    InvalidMethod,

    /// The request target does not start with `/`.
    #[error("invalid request target")]
    InvalidTarget,

    /// The protocol version is not HTTP/1.0 or HTTP/1.1.
    #[error("unsupported http version")]
    InvalidVersion,

    /// A header line is missing its colon or has an invalid name or value.
    #[error("invalid header")]
    InvalidHeader,

    /// `Content-Length` is not a decimal number, or is repeated with different values.
    #[error("invalid content-length")]
    InvalidContentLength,

    /// The request exceeds the configured size limit.
    #[error("request exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// The peer closed the connection before sending a full request.
    #[error("connection closed before the request was complete")]
    UnexpectedEof,
}

/// A failure raised by a handler while processing a request.
///
/// The pipeline turns any `HandlerError` into a `500 Internal Server Error`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A handler-supplied message.
    #[error("{0}")]
    Message(String),

    /// A header name or value could not be encoded.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Any other error a handler wants to bubble up.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Creates a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Message(message.into())
    }

    /// Wraps an arbitrary error.
    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        HandlerError::Other(Box::new(error))
    }
}

/// Errors that prevent a server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The event loop runtime could not be built.
    #[error("failed to build event loop: {0}")]
    Runtime(io::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using ExecutorError as the error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

/// Type alias for Results using ServerError as the error type
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
