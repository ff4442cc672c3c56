use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::reactor::Handle;

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Clone, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(Arc<io::Error>),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(Arc<io::Error>),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(Arc<io::Error>),

    /// Priority outside `0..MAX_PRIO`
    #[error("invalid priority: {0}")]
    InvalidPriority(u8),

    /// The handle was detached with `suspend()` and must be resumed first
    #[error("handle {0:?} is suspended")]
    Suspended(Handle),

    /// `resume_*` was called for a handle that is not suspended
    #[error("handle {0:?} is not suspended")]
    NotSuspended(Handle),

    /// The handle kind does not fit the requested operation
    #[error("handle {0:?} cannot be used here")]
    InvalidHandle(Handle),

    /// `suspend()` was called while no reader, writer or process was being dispatched
    #[error("no handle is being dispatched")]
    NotDispatching,

    /// Nothing is registered that could ever complete the awaited task
    #[error("nothing left to wait for")]
    Idle,
}

/// Framing errors raised while delimiting a response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Body not empty")]
    BodyNotEmpty,

    #[error("Premature close")]
    PrematureClose,

    #[error("Excess bytes (> Content-Length) read")]
    ExcessBytes,

    #[error("Data after last chunk")]
    DataAfterLastChunk,

    #[error("Malformed chunk size")]
    MalformedChunkSize,

    #[error("Missing CRLF after chunk data")]
    MissingChunkTerminator,

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Malformed response head")]
    MalformedHead,

    #[error("Response head too large")]
    HeadTooLarge,
}

/// Requests the engine refuses to perform, or responses it cannot follow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("CONNECT method unsupported")]
    ConnectMethod,

    #[error("1XX status code received: {0}")]
    Informational(u16),
}

/// The crate-wide error type.
///
/// Cloneable so that a settled [`Suspend`](crate::Suspend) can hand out the
/// same failure on every `get_result` call.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// DNS failure, refused connection or a non-zero `SO_ERROR` after connect
    #[error("connect failed: {0}")]
    Connect(Arc<io::Error>),

    /// TLS negotiation failed or did not finish within the retry budget
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("Suspend already settled")]
    AlreadySettled,

    #[error("Suspend not settled yet")]
    NotSettled,

    /// The task producing the result was aborted before it completed
    #[error("task aborted")]
    Aborted,

    #[error("configuration error: {0}")]
    Config(String),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<io::Error> for ReactorError {
    fn from(err: io::Error) -> Self {
        ReactorError::Registration(Arc::new(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Whether a failure on a reused pooled socket may be retried on a fresh
    /// connection. Timeouts, aborts and usage errors are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connect(_) | Error::Handshake(_) | Error::Framing(_) | Error::Io(_) => true,
            Error::Reactor(ReactorError::Registration(_)) => true,
            _ => false,
        }
    }

    pub(crate) fn connect(err: io::Error) -> Self {
        Error::Connect(Arc::new(err))
    }
}

/// Type alias for Results using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;
