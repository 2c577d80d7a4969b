//! Error types for Taproom.

use crate::status::StatusTransitionError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`TaproomError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed inbound message.
    Decode,
    /// Illegal transition, parent already completed, unknown target.
    Validation,
    /// A command failed on the remote side and the caller asked to raise.
    Execution,
    /// Broker or HTTP connectivity.
    Transport,
    /// The caller gave up waiting.
    Timeout,
    /// The component is shutting down.
    Shutdown,
    /// Bad configuration.
    Config,
}

/// Taproom error type.
#[derive(Error, Debug)]
pub enum TaproomError {
    /// Inbound message could not be decoded into a well-formed request
    #[error("Decode error: {0}")]
    Decode(String),

    /// Generic validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Status lattice violation at persistence time
    #[error(transparent)]
    StatusTransition(#[from] StatusTransitionError),

    /// Attempted to parent a new request onto a completed one
    #[error("Parent request {parent_id} is already {status}, cannot create a child request")]
    ParentCompleted { parent_id: String, status: String },

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other transport failure (server errors, broker unavailable)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded retry loop gave up
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<TaproomError>,
    },

    /// Timeout waiting for a request to complete
    #[error("Timeout waiting for request {request_id} to complete after {waited:?}")]
    Timeout { request_id: String, waited: Duration },

    /// The remote command finished in ERROR and the caller asked to raise
    #[error("Request {request_id} failed: {message}")]
    RequestFailed { request_id: String, message: String },

    /// Dispatcher or consumer no longer accepts work
    #[error("Shut down: {0}")]
    ShutDown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaproomError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaproomError::Decode(_) | TaproomError::Json(_) => ErrorKind::Decode,
            TaproomError::Validation(_)
            | TaproomError::StatusTransition(_)
            | TaproomError::ParentCompleted { .. }
            | TaproomError::NotFound(_) => ErrorKind::Validation,
            TaproomError::RequestFailed { .. } => ErrorKind::Execution,
            TaproomError::Redis(_)
            | TaproomError::Http(_)
            | TaproomError::Transport(_)
            | TaproomError::RetriesExhausted { .. } => ErrorKind::Transport,
            TaproomError::Timeout { .. } => ErrorKind::Timeout,
            TaproomError::ShutDown(_) => ErrorKind::Shutdown,
            TaproomError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// An exhausted retry loop is itself not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            TaproomError::Redis(_) | TaproomError::Transport(_) => true,
            TaproomError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Whether this is a validation-class error.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

/// Result type for Taproom operations.
pub type TaproomResult<T> = Result<T, TaproomError>;

/// Error returned by a command handler.
///
/// Any `std::error::Error` converts into a `CommandError` through `?`, keeping
/// its message and the short name of its type as the error class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    message: String,
    class: String,
}

impl CommandError {
    /// Create an error with a message and the generic `CommandError` class.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: "CommandError".to_string(),
        }
    }

    /// Override the error class.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Short error class name.
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for CommandError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            message: err.to_string(),
            class: short_type_name::<E>().to_string(),
        }
    }
}

/// `std::any::type_name` without the module path or generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_from_std_error_keeps_message_and_class() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: CommandError = io.into();
        assert_eq!(err.message(), "disk on fire");
        assert_eq!(err.class(), "Error");

        let parse: CommandError = "x".parse::<i32>().unwrap_err().into();
        assert_eq!(parse.class(), "ParseIntError");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(TaproomError::Decode("x".into()).kind(), ErrorKind::Decode);
        assert_eq!(
            TaproomError::ParentCompleted {
                parent_id: "p".into(),
                status: "SUCCESS".into()
            }
            .kind(),
            ErrorKind::Validation
        );
        assert!(TaproomError::Transport("down".into()).is_transient());
        assert!(!TaproomError::Validation("bad".into()).is_transient());

        let exhausted = TaproomError::RetriesExhausted {
            operation: "publish".into(),
            attempts: 3,
            last: Box::new(TaproomError::Transport("down".into())),
        };
        assert_eq!(exhausted.kind(), ErrorKind::Transport);
        assert!(!exhausted.is_transient());
    }
}
