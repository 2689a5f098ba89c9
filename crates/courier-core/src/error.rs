//! Error types for the Courier RPC layer.
//!
//! Every failure in this crate is scoped to one call or one peer connection;
//! nothing here is fatal to the process. The station classifies errors into
//! [`StationErrorKind`] before routing them to an error handler or the event
//! channel.

use crate::codec::CodecError;
use crate::protocol::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Courier.
#[derive(Debug, Error)]
pub enum RpcError {
    // Lifecycle errors
    #[error("RPC component is not running")]
    NotStarted,

    #[error("{component} has already started")]
    AlreadyStarted { component: &'static str },

    // Registry and routing errors
    #[error("No target server: {server_id}")]
    NoTargetServer { server_id: String },

    #[error("No servers available for server type {server_type}")]
    NoServersForType { server_type: String },

    #[error("Routing failed for {server_type}: {message}")]
    Route { server_type: String, message: String },

    // Connection errors
    #[error("Connect to {server_id} timed out after {timeout:?}")]
    ConnectTimeout { server_id: String, timeout: Duration },

    #[error("Failed to connect to {server_id}: {message}")]
    ConnectFailed { server_id: String, message: String },

    #[error("Could not find mailbox for {server_id}")]
    MailboxNotFound { server_id: String },

    #[error("Mailbox for {server_id} is not connected")]
    MailboxNotConnected { server_id: String },

    #[error("Mailbox for {server_id} has already closed")]
    MailboxClosed { server_id: String },

    #[error("Failed to send message to {server_id}: {message}")]
    SendFailed { server_id: String, message: String },

    #[error("Request {request_id} to {server_id} timed out after {timeout:?}")]
    RequestTimeout {
        server_id: String,
        request_id: u32,
        timeout: Duration,
    },

    #[error("Disconnected from remote server {server_id}")]
    Disconnected { server_id: String },

    #[error("Pending queue for {server_id} is full ({limit} entries)")]
    PendingQueueFull { server_id: String, limit: usize },

    // Filter pipeline errors
    #[error("Filter error: {message}")]
    Filter { message: String },

    // Wire errors
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Invalid frame: {message}")]
    Frame { message: String },

    // Dispatch errors
    #[error("no such namespace: {0}")]
    NoSuchNamespace(String),

    #[error("no such service: {0}")]
    NoSuchService(String),

    #[error("no such method: {0}")]
    NoSuchMethod(String),

    #[error("Remote error: {message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // IO and serialization errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Courier operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote {
            message: err.msg,
            stack: err.stack,
        }
    }
}

/// Failure categories reported by the mail station.
///
/// Codes match the numbering used on the station event channel:
/// 1 not started, 2 no target server, 3 connect failure, 4 missing mailbox,
/// 5 send failure, 6 filter error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StationErrorKind {
    NotStarted,
    NoTargetServer,
    FailConnectServer,
    FailFindMailbox,
    FailSendMessage,
    FilterError,
}

impl StationErrorKind {
    /// Numeric code of the category, 1 through 6.
    pub fn code(&self) -> u8 {
        match self {
            StationErrorKind::NotStarted => 1,
            StationErrorKind::NoTargetServer => 2,
            StationErrorKind::FailConnectServer => 3,
            StationErrorKind::FailFindMailbox => 4,
            StationErrorKind::FailSendMessage => 5,
            StationErrorKind::FilterError => 6,
        }
    }
}

impl std::fmt::Display for StationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StationErrorKind::NotStarted => "not-started",
            StationErrorKind::NoTargetServer => "no-target-server",
            StationErrorKind::FailConnectServer => "fail-connect-server",
            StationErrorKind::FailFindMailbox => "fail-find-mailbox",
            StationErrorKind::FailSendMessage => "fail-send-message",
            StationErrorKind::FilterError => "filter-error",
        };
        f.write_str(name)
    }
}

impl RpcError {
    /// Classify this error into a station failure category.
    ///
    /// Anything that happened after a mailbox accepted the call (timeouts,
    /// disconnects, codec failures) counts as a send failure.
    pub fn station_kind(&self) -> StationErrorKind {
        match self {
            RpcError::NotStarted => StationErrorKind::NotStarted,
            RpcError::NoTargetServer { .. } => StationErrorKind::NoTargetServer,
            RpcError::ConnectTimeout { .. } | RpcError::ConnectFailed { .. } => {
                StationErrorKind::FailConnectServer
            }
            RpcError::MailboxNotFound { .. } => StationErrorKind::FailFindMailbox,
            RpcError::Filter { .. } => StationErrorKind::FilterError,
            _ => StationErrorKind::FailSendMessage,
        }
    }

    /// Check if a caller could reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectTimeout { .. }
                | RpcError::ConnectFailed { .. }
                | RpcError::RequestTimeout { .. }
                | RpcError::Disconnected { .. }
                | RpcError::MailboxNotConnected { .. }
                | RpcError::MailboxClosed { .. }
                | RpcError::PendingQueueFull { .. }
        )
    }

    /// Render this error for the error slot of a response envelope.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            RpcError::Remote { message, stack } => RemoteError {
                msg: message.clone(),
                stack: stack.clone(),
            },
            other => RemoteError {
                msg: other.to_string(),
                stack: None,
            },
        }
    }
}
