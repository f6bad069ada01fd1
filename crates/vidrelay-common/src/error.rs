//! Unified error type for vidrelay.
//!
//! Every failure a session can hit is funnelled into [`Error`], which carries
//! enough context for the HTTP layer to derive a status code via
//! [`Error::http_status`].

use std::fmt;

/// Unified error type covering all failure modes of the session core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The acquisition gate is full. No resources were allocated.
    #[error("Capacity exceeded: {in_flight}/{capacity} acquisitions in flight")]
    CapacityExceeded {
        /// Acquisitions running at the time of the rejection.
        in_flight: usize,
        /// Configured gate capacity.
        capacity: usize,
    },

    /// Downloading the remote source failed.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The transcoding engine failed or produced no usable output.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "session", "segment").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The session exists but its output is not playable yet.
    #[error("Session not ready: {0}")]
    NotReady(String),

    /// A live session with the same id already exists.
    #[error("Session already in flight: {0}")]
    DuplicateInFlight(String),

    /// A state change that the session state graph does not allow.
    #[error("Invalid transition for session {id}: {from} -> {to}")]
    InvalidTransition {
        /// Session whose transition was rejected.
        id: String,
        /// State the session was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An external tool (ffmpeg) could not be run.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::CapacityExceeded { .. } => 503,
            Error::Fetch(_) => 502,
            Error::Encoding(_) => 502,
            Error::NotFound { .. } => 404,
            Error::NotReady(_) => 409,
            Error::DuplicateInFlight(_) => 409,
            Error::InvalidTransition { .. } => 409,
            Error::Validation(_) => 400,
            Error::Tool { .. } => 502,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::Fetch(_) => "fetch_error",
            Error::Encoding(_) => "encoding_error",
            Error::NotFound { .. } => "not_found",
            Error::NotReady(_) => "not_ready",
            Error::DuplicateInFlight(_) => "duplicate_in_flight",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Validation(_) => "validation_error",
            Error::Tool { .. } => "tool_error",
            Error::Io { .. } => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the session itself failed and moved to
    /// `Failed` (as opposed to a request-level rejection).
    pub fn is_session_failure(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Encoding(_))
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
