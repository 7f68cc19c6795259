//! Error Types
//!
//! This module defines the error types used throughout the backend.
//!
//! # Overview
//!
//! The main error type [`RenderError`] covers all failure modes including:
//! - Illegal state transitions and unknown identifiers
//! - Authorisation failures on the control connection
//! - Resource exhaustion during a render stage
//! - I/O and transport errors
//!
//! Each failure mode has a stable numeric code (see [`RenderError::code`])
//! that is carried in `Failed` and `Error` messages so front-ends can react
//! without parsing English text.
//!
//! Cancellation is modelled as an ordinary error value: the cooperate hook
//! returns [`RenderError::Stopped`], which propagates out of a task's run
//! loop with `?` and is translated to a user abort at the worker wrapper.

use thiserror::Error;

/// Stable numeric error codes carried in protocol messages.
pub mod codes {
    pub const NO_ERROR: i32 = 0;
    pub const USER_ABORT: i32 = 1;
    pub const NOT_NOW: i32 = 2;
    pub const INVALID_IDENTIFIER: i32 = 3;
    pub const AUTHORISATION: i32 = 4;
    pub const OUT_OF_MEMORY: i32 = 5;
    pub const NUMERICAL_LIMIT: i32 = 6;
    pub const CANNOT_OPEN_FILE: i32 = 7;
    pub const NETWORK_CONNECTION: i32 = 8;
    pub const PARAM: i32 = 9;
    pub const CANNOT_HANDLE_REQUEST: i32 = 10;
    pub const UNCATEGORIZED: i32 = 99;
}

/// The main error type for the render backend.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A cooperate point observed a pending stop request.
    ///
    /// Raised only from within task run loops; the worker wrapper converts
    /// it into a clean shutdown rather than a failure.
    #[error("task stop requested")]
    Stopped,

    /// Cancellation acknowledged and reported to the front-end.
    #[error("render cancelled by user")]
    UserAbort,

    /// Illegal state transition (e.g. creating a view before parsing is done).
    #[error("cannot perform this operation right now")]
    NotNow,

    /// Unknown scene or view identifier.
    #[error("invalid scene or view identifier")]
    InvalidIdentifier,

    /// Message received from an address other than the connected front-end.
    #[error("message from unauthorised address")]
    Authorisation,

    /// Allocation failed during a stage.
    #[error("out of memory")]
    OutOfMemory,

    /// Safe-integer overflow in sizing math.
    #[error("numerical limit exceeded: {0}")]
    NumericalLimit(String),

    /// A file could not be opened.
    #[error("cannot open file: {0}")]
    CannotOpenFile(String),

    /// The message transport failed.
    #[error("network connection failure: {0}")]
    NetworkConnection(String),

    /// Malformed option set (e.g. a nonsensical render area).
    #[error("invalid parameter: {0}")]
    Param(String),

    /// The request is not supported by this backend.
    #[error("cannot handle request")]
    CannotHandleRequest,

    /// Catch-all for unexpected failures.
    #[error("{0}")]
    Uncategorized(String),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Returns the stable numeric code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Stopped | Self::UserAbort => codes::USER_ABORT,
            Self::NotNow => codes::NOT_NOW,
            Self::InvalidIdentifier => codes::INVALID_IDENTIFIER,
            Self::Authorisation => codes::AUTHORISATION,
            Self::OutOfMemory => codes::OUT_OF_MEMORY,
            Self::NumericalLimit(_) => codes::NUMERICAL_LIMIT,
            Self::CannotOpenFile(_) => codes::CANNOT_OPEN_FILE,
            Self::NetworkConnection(_) => codes::NETWORK_CONNECTION,
            Self::Param(_) => codes::PARAM,
            Self::CannotHandleRequest => codes::CANNOT_HANDLE_REQUEST,
            Self::Uncategorized(_) | Self::Io(_) => codes::UNCATEGORIZED,
        }
    }

    /// True for the cooperate-raised stop marker.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Condenses the error into a code + text pair for storage.
    #[must_use]
    pub fn failure(&self) -> Failure {
        Failure {
            code: self.code(),
            text: self.to_string(),
        }
    }

    /// Returns the canonical English text for a stable code.
    #[must_use]
    pub fn lookup_code(code: i32) -> &'static str {
        match code {
            codes::NO_ERROR => "no error",
            codes::USER_ABORT => "render cancelled by user",
            codes::NOT_NOW => "cannot perform this operation right now",
            codes::INVALID_IDENTIFIER => "invalid scene or view identifier",
            codes::AUTHORISATION => "message from unauthorised address",
            codes::OUT_OF_MEMORY => "out of memory",
            codes::NUMERICAL_LIMIT => "numerical limit exceeded",
            codes::CANNOT_OPEN_FILE => "cannot open file",
            codes::NETWORK_CONNECTION => "network connection failure",
            codes::PARAM => "invalid parameter",
            codes::CANNOT_HANDLE_REQUEST => "cannot handle request",
            _ => "uncategorized error",
        }
    }
}

/// A captured failure: stable code plus the message text at capture time.
///
/// Stored by tasks and queues where the originating error cannot be kept
/// (errors are not `Clone`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub code: i32,
    pub text: String,
}

impl Failure {
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        Self {
            code,
            text: RenderError::lookup_code(code).to_owned(),
        }
    }
}

impl From<&RenderError> for Failure {
    fn from(e: &RenderError) -> Self {
        e.failure()
    }
}

impl From<RenderError> for Failure {
    fn from(e: RenderError) -> Self {
        e.failure()
    }
}

/// Alias for `Result<T, RenderError>`.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_marker_maps_to_user_abort_code() {
        assert_eq!(RenderError::Stopped.code(), codes::USER_ABORT);
        assert!(RenderError::Stopped.is_stop());
        assert!(!RenderError::UserAbort.is_stop());
    }

    #[test]
    fn failure_capture_preserves_code_and_text() {
        let f = RenderError::Param("bad render area".into()).failure();
        assert_eq!(f.code, codes::PARAM);
        assert!(f.text.contains("bad render area"));
    }
}
