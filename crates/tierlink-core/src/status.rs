//! Domain failure taxonomy and its mapping from wire statuses.
//!
//! Every failure a call can surface is a [`StatusError`]. The mapping from a
//! wire [`Status`] is a pure table so it can be tested exhaustively.

use thiserror::Error;
use tierlink_proto::{Status, StatusCode};

/// Message used when the remote side does not speak the auth protocol.
pub const AUTH_DISABLED_MESSAGE: &str = "Authentication is disabled on target host";

/// Failure kinds surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// Credentials rejected or the mechanism failed.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Transport unreachable, local cancellation or timeout.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The remote side declines to authenticate at all.
    #[error("Authentication is disabled on target host")]
    AuthDisabled,

    /// Unrecognised failure, original message preserved.
    #[error("unknown: {0}")]
    Unknown(String),

    /// A stream reached a state with no recovery other than a full retry.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("data loss: {0}")]
    DataLoss(String),
}

impl StatusError {
    /// Translates a wire status into the domain taxonomy.
    ///
    /// `Unimplemented` stays `Unimplemented` here; only the authentication
    /// path turns it into [`StatusError::AuthDisabled`].
    #[must_use]
    pub fn from_status(status: &Status) -> Self {
        let message = status.message.clone();
        match status.code {
            StatusCode::Cancelled => Self::Cancelled(message),
            StatusCode::Unknown => Self::Unknown(message),
            StatusCode::InvalidArgument => Self::InvalidArgument(message),
            StatusCode::DeadlineExceeded => Self::DeadlineExceeded(message),
            StatusCode::NotFound => Self::NotFound(message),
            StatusCode::AlreadyExists => Self::AlreadyExists(message),
            StatusCode::PermissionDenied => Self::PermissionDenied(message),
            StatusCode::ResourceExhausted => Self::ResourceExhausted(message),
            StatusCode::FailedPrecondition => Self::FailedPrecondition(message),
            StatusCode::Aborted => Self::Aborted(message),
            StatusCode::OutOfRange => Self::OutOfRange(message),
            StatusCode::Unimplemented => Self::Unimplemented(message),
            StatusCode::Internal => Self::Internal(message),
            StatusCode::Unavailable => Self::Unavailable(message),
            StatusCode::DataLoss => Self::DataLoss(message),
            StatusCode::Unauthenticated => Self::Unauthenticated(message),
        }
    }

    /// Translates a status received on the authentication stream.
    #[must_use]
    pub fn from_auth_status(status: &Status) -> Self {
        if status.code == StatusCode::Unimplemented {
            Self::AuthDisabled
        } else {
            Self::from_status(status)
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Converts back into a wire status.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let (code, message) = match self {
            Self::Unauthenticated(m) => (StatusCode::Unauthenticated, m.as_str()),
            Self::Unavailable(m) => (StatusCode::Unavailable, m.as_str()),
            Self::AuthDisabled => (StatusCode::Unimplemented, AUTH_DISABLED_MESSAGE),
            Self::Unknown(m) => (StatusCode::Unknown, m.as_str()),
            Self::InvalidState(m) => (StatusCode::FailedPrecondition, m.as_str()),
            Self::Cancelled(m) => (StatusCode::Cancelled, m.as_str()),
            Self::InvalidArgument(m) => (StatusCode::InvalidArgument, m.as_str()),
            Self::DeadlineExceeded(m) => (StatusCode::DeadlineExceeded, m.as_str()),
            Self::NotFound(m) => (StatusCode::NotFound, m.as_str()),
            Self::AlreadyExists(m) => (StatusCode::AlreadyExists, m.as_str()),
            Self::PermissionDenied(m) => (StatusCode::PermissionDenied, m.as_str()),
            Self::ResourceExhausted(m) => (StatusCode::ResourceExhausted, m.as_str()),
            Self::FailedPrecondition(m) => (StatusCode::FailedPrecondition, m.as_str()),
            Self::Aborted(m) => (StatusCode::Aborted, m.as_str()),
            Self::OutOfRange(m) => (StatusCode::OutOfRange, m.as_str()),
            Self::Unimplemented(m) => (StatusCode::Unimplemented, m.as_str()),
            Self::Internal(m) => (StatusCode::Internal, m.as_str()),
            Self::DataLoss(m) => (StatusCode::DataLoss, m.as_str()),
        };
        Status::new(code, message)
    }
}

impl From<Status> for StatusError {
    fn from(status: Status) -> Self {
        Self::from_status(&status)
    }
}

impl From<&Status> for StatusError {
    fn from(status: &Status) -> Self {
        Self::from_status(status)
    }
}
