//! Framing failures and the status a failed call ends with.

use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Why a frame could not be written or read. Any of these ends the
/// connection, not just one call.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("peer speaks protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("frame addressed to unknown service {0:#06x}")]
    UnknownMessageType(u16),

    #[error("could not archive envelope: {0}")]
    Serialisation(String),

    #[error("malformed envelope: {0}")]
    Deserialisation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Status codes carried by failed calls.
///
/// Numbering follows the gRPC canonical codes so that statuses read the
/// same in logs on both ends.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    /// The caller cancelled the call.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The request was malformed.
    InvalidArgument = 3,
    /// The deadline expired before the call completed.
    DeadlineExceeded = 4,
    /// A requested entity was not found.
    NotFound = 5,
    /// The entity already exists.
    AlreadyExists = 6,
    /// The caller may not perform this operation.
    PermissionDenied = 7,
    /// A resource (quota, memory) is exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted, typically a concurrency conflict.
    Aborted = 10,
    /// Operation attempted past the valid range.
    OutOfRange = 11,
    /// The method is not implemented by the remote side.
    Unimplemented = 12,
    /// Internal invariant broken.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss.
    DataLoss = 15,
    /// The caller is not authenticated.
    Unauthenticated = 16,
}

impl StatusCode {
    /// All status codes, in numeric order.
    pub const ALL: [Self; 16] = [
        Self::Cancelled,
        Self::Unknown,
        Self::InvalidArgument,
        Self::DeadlineExceeded,
        Self::NotFound,
        Self::AlreadyExists,
        Self::PermissionDenied,
        Self::ResourceExhausted,
        Self::FailedPrecondition,
        Self::Aborted,
        Self::OutOfRange,
        Self::Unimplemented,
        Self::Internal,
        Self::Unavailable,
        Self::DataLoss,
        Self::Unauthenticated,
    ];

    /// Returns the numeric value of this status code.
    #[must_use]
    #[allow(clippy::as_conversions)]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a status code from a numeric value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_u8() == value)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "data_loss",
            Self::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// Terminal status of a failed call.
#[derive(Archive, Serialize, Deserialize, Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    /// Status code.
    pub code: StatusCode,
    /// Human-readable description.
    pub message: String,
}

impl Status {
    /// Creates a status with the given code and message.
    #[must_use]
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a `Cancelled` status.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    /// Creates an `InvalidArgument` status.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// Creates a `DeadlineExceeded` status.
    #[must_use]
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    /// Creates an `Unimplemented` status.
    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    /// Creates a `ResourceExhausted` status.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }

    /// Creates an `Internal` status.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Creates an `Unavailable` status.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// Creates an `Unauthenticated` status.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrip() {
        for code in StatusCode::ALL {
            assert_eq!(StatusCode::from_u8(code.as_u8()), Some(code));
        }
        assert_eq!(StatusCode::from_u8(0), None);
        assert_eq!(StatusCode::from_u8(17), None);
    }

    #[test]
    fn status_codes_match_canonical_numbering() {
        assert_eq!(StatusCode::Cancelled.as_u8(), 1);
        assert_eq!(StatusCode::Unimplemented.as_u8(), 12);
        assert_eq!(StatusCode::Unavailable.as_u8(), 14);
        assert_eq!(StatusCode::Unauthenticated.as_u8(), 16);
    }

    #[test]
    fn status_display() {
        let status = Status::unavailable("coordinator unreachable");
        assert_eq!(status.to_string(), "unavailable: coordinator unreachable");
        assert_eq!(StatusCode::PermissionDenied.to_string(), "permission_denied");
    }
}
