//! Failure classification for collector transport errors.
//!
//! Every transport fault is folded into a closed tagged union so that retry
//! policy can be decided by pattern matching instead of inspecting error
//! chains. Anything unrecognized becomes [`FailureClass::Unknown`] and is
//! retried like a transient fault; no error escalates past its classification.

use std::time::Duration;

use thiserror::Error;
use tonic::{Code, Status};

/// How a transport failure should be handled by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network or timeout fault; retry with backoff.
    Transient,
    /// The collector asked for an immediate reconnect, possibly to another
    /// host; retry with zero delay and a reset attempt counter.
    Rebalance,
    /// The endpoint is permanently gone; stop trying.
    Fatal,
    /// Unrecognized fault; retried like [`FailureClass::Transient`].
    Unknown,
}

impl FailureClass {
    /// True for the classes that wait a backoff delay before retrying.
    pub fn backs_off(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Unknown)
    }
}

/// Map a gRPC status code onto the retry policy.
///
/// `Ok` as a *failure* status is the collector's rebalance signal: the stream
/// was closed cleanly because traffic is being moved elsewhere.
pub fn classify_code(code: Code) -> FailureClass {
    match code {
        Code::Ok => FailureClass::Rebalance,
        Code::Unimplemented => FailureClass::Fatal,
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::ResourceExhausted => {
            FailureClass::Transient
        }
        _ => FailureClass::Unknown,
    }
}

/// UPPER_SNAKE status label used in health signals and log records.
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Errors raised by the channel manager.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No channel to the collector has been published yet.
    #[error("no channel to the collector is open")]
    NoChannel,

    /// The duplex stream is closed or unusable. The owning consumer should
    /// recreate the stream; the channel itself is likely still fine.
    #[error("request stream is no longer usable")]
    StreamClosed,

    /// The connect timeout elapsed before the operation completed.
    #[error("connect timed out after {0:?}")]
    ConnectTimedOut(Duration),

    /// The collector (or the gRPC layer) reported a terminal status.
    #[error("collector returned {0}")]
    Grpc(Status),

    /// Establishing the underlying connection failed.
    #[error("connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),
}

impl TransportError {
    /// Classification deciding the retry policy for this error.
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::NoChannel => FailureClass::Transient,
            TransportError::StreamClosed => FailureClass::Transient,
            TransportError::ConnectTimedOut(_) => FailureClass::Transient,
            TransportError::Grpc(status) => classify_code(status.code()),
            TransportError::Connect(_) => FailureClass::Transient,
        }
    }

    /// Status label for health reporting, when a gRPC status is known.
    pub fn status_label(&self) -> Option<&'static str> {
        match self {
            TransportError::Grpc(status) => Some(code_label(status.code())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_mapping() {
        assert_eq!(classify_code(Code::Ok), FailureClass::Rebalance);
        assert_eq!(classify_code(Code::Unimplemented), FailureClass::Fatal);
        assert_eq!(classify_code(Code::Unavailable), FailureClass::Transient);
        assert_eq!(classify_code(Code::DeadlineExceeded), FailureClass::Transient);
        assert_eq!(classify_code(Code::Cancelled), FailureClass::Transient);
        assert_eq!(classify_code(Code::ResourceExhausted), FailureClass::Transient);
        assert_eq!(classify_code(Code::Internal), FailureClass::Unknown);
        assert_eq!(classify_code(Code::DataLoss), FailureClass::Unknown);
    }

    #[test]
    fn test_error_class_and_label() {
        let err = TransportError::Grpc(Status::new(Code::Unimplemented, "gone"));
        assert_eq!(err.class(), FailureClass::Fatal);
        assert_eq!(err.status_label(), Some("UNIMPLEMENTED"));

        let err = TransportError::Grpc(Status::new(Code::Ok, "rebalanced"));
        assert_eq!(err.class(), FailureClass::Rebalance);
        assert_eq!(err.status_label(), Some("OK"));

        assert_eq!(TransportError::NoChannel.class(), FailureClass::Transient);
        assert_eq!(TransportError::StreamClosed.class(), FailureClass::Transient);
        assert_eq!(TransportError::StreamClosed.status_label(), None);
        assert_eq!(
            TransportError::ConnectTimedOut(Duration::from_secs(10)).class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_unknown_backs_off_like_transient() {
        assert!(FailureClass::Transient.backs_off());
        assert!(FailureClass::Unknown.backs_off());
        assert!(!FailureClass::Rebalance.backs_off());
        assert!(!FailureClass::Fatal.backs_off());
    }
}
