// This module defines the error types of the remote-compilation protocol using the thiserror
// crate. StreamError is the small closed taxonomy of transport-level failures (closed
// connection, version mismatch, payload type mismatch, protocol corruption, interruption and
// the sequencing/session terminations); it is propagated as a value and never as a panic.
// CompilationErrorCode is the structured status code carried by a compilationFailure
// response; it has an explicit valid range so a corrupt status is detected as protocol
// corruption rather than read as a legitimate failure. CompileFailure is what every failed
// remote compilation ultimately surfaces as, and CommitError explains why a guard commit was
// aborted on the client. ConfigError reports invalid configuration values.

//! Error types for the remote compilation protocol.
//!
//! Using thiserror for idiomatic error handling.

use crate::core::ids::{ClassId, MethodId};
use crate::protocol::message::ServerLoad;
use thiserror::Error;

/// Transport-level failure of a client/server stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Connection reset, closed, or a read/write failed.
    #[error("stream failure: {reason}")]
    TransportClosed { reason: String },

    /// Peer speaks a different protocol version.
    #[error("protocol version incompatible: local {local:#x}, remote {remote:#x}")]
    VersionIncompatible { local: u32, remote: u32 },

    /// Received message does not have the shape expected for its kind.
    #[error("message type mismatch: {detail}")]
    TypeMismatch { detail: String },

    /// Unknown message kind or out-of-range status; the byte stream can no longer be trusted.
    #[error("protocol corruption: {detail}")]
    ProtocolCorruption { detail: String },

    /// The peer abandoned the compilation in progress.
    #[error("compilation interrupted by peer")]
    Interrupted,

    /// The request arrived after a newer one from the same client was already processed.
    #[error("out-of-sequence request {seq_no}, expected {expected}")]
    OutOfSequence { seq_no: u32, expected: u32 },

    /// The client is shutting down its session.
    #[error("client session terminated")]
    ClientSessionTerminated,

    /// The client closed this connection on purpose.
    #[error("connection terminated by client")]
    ConnectionTerminated,
}

impl StreamError {
    pub fn closed(reason: impl Into<String>) -> Self {
        StreamError::TransportClosed { reason: reason.into() }
    }

    pub fn mismatch(detail: impl Into<String>) -> Self {
        StreamError::TypeMismatch { detail: detail.into() }
    }

    pub fn corruption(detail: impl Into<String>) -> Self {
        StreamError::ProtocolCorruption { detail: detail.into() }
    }

    /// Whether the connection must be torn down after this error.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(self, StreamError::Interrupted | StreamError::OutOfSequence { .. })
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::closed(err.to_string())
    }
}

/// Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Structured status of a compilation, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompilationErrorCode {
    Ok = 0,
    Failure = 1,
    NotNeeded = 2,
    Restricted = 3,
    ExcessiveComplexity = 4,
    Interrupted = 5,
    CodeReservationFailure = 6,
    AotRelocationFailure = 7,
    ChTableCommitFailure = 8,
    TrampolineFailure = 9,
    LowPhysicalMemory = 10,
    StreamFailure = 11,
    StreamLostMessage = 12,
    StreamMessageTypeMismatch = 13,
    StreamVersionIncompatible = 14,
    StreamInterrupted = 15,
    ThreadCrashed = 16,
    ServerUnavailable = 17,
}

impl CompilationErrorCode {
    /// First status value outside the valid range.
    pub const MAX: u32 = 18;

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, CompilationErrorCode::Ok | CompilationErrorCode::NotNeeded)
    }

    /// Failures after which the same method should simply be compiled locally.
    pub fn should_retry_locally(self) -> bool {
        matches!(
            self,
            CompilationErrorCode::ChTableCommitFailure
                | CompilationErrorCode::AotRelocationFailure
                | CompilationErrorCode::TrampolineFailure
                | CompilationErrorCode::StreamFailure
                | CompilationErrorCode::StreamVersionIncompatible
                | CompilationErrorCode::StreamMessageTypeMismatch
                | CompilationErrorCode::ServerUnavailable
                | CompilationErrorCode::ThreadCrashed
        )
    }

    /// Failures that carry server load feedback for admission control.
    pub fn carries_load_feedback(self) -> bool {
        matches!(self, CompilationErrorCode::Ok | CompilationErrorCode::LowPhysicalMemory)
    }
}

impl TryFrom<u32> for CompilationErrorCode {
    type Error = StreamError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use CompilationErrorCode::*;
        const ALL: [CompilationErrorCode; CompilationErrorCode::MAX as usize] = [
            Ok,
            Failure,
            NotNeeded,
            Restricted,
            ExcessiveComplexity,
            Interrupted,
            CodeReservationFailure,
            AotRelocationFailure,
            ChTableCommitFailure,
            TrampolineFailure,
            LowPhysicalMemory,
            StreamFailure,
            StreamLostMessage,
            StreamMessageTypeMismatch,
            StreamVersionIncompatible,
            StreamInterrupted,
            ThreadCrashed,
            ServerUnavailable,
        ];
        ALL.get(value as usize).copied().ok_or_else(|| {
            StreamError::corruption(format!(
                "status code {} outside the valid range 0..{}",
                value,
                CompilationErrorCode::MAX
            ))
        })
    }
}

impl From<&StreamError> for CompilationErrorCode {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::TransportClosed { .. }
            | StreamError::ClientSessionTerminated
            | StreamError::ConnectionTerminated => CompilationErrorCode::StreamFailure,
            StreamError::VersionIncompatible { .. } => CompilationErrorCode::StreamVersionIncompatible,
            StreamError::TypeMismatch { .. } | StreamError::ProtocolCorruption { .. } => {
                CompilationErrorCode::StreamMessageTypeMismatch
            }
            StreamError::Interrupted => CompilationErrorCode::StreamInterrupted,
            StreamError::OutOfSequence { .. } => CompilationErrorCode::StreamLostMessage,
        }
    }
}

/// A failed remote compilation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("remote compilation failed ({code:?}): {reason}")]
pub struct CompileFailure {
    pub code: CompilationErrorCode,
    pub reason: String,
    /// Server load reported alongside the failure, if any.
    pub feedback: Option<ServerLoad>,
    /// Set when the failure came from the transport rather than the compiler.
    pub stream_error: Option<StreamError>,
}

impl CompileFailure {
    pub fn new(code: CompilationErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            feedback: None,
            stream_error: None,
        }
    }

    pub fn with_feedback(mut self, feedback: Option<ServerLoad>) -> Self {
        self.feedback = feedback;
        self
    }
}

impl From<StreamError> for CompileFailure {
    fn from(err: StreamError) -> Self {
        Self {
            code: CompilationErrorCode::from(&err),
            reason: err.to_string(),
            feedback: None,
            stream_error: Some(err),
        }
    }
}

/// Why a guard commit was aborted. Any of these leaves the method uninstalled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("{class} was newly extended while the server was compiling")]
    NewlyExtended { class: ClassId },

    #[error("pre-existence assumption on {method} broken: method is overridden")]
    MethodOverridden { method: MethodId },

    #[error("pre-existence assumption on {class} broken: class has been extended")]
    ClassExtended { class: ClassId },

    #[error("{class} gained a subclass not seen by the server")]
    UnexpectedSubclass { class: ClassId },

    #[error("static final field of {class} was modified")]
    StaticFinalFieldModified { class: ClassId },
}

impl From<CommitError> for CompileFailure {
    fn from(err: CommitError) -> Self {
        CompileFailure::new(CompilationErrorCode::ChTableCommitFailure, err.to_string())
    }
}

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_range() {
        assert_eq!(CompilationErrorCode::try_from(0), Ok(CompilationErrorCode::Ok));
        assert_eq!(
            CompilationErrorCode::try_from(CompilationErrorCode::MAX - 1),
            Ok(CompilationErrorCode::ServerUnavailable)
        );
        assert!(matches!(
            CompilationErrorCode::try_from(CompilationErrorCode::MAX),
            Err(StreamError::ProtocolCorruption { .. })
        ));
        for code in 0..CompilationErrorCode::MAX {
            let parsed = CompilationErrorCode::try_from(code).unwrap();
            assert_eq!(parsed.as_u32(), code);
        }
    }

    #[test]
    fn test_stream_error_maps_to_status() {
        let err = StreamError::VersionIncompatible { local: 1, remote: 2 };
        let failure = CompileFailure::from(err.clone());
        assert_eq!(failure.code, CompilationErrorCode::StreamVersionIncompatible);
        assert_eq!(failure.stream_error, Some(err));
        assert!(StreamError::closed("reset").is_fatal_for_connection());
        assert!(!StreamError::Interrupted.is_fatal_for_connection());
    }
}
