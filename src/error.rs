//! Error types for the tape-server reactor and fork-control protocol
//!
//! Three failure domains, each with its own typed error:
//! - [`FrameError`]: framing and payload (de)serialization on a socket
//! - [`ReactorError`]: handler registry and event dispatch
//! - [`ForkerError`]: requests and replies between the daemon and its ProcessForker

use crate::daemon::protocol::MsgType;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while writing or reading a single frame
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer did not make the requested bytes available in time
    #[error("Failed to read {what}: Timed out after {timeout:?}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },

    /// The peer closed the connection before all requested bytes arrived
    #[error("Failed to read {what}: Incomplete read: expectedNbBytes={expected} actualNbBytes={actual}")]
    ShortRead {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A write() transferred fewer bytes than requested
    #[error("Failed to write {what}: Incomplete write: expectedNbBytes={expected} actualNbBytes={actual}")]
    ShortWrite {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The operating system reported an error
    #[error("Failed to {op} {what}: {source}")]
    Io {
        op: &'static str,
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Payload length must be greater than 0")]
    EmptyPayload,

    #[error("Maximum payload length exceeded: max={max} actual={actual}")]
    PayloadTooLarge { max: usize, actual: usize },

    /// A payload was parsed as a schema that does not match the frame's tag
    #[error("Failed to parse {expected} payload: Unexpected message type: type={actual}")]
    UnexpectedType { expected: MsgType, actual: &'static str },

    #[error("Failed to serialize {msg_type} payload: {source}")]
    Encode {
        msg_type: MsgType,
        #[source]
        source: bincode::Error,
    },

    #[error("Failed to parse {msg_type} payload: payloadLen={len}: {source}")]
    Decode {
        msg_type: MsgType,
        len: usize,
        #[source]
        source: bincode::Error,
    },
}

impl FrameError {
    /// True when the failure was a timeout rather than a broken or misbehaving peer
    pub fn is_timeout(&self) -> bool {
        matches!(self, FrameError::Timeout { .. })
    }

    /// True when the peer closed the connection without sending a single byte
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, FrameError::ShortRead { actual: 0, .. })
    }
}

/// Errors raised by the poll reactor
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Failed to register event handler: Handler already registered for fd={fd}")]
    AlreadyRegistered { fd: RawFd },

    #[error("Failed to remove event handler: Handler not found for fd={fd}")]
    NotRegistered { fd: RawFd },

    /// The registry lost a handler between building the poll set and dispatching
    #[error("Failed to dispatch event handler: Handler not found for fd={fd}")]
    HandlerMissing { fd: RawFd },

    #[error("Failed to allocate poll set for {nb_handlers} handlers: Out of memory")]
    OutOfMemory { nb_handlers: usize },

    #[error("Event handler for fd={fd} failed: {source:#}")]
    HandlerFailed {
        fd: RawFd,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised on either side of the ProcessForker command channel
#[derive(Debug, Error)]
pub enum ForkerError {
    /// A frame could not be exchanged; `context` names the operation
    #[error("Failed to {context}: {source}")]
    Frame {
        context: &'static str,
        #[source]
        source: FrameError,
    },

    /// The peer replied with a message type that is neither the expected one nor an Exception
    #[error("Protocol violation: Unexpected reply type: expected={expected} actual={actual}")]
    ProtocolViolation {
        expected: MsgType,
        actual: &'static str,
    },

    /// The peer reported a failure; displays the remote message verbatim
    #[error("{message}")]
    Remote { code: u32, message: String },

    #[error("ProcessForker returned an unexpected value: expected=0 actual={value}")]
    UnexpectedReturnValue { value: u32 },

    #[error("Failed to dispatch message handler: Unknown message type: type={msg_type}")]
    UnknownMessageType { msg_type: u32 },

    #[error("Failed to fork {what}: {source}")]
    Fork {
        what: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to fork {kind} session: {source}")]
    ForkSession {
        kind: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to wait for child process: pid={pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to create {what} socket pair: {source}")]
    SocketPair {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ForkerError {
    /// Wrap a frame error with the operation that was being attempted
    pub fn frame(context: &'static str) -> impl FnOnce(FrameError) -> ForkerError {
        move |source| ForkerError::Frame { context, source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ForkerError::Frame { source, .. } if source.is_timeout())
    }

    /// Code placed in the Exception reply that reports this error to the peer
    pub fn code(&self) -> u32 {
        match self {
            ForkerError::Remote { code, .. } => *code,
            ForkerError::Fork { source, .. } | ForkerError::ForkSession { source, .. } => *source as u32,
            _ => GENERIC_ERROR_CODE,
        }
    }
}

/// Exception code used when no more specific code is available
pub const GENERIC_ERROR_CODE: u32 = 666;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinct_from_short_read() {
        let timeout = FrameError::Timeout {
            what: "payload type",
            timeout: Duration::from_secs(1),
        };
        let short = FrameError::ShortRead {
            what: "payload type",
            expected: 4,
            actual: 2,
        };
        assert!(timeout.is_timeout());
        assert!(!short.is_timeout());
        assert!(!short.is_connection_closed());
    }

    #[test]
    fn test_short_read_message_carries_byte_counts() {
        let err = FrameError::ShortRead {
            what: "payload length",
            expected: 4,
            actual: 0,
        };
        assert!(err.is_connection_closed());
        let message = err.to_string();
        assert!(message.contains("expectedNbBytes=4"));
        assert!(message.contains("actualNbBytes=0"));
    }

    #[test]
    fn test_remote_error_displays_message_verbatim() {
        let err = ForkerError::Remote {
            code: 5,
            message: "Drive is busy".to_string(),
        };
        assert_eq!(err.to_string(), "Drive is busy");
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn test_forker_error_wraps_frame_context() {
        let err = ForkerError::frame("read ReturnValue reply")(FrameError::Timeout {
            what: "payload type",
            timeout: Duration::from_secs(10),
        });
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("Failed to read ReturnValue reply: "));
    }

    #[test]
    fn test_protocol_violation_names_both_types() {
        let err = ForkerError::ProtocolViolation {
            expected: MsgType::ReturnValue,
            actual: "ForkSucceeded",
        };
        let message = err.to_string();
        assert!(message.contains("expected=ReturnValue"));
        assert!(message.contains("actual=ForkSucceeded"));
        assert_eq!(err.code(), GENERIC_ERROR_CODE);
    }

    #[test]
    fn test_fork_session_error_carries_errno() {
        let err = ForkerError::ForkSession {
            kind: "label",
            source: nix::errno::Errno::EAGAIN,
        };
        assert!(err.to_string().starts_with("Failed to fork label session: "));
        assert_eq!(err.code(), libc::EAGAIN as u32);
    }

    #[test]
    fn test_reactor_error_names_fd() {
        let err = ReactorError::AlreadyRegistered { fd: 1234 };
        assert!(err.to_string().contains("fd=1234"));
    }
}
