// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Secure conversation error types with diagnostics.
//!
//! Errors are grouped by the layer that raised them, so callers can decide
//! whether the secure channel is still usable after a failure:
//!
//! ```text
//! UaError
//! ├── Connection    - Transport and negotiation failures (channel fatal)
//! ├── Sequence      - Lost or reordered chunks (channel fatal)
//! ├── Security      - Padding, signature, encryption and certificate failures
//! ├── Session       - CreateSession / ActivateSession failures
//! ├── Transaction   - Request ordering invariant violations
//! ├── Codec         - Malformed or oversized messages
//! ├── Configuration - Invalid settings
//! ├── Timeout       - A round-trip did not complete in time
//! └── ServiceFault  - The server answered with a bad status code
//! ```
//!
//! # Examples
//!
//! ```
//! use fieldlink_opcua::error::{SecurityError, UaError};
//!
//! let error = UaError::security(SecurityError::malformed_padding(3, 0x07, 0x06));
//! assert!(error.is_channel_fatal());
//! assert!(!error.is_retryable());
//!
//! let fault = UaError::service_fault(0x8024_0000);
//! assert_eq!(fault.to_string(), "Server returned error BadNonceInvalid (0x80240000)");
//! ```

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

// =============================================================================
// UaError - Main Error Type
// =============================================================================

/// The main error type for secure conversation operations.
#[derive(Debug, Error)]
pub enum UaError {
    /// Transport-level errors.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Sequence number violations.
    #[error("{0}")]
    Sequence(#[from] SequenceError),

    /// Security and cryptography errors.
    #[error("{0}")]
    Security(#[from] SecurityError),

    /// Session lifecycle errors.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Transaction ordering errors.
    #[error("{0}")]
    Transaction(#[from] TransactionError),

    /// Message encoding and decoding errors.
    #[error("{0}")]
    Codec(#[from] CodecError),

    /// Configuration errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Timeout errors.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// The server answered a request with a `ServiceFault`.
    #[error("Server returned error {status_name} (0x{status_code:08X})")]
    ServiceFault {
        /// Numeric status code from the response header.
        status_code: u32,
        /// Symbolic name of the status code.
        status_name: &'static str,
    },
}

impl UaError {
    // =========================================================================
    // Factory Methods
    // =========================================================================

    /// Creates a connection error.
    #[inline]
    pub fn connection(error: ConnectionError) -> Self {
        Self::Connection(error)
    }

    /// Creates a sequence error.
    #[inline]
    pub fn sequence(error: SequenceError) -> Self {
        Self::Sequence(error)
    }

    /// Creates a security error.
    #[inline]
    pub fn security(error: SecurityError) -> Self {
        Self::Security(error)
    }

    /// Creates a session error.
    #[inline]
    pub fn session(error: SessionError) -> Self {
        Self::Session(error)
    }

    /// Creates a transaction error.
    #[inline]
    pub fn transaction(error: TransactionError) -> Self {
        Self::Transaction(error)
    }

    /// Creates a codec error.
    #[inline]
    pub fn codec(error: CodecError) -> Self {
        Self::Codec(error)
    }

    /// Creates a configuration error.
    #[inline]
    pub fn configuration(error: ConfigurationError) -> Self {
        Self::Configuration(error)
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(error: TimeoutError) -> Self {
        Self::Timeout(error)
    }

    /// Creates a service fault error, resolving the symbolic status name.
    pub fn service_fault(status_code: u32) -> Self {
        Self::ServiceFault {
            status_code,
            status_name: status_code_name(status_code).unwrap_or("Unknown"),
        }
    }

    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Connection(ConnectionError::NotConnected)
    }

    /// Creates a channel closed error.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Connection(ConnectionError::closed(Some(reason.into())))
    }

    /// Creates a sequence violation error.
    pub fn sequence_violation(expected: u32, received: u32) -> Self {
        Self::Sequence(SequenceError::violation(expected, received))
    }

    /// Creates a request timeout error.
    pub fn request_timeout(request_id: u32, duration: Duration) -> Self {
        Self::Timeout(TimeoutError::request(request_id, duration))
    }

    /// Creates a decoding error.
    pub fn decoding(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Codec(CodecError::invalid_value(field, reason))
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns `true` if this error is retryable.
    ///
    /// Retryable errors leave the channel usable, so a fresh `submit` may
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::ServiceFault { status_code, .. } => is_transient_status(*status_code),
            Self::Sequence(_)
            | Self::Security(_)
            | Self::Transaction(_)
            | Self::Codec(_)
            | Self::Configuration(_) => false,
        }
    }

    /// Returns `true` if the secure channel must be torn down after this error.
    pub fn is_channel_fatal(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_channel_fatal(),
            Self::Sequence(_) => true,
            Self::Security(e) => e.is_channel_fatal(),
            Self::Session(_)
            | Self::Transaction(_)
            | Self::Codec(_)
            | Self::Configuration(_)
            | Self::Timeout(_)
            | Self::ServiceFault { .. } => false,
        }
    }

    /// Returns the suggested retry delay for this error.
    ///
    /// Returns `None` if the error is not retryable.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }

        match self {
            Self::Connection(e) => Some(e.suggested_retry_delay()),
            Self::Timeout(e) => Some(e.suggested_retry_delay()),
            Self::Session(_) => Some(Duration::from_secs(1)),
            Self::ServiceFault { .. } => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Connection(e) => e.severity(),
            Self::Sequence(_) => ErrorSeverity::Error,
            Self::Security(e) => e.severity(),
            Self::Session(e) => e.severity(),
            Self::Transaction(e) => e.severity(),
            Self::Codec(_) => ErrorSeverity::Error,
            Self::Configuration(_) => ErrorSeverity::Critical,
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::ServiceFault { .. } => ErrorSeverity::Warning,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Sequence(_) => "sequence",
            Self::Security(_) => "security",
            Self::Session(_) => "session",
            Self::Transaction(_) => "transaction",
            Self::Codec(_) => "codec",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
            Self::ServiceFault { .. } => "service_fault",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Sequence(e) => e.error_code(),
            Self::Security(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Transaction(e) => e.error_code(),
            Self::Codec(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
            Self::ServiceFault { .. } => ErrorCode::new(9, 1),
        }
    }

    /// Returns the server status code, if this error carries one.
    pub fn status_code(&self) -> Option<u32> {
        match self {
            Self::ServiceFault { status_code, .. } => Some(*status_code),
            Self::Connection(ConnectionError::ServerError { status_code, .. }) => {
                Some(*status_code)
            }
            _ => None,
        }
    }

    /// Returns recovery hints for this error.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Connection(e) => e.recovery_hints(),
            Self::Sequence(_) => vec![
                "A chunk was lost or replayed; the channel has been closed",
                "Reconnect to establish a fresh secure channel",
            ],
            Self::Security(e) => e.recovery_hints(),
            Self::Session(e) => e.recovery_hints(),
            Self::Transaction(_) => vec![
                "A request was allocated an id but never submitted",
                "Check that every allocated transaction id is submitted or skipped",
            ],
            Self::Codec(e) => e.recovery_hints(),
            Self::Configuration(e) => e.recovery_hints(),
            Self::Timeout(e) => e.recovery_hints(),
            Self::ServiceFault { .. } => vec![
                "Inspect the status code returned by the server",
                "Check the server log for the rejected request",
            ],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::Connection(e) => e.user_message(),
            Self::Sequence(_) => "메시지 순서가 어긋나 보안 채널을 닫았습니다".to_string(),
            Self::Security(e) => e.user_message(),
            Self::Session(e) => e.user_message(),
            Self::Transaction(_) => "요청 순서 보장에 실패했습니다".to_string(),
            Self::Codec(_) => "메시지를 해석할 수 없습니다".to_string(),
            Self::Configuration(e) => e.user_message(),
            Self::Timeout(e) => e.user_message(),
            Self::ServiceFault { status_name, .. } => {
                format!("서버가 요청을 거부했습니다: {}", status_name)
            }
        }
    }

    /// Returns the tracing level for this error.
    pub fn tracing_level(&self) -> Level {
        self.severity().to_tracing_level()
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let level = self.tracing_level();
        let code = self.error_code();

        match level {
            Level::ERROR => tracing::error!(
                error_code = %code,
                category = self.category(),
                context = context,
                channel_fatal = self.is_channel_fatal(),
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                category = self.category(),
                context = context,
                channel_fatal = self.is_channel_fatal(),
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                category = self.category(),
                context = context,
                channel_fatal = self.is_channel_fatal(),
                "{self}"
            ),
        }
    }
}

impl From<io::Error> for UaError {
    fn from(error: io::Error) -> Self {
        Self::Connection(ConnectionError::from(error))
    }
}

/// Status codes a server uses for conditions that clear on their own.
fn is_transient_status(status_code: u32) -> bool {
    matches!(
        status_code & 0xFFFF_0000,
        0x8004_0000 // BadResourceUnavailable
            | 0x800A_0000 // BadTimeout
            | 0x800C_0000 // BadShutdown
            | 0x800E_0000 // BadServerHalted
            | 0x8010_0000 // BadTooManyOperations
            | 0x8056_0000 // BadTooManySessions
            | 0x807D_0000 // BadTcpServerTooBusy
    )
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection refused.
    #[error("Connection refused to '{endpoint}'")]
    Refused {
        /// Target endpoint.
        endpoint: String,
        /// Underlying error.
        #[source]
        source: Option<io::Error>,
    },

    /// Connection timed out.
    #[error("Connection timed out to '{endpoint}' after {duration:?}")]
    TimedOut {
        /// Target endpoint.
        endpoint: String,
        /// Timeout duration.
        duration: Duration,
    },

    /// Invalid endpoint URL.
    #[error("Invalid endpoint URL: '{url}' - {reason}")]
    InvalidEndpoint {
        /// The invalid URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// The server sent an `ERR` message.
    #[error("Server error 0x{status_code:08X}: {reason}")]
    ServerError {
        /// Status code carried by the error message.
        status_code: u32,
        /// Reason text carried by the error message.
        reason: String,
    },

    /// A message of an unexpected type arrived.
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: String,
        /// Received message type.
        actual: String,
    },

    /// Connection closed.
    #[error("Connection closed{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed {
        /// Reason for closure.
        reason: Option<String>,
    },

    /// Not connected.
    #[error("Not connected to OPC UA server")]
    NotConnected,

    /// Generic I/O error.
    #[error("I/O error: {message}")]
    Io {
        /// Error message.
        message: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ConnectionError {
    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
            source: None,
        }
    }

    /// Creates a connection refused error with source.
    pub fn refused_with(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
            source: Some(source),
        }
    }

    /// Creates a connection timed out error.
    pub fn timed_out(endpoint: impl Into<String>, duration: Duration) -> Self {
        Self::TimedOut {
            endpoint: endpoint.into(),
            duration,
        }
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a server error from an `ERR` message.
    pub fn server_error(status_code: u32, reason: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            reason: reason.into(),
        }
    }

    /// Creates an unexpected message error.
    pub fn unexpected_message(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedMessage {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a connection closed error.
    pub fn closed(reason: Option<String>) -> Self {
        Self::Closed { reason }
    }

    /// Creates an I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refused { .. } => true,
            Self::TimedOut { .. } => true,
            Self::Closed { .. } => true,
            Self::NotConnected => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),
            Self::InvalidEndpoint { .. }
            | Self::ServerError { .. }
            | Self::UnexpectedMessage { .. } => false,
        }
    }

    /// Returns `true` if the channel cannot be used after this error.
    pub fn is_channel_fatal(&self) -> bool {
        !matches!(self, Self::InvalidEndpoint { .. })
    }

    /// Returns the suggested retry delay.
    pub fn suggested_retry_delay(&self) -> Duration {
        match self {
            Self::Refused { .. } => Duration::from_secs(2),
            Self::TimedOut { duration, .. } => *duration,
            Self::Closed { .. } => Duration::from_millis(500),
            Self::NotConnected => Duration::from_millis(100),
            Self::Io { .. } => Duration::from_secs(1),
            _ => Duration::from_secs(5),
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotConnected => ErrorSeverity::Warning,
            Self::TimedOut { .. } => ErrorSeverity::Warning,
            Self::Closed { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Refused { .. } => ErrorCode::new(1, 1),
            Self::TimedOut { .. } => ErrorCode::new(1, 2),
            Self::InvalidEndpoint { .. } => ErrorCode::new(1, 3),
            Self::ServerError { .. } => ErrorCode::new(1, 4),
            Self::UnexpectedMessage { .. } => ErrorCode::new(1, 5),
            Self::Closed { .. } => ErrorCode::new(1, 6),
            Self::NotConnected => ErrorCode::new(1, 7),
            Self::Io { .. } => ErrorCode::new(1, 8),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Refused { .. } => vec![
                "Check if the OPC UA server is running",
                "Verify the endpoint URL is correct",
                "Check firewall rules allow the connection",
            ],
            Self::TimedOut { .. } => vec![
                "Check network connectivity to the server",
                "Increase the negotiation timeout setting",
            ],
            Self::InvalidEndpoint { .. } => vec![
                "Use format: opc.tcp://hostname:port/path",
                "Verify the hostname and port are correct",
            ],
            Self::ServerError { .. } => vec![
                "The server rejected the connection",
                "Check the status code and the server log",
                "Verify the proposed buffer sizes are acceptable to the server",
            ],
            Self::UnexpectedMessage { .. } => vec![
                "The peer does not speak OPC UA binary over TCP",
                "Verify the endpoint points at an OPC UA server",
            ],
            Self::Closed { .. } => vec![
                "The connection was closed",
                "Check server logs for disconnect reason",
                "Reconnect to establish a new secure channel",
            ],
            Self::NotConnected => vec!["Call connect() before submitting requests"],
            Self::Io { .. } => vec!["Check network connectivity", "Retry the operation"],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::Refused { endpoint, .. } => {
                format!("OPC UA 서버({})에 연결할 수 없습니다", endpoint)
            }
            Self::TimedOut { endpoint, .. } => {
                format!("OPC UA 서버({}) 연결 시간 초과", endpoint)
            }
            Self::InvalidEndpoint { url, .. } => {
                format!("잘못된 엔드포인트 URL: {}", url)
            }
            Self::ServerError { status_code, .. } => {
                format!("서버가 연결을 거부했습니다 (0x{:08X})", status_code)
            }
            Self::UnexpectedMessage { .. } => "예상하지 못한 메시지를 받았습니다".to_string(),
            Self::Closed { .. } => "연결이 끊어졌습니다".to_string(),
            Self::NotConnected => "OPC UA 서버에 연결되어 있지 않습니다".to_string(),
            Self::Io { .. } => "네트워크 오류가 발생했습니다".to_string(),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused {
                endpoint: "unknown".to_string(),
                source: Some(error),
            },
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Self::Closed {
                reason: Some(error.to_string()),
            },
            _ => Self::Io {
                message: error.to_string(),
                source: error,
            },
        }
    }
}

// =============================================================================
// SequenceError
// =============================================================================

/// Received sequence numbers that break the `previous + 1` rule.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// A sequence number was skipped or repeated.
    #[error("Lost sequence, expected {expected} but received {received}")]
    Violation {
        /// The expected sequence number.
        expected: u32,
        /// The received sequence number.
        received: u32,
    },
}

impl SequenceError {
    /// Creates a sequence violation error.
    pub fn violation(expected: u32, received: u32) -> Self {
        Self::Violation { expected, received }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Violation { .. } => ErrorCode::new(2, 1),
        }
    }
}

// =============================================================================
// SecurityError
// =============================================================================

/// Security and cryptography errors.
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    /// A padding byte does not match the padding size.
    #[error("Malformed padding at offset {offset}: expected 0x{expected:02X}, found 0x{found:02X}")]
    MalformedPadding {
        /// Offset of the offending byte within the decrypted region.
        offset: usize,
        /// Expected fill value.
        expected: u8,
        /// Actual byte.
        found: u8,
    },

    /// A signature did not verify.
    #[error("Signature verification failed: {context}")]
    SignatureVerificationFailed {
        /// What was being verified.
        context: String,
    },

    /// Decryption failed.
    #[error("Decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason.
        reason: String,
    },

    /// Encryption failed.
    #[error("Encryption failed: {reason}")]
    EncryptionFailed {
        /// Reason.
        reason: String,
    },

    /// Signing failed.
    #[error("Signing failed: {reason}")]
    SigningFailed {
        /// Reason.
        reason: String,
    },

    /// A certificate could not be parsed or used.
    #[error("Invalid certificate: {reason}")]
    InvalidCertificate {
        /// Reason.
        reason: String,
    },

    /// A private key could not be parsed or used.
    #[error("Invalid private key: {reason}")]
    InvalidPrivateKey {
        /// Reason.
        reason: String,
    },

    /// A certificate or key required by the security policy is missing.
    #[error("Missing {what} required by security policy {policy}")]
    MissingCredential {
        /// What is missing.
        what: &'static str,
        /// Active policy.
        policy: String,
    },

    /// A symmetric chunk referenced a token the client does not hold.
    #[error("Unknown security token {token_id}")]
    UnknownToken {
        /// The unknown token id.
        token_id: u32,
    },

    /// The peer used a different security policy.
    #[error("Security policy mismatch: expected '{expected}', got '{actual}'")]
    PolicyMismatch {
        /// Expected policy URI.
        expected: String,
        /// Received policy URI.
        actual: String,
    },

    /// Unsupported security policy URI.
    #[error("Unsupported security policy: '{uri}'")]
    UnsupportedPolicy {
        /// Policy URI.
        uri: String,
    },
}

impl SecurityError {
    /// Creates a malformed padding error.
    pub fn malformed_padding(offset: usize, expected: u8, found: u8) -> Self {
        Self::MalformedPadding {
            offset,
            expected,
            found,
        }
    }

    /// Creates a signature verification error.
    pub fn signature_failed(context: impl Into<String>) -> Self {
        Self::SignatureVerificationFailed {
            context: context.into(),
        }
    }

    /// Creates a decryption error.
    pub fn decryption_failed(reason: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            reason: reason.into(),
        }
    }

    /// Creates an encryption error.
    pub fn encryption_failed(reason: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            reason: reason.into(),
        }
    }

    /// Creates a signing error.
    pub fn signing_failed(reason: impl Into<String>) -> Self {
        Self::SigningFailed {
            reason: reason.into(),
        }
    }

    /// Creates an invalid certificate error.
    pub fn invalid_certificate(reason: impl Into<String>) -> Self {
        Self::InvalidCertificate {
            reason: reason.into(),
        }
    }

    /// Creates an invalid private key error.
    pub fn invalid_private_key(reason: impl Into<String>) -> Self {
        Self::InvalidPrivateKey {
            reason: reason.into(),
        }
    }

    /// Creates a missing credential error.
    pub fn missing_credential(what: &'static str, policy: impl Into<String>) -> Self {
        Self::MissingCredential {
            what,
            policy: policy.into(),
        }
    }

    /// Creates a policy mismatch error.
    pub fn policy_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::PolicyMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns `true` if the channel must be torn down after this error.
    ///
    /// Failures while processing received chunks indicate a bug or tampering.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedPadding { .. }
                | Self::SignatureVerificationFailed { .. }
                | Self::DecryptionFailed { .. }
                | Self::UnknownToken { .. }
                | Self::PolicyMismatch { .. }
        )
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::MalformedPadding { .. }
            | Self::SignatureVerificationFailed { .. }
            | Self::DecryptionFailed { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MalformedPadding { .. } => ErrorCode::new(3, 1),
            Self::SignatureVerificationFailed { .. } => ErrorCode::new(3, 2),
            Self::DecryptionFailed { .. } => ErrorCode::new(3, 3),
            Self::EncryptionFailed { .. } => ErrorCode::new(3, 4),
            Self::SigningFailed { .. } => ErrorCode::new(3, 5),
            Self::InvalidCertificate { .. } => ErrorCode::new(3, 6),
            Self::InvalidPrivateKey { .. } => ErrorCode::new(3, 7),
            Self::MissingCredential { .. } => ErrorCode::new(3, 8),
            Self::UnknownToken { .. } => ErrorCode::new(3, 9),
            Self::PolicyMismatch { .. } => ErrorCode::new(3, 10),
            Self::UnsupportedPolicy { .. } => ErrorCode::new(3, 11),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::MalformedPadding { .. }
            | Self::SignatureVerificationFailed { .. }
            | Self::DecryptionFailed { .. } => vec![
                "The message was corrupted or tampered with",
                "Verify both sides use the same security policy and certificates",
                "Reconnect to negotiate fresh keys",
            ],
            Self::EncryptionFailed { .. } | Self::SigningFailed { .. } => vec![
                "Check that the key size matches the security policy",
            ],
            Self::InvalidCertificate { .. } => vec![
                "Verify the certificate is DER or PEM encoded X.509",
                "Check that the certificate carries an RSA public key",
            ],
            Self::InvalidPrivateKey { .. } => vec![
                "Verify the key is PKCS#1 or PKCS#8 encoded RSA",
            ],
            Self::MissingCredential { .. } => vec![
                "Configure a client certificate and private key",
                "Run discovery first to obtain the server certificate",
            ],
            Self::UnknownToken { .. } => vec!["Renew the secure channel"],
            Self::PolicyMismatch { .. } | Self::UnsupportedPolicy { .. } => vec![
                "Select a security policy the server supports",
            ],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::MalformedPadding { .. }
            | Self::SignatureVerificationFailed { .. }
            | Self::DecryptionFailed { .. } => "메시지 무결성 검증에 실패했습니다".to_string(),
            Self::EncryptionFailed { .. } | Self::SigningFailed { .. } => {
                "메시지 보호 처리에 실패했습니다".to_string()
            }
            Self::InvalidCertificate { .. } => "인증서가 올바르지 않습니다".to_string(),
            Self::InvalidPrivateKey { .. } => "개인 키가 올바르지 않습니다".to_string(),
            Self::MissingCredential { what, .. } => format!("{}이(가) 필요합니다", what),
            Self::UnknownToken { token_id } => format!("알 수 없는 보안 토큰: {}", token_id),
            Self::PolicyMismatch { .. } => "보안 정책이 일치하지 않습니다".to_string(),
            Self::UnsupportedPolicy { uri } => format!("지원하지 않는 보안 정책: {}", uri),
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session creation failed.
    #[error("Failed to create session: {message}")]
    CreationFailed {
        /// Error message.
        message: String,
    },

    /// Session activation failed.
    #[error("Failed to activate session: {message}")]
    ActivationFailed {
        /// Error message.
        message: String,
    },

    /// No endpoint offered by the server matches the client configuration.
    #[error("No endpoint matching '{endpoint}' with policy '{policy}' and mode '{mode}'")]
    NoCompatibleEndpoint {
        /// Configured endpoint URL.
        endpoint: String,
        /// Configured policy.
        policy: String,
        /// Configured mode.
        mode: String,
    },

    /// The response did not echo the request handle.
    #[error("Request handle mismatch: sent {expected}, received {received}")]
    RequestHandleMismatch {
        /// Handle sent in the request.
        expected: u32,
        /// Handle received in the response.
        received: u32,
    },

    /// Operation not allowed in the current state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Current state.
        state: String,
    },
}

impl SessionError {
    /// Creates a session creation failed error.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: message.into(),
        }
    }

    /// Creates a session activation failed error.
    pub fn activation_failed(message: impl Into<String>) -> Self {
        Self::ActivationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::InvalidState { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CreationFailed { .. } => ErrorCode::new(4, 1),
            Self::ActivationFailed { .. } => ErrorCode::new(4, 2),
            Self::NoCompatibleEndpoint { .. } => ErrorCode::new(4, 3),
            Self::RequestHandleMismatch { .. } => ErrorCode::new(4, 4),
            Self::InvalidState { .. } => ErrorCode::new(4, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::CreationFailed { .. } | Self::ActivationFailed { .. } => vec![
                "Check the server's session limits",
                "Verify the identity token is accepted by the server",
            ],
            Self::NoCompatibleEndpoint { .. } => vec![
                "Run discovery to list the server endpoints",
                "Match the configured policy and mode to an offered endpoint",
                "Check that the server accepts the configured identity type",
            ],
            Self::RequestHandleMismatch { .. } => vec![
                "The server answered a different request",
                "Set the request handle policy to Warn to tolerate this server",
            ],
            Self::InvalidState { .. } => vec!["Wait for the current operation to finish"],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::CreationFailed { .. } => "세션 생성에 실패했습니다".to_string(),
            Self::ActivationFailed { .. } => "세션 활성화에 실패했습니다".to_string(),
            Self::NoCompatibleEndpoint { endpoint, .. } => {
                format!("호환되는 엔드포인트가 없습니다: {}", endpoint)
            }
            Self::RequestHandleMismatch { .. } => "응답 핸들이 요청과 다릅니다".to_string(),
            Self::InvalidState { state, .. } => format!("현재 세션 상태({})에서 불가능합니다", state),
        }
    }
}

// =============================================================================
// TransactionError
// =============================================================================

/// Transaction ordering errors.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Entries are queued but the id they wait on was never allocated.
    #[error("Transaction id {expected} not found, {queued} transaction(s) blocked")]
    OutOfOrderTransactionMissing {
        /// The id the sequencer waits for.
        expected: u32,
        /// Number of queued transactions.
        queued: usize,
    },

    /// The same transaction id was submitted twice.
    #[error("Transaction id {transaction_id} submitted twice")]
    Duplicate {
        /// The duplicated id.
        transaction_id: u32,
    },
}

impl TransactionError {
    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::OutOfOrderTransactionMissing { .. } => ErrorSeverity::Critical,
            Self::Duplicate { .. } => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::OutOfOrderTransactionMissing { .. } => ErrorCode::new(5, 1),
            Self::Duplicate { .. } => ErrorCode::new(5, 2),
        }
    }
}

// =============================================================================
// CodecError
// =============================================================================

/// Message encoding and decoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not enough bytes remain.
    #[error("Unexpected end of message reading {field}: need {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Field being decoded.
        field: &'static str,
        /// Bytes needed.
        needed: usize,
        /// Bytes remaining.
        remaining: usize,
    },

    /// A field held an invalid value.
    #[error("Invalid {field}: {reason}")]
    InvalidValue {
        /// Field being decoded.
        field: &'static str,
        /// Reason.
        reason: String,
    },

    /// The message body has an unexpected type id.
    #[error("Unexpected response type: expected {expected}, got {actual}")]
    UnexpectedType {
        /// Expected binary encoding id.
        expected: u32,
        /// Received binary encoding id.
        actual: u32,
    },

    /// A message exceeds a negotiated limit.
    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Message size.
        size: usize,
        /// Negotiated limit.
        limit: usize,
    },

    /// A message needs more chunks than negotiated.
    #[error("Message needs {count} chunks, limit is {limit}")]
    TooManyChunks {
        /// Chunk count.
        count: usize,
        /// Negotiated limit.
        limit: usize,
    },
}

impl CodecError {
    /// Creates an end-of-message error.
    pub fn eof(field: &'static str, needed: usize, remaining: usize) -> Self {
        Self::UnexpectedEof {
            field,
            needed,
            remaining,
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnexpectedEof { .. } => ErrorCode::new(6, 1),
            Self::InvalidValue { .. } => ErrorCode::new(6, 2),
            Self::UnexpectedType { .. } => ErrorCode::new(6, 3),
            Self::MessageTooLarge { .. } => ErrorCode::new(6, 4),
            Self::TooManyChunks { .. } => ErrorCode::new(6, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::MessageTooLarge { .. } | Self::TooManyChunks { .. } => vec![
                "Split the request into smaller calls",
                "Raise max_message_size and max_chunk_count on both sides",
            ],
            _ => vec!["The peer sent a message this client cannot decode"],
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A required field is missing.
    #[error("Missing required field: {field}")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// Invalid endpoint.
    #[error("Invalid endpoint '{url}': {reason}")]
    InvalidEndpoint {
        /// Endpoint URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// Invalid security configuration.
    #[error("Invalid security configuration: {reason}")]
    InvalidSecurity {
        /// Reason.
        reason: String,
    },

    /// Invalid timeout.
    #[error("Invalid timeout {duration:?}: {reason}")]
    InvalidTimeout {
        /// The timeout.
        duration: Duration,
        /// Reason.
        reason: String,
    },

    /// Invalid protocol limit.
    #[error("Invalid {field} = {value}: {reason}")]
    InvalidLimit {
        /// Limit name.
        field: &'static str,
        /// Configured value.
        value: u64,
        /// Reason.
        reason: String,
    },
}

impl ConfigurationError {
    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid security error.
    pub fn invalid_security(reason: impl Into<String>) -> Self {
        Self::InvalidSecurity {
            reason: reason.into(),
        }
    }

    /// Creates an invalid timeout error.
    pub fn invalid_timeout(duration: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            duration,
            reason: reason.into(),
        }
    }

    /// Creates an invalid limit error.
    pub fn invalid_limit(field: &'static str, value: u64, reason: impl Into<String>) -> Self {
        Self::InvalidLimit {
            field,
            value,
            reason: reason.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingField { .. } => ErrorCode::new(7, 1),
            Self::InvalidEndpoint { .. } => ErrorCode::new(7, 2),
            Self::InvalidSecurity { .. } => ErrorCode::new(7, 3),
            Self::InvalidTimeout { .. } => ErrorCode::new(7, 4),
            Self::InvalidLimit { .. } => ErrorCode::new(7, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::MissingField { .. } => vec!["Add the missing field to the configuration"],
            Self::InvalidEndpoint { .. } => vec!["Use format: opc.tcp://hostname:port/path"],
            Self::InvalidSecurity { .. } => vec![
                "Security mode None requires policy None and vice versa",
                "Sign and SignAndEncrypt need a client certificate and private key",
            ],
            Self::InvalidTimeout { .. } => vec!["Use a timeout greater than zero"],
            Self::InvalidLimit { .. } => vec![
                "Buffer sizes must be at least 8192 bytes",
            ],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingField { field } => format!("필수 설정 누락: {}", field),
            Self::InvalidEndpoint { url, .. } => format!("잘못된 엔드포인트 설정: {}", url),
            Self::InvalidSecurity { reason } => format!("보안 설정 오류: {}", reason),
            Self::InvalidTimeout { .. } => "타임아웃 설정이 올바르지 않습니다".to_string(),
            Self::InvalidLimit { field, .. } => format!("잘못된 한계값 설정: {}", field),
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Timeout errors.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// Hello or OpenSecureChannel did not complete.
    #[error("{step} timed out after {duration:?}")]
    Negotiation {
        /// Handshake step.
        step: &'static str,
        /// Timeout duration.
        duration: Duration,
    },

    /// A service request did not complete.
    #[error("Request {request_id} timed out after {duration:?}")]
    Request {
        /// Request id of the pending request.
        request_id: u32,
        /// Timeout duration.
        duration: Duration,
    },

    /// The close exchange did not complete.
    #[error("Close timed out after {duration:?}")]
    Close {
        /// Timeout duration.
        duration: Duration,
    },
}

impl TimeoutError {
    /// Creates a negotiation timeout.
    pub fn negotiation(step: &'static str, duration: Duration) -> Self {
        Self::Negotiation { step, duration }
    }

    /// Creates a request timeout.
    pub fn request(request_id: u32, duration: Duration) -> Self {
        Self::Request {
            request_id,
            duration,
        }
    }

    /// Creates a close timeout.
    pub fn close(duration: Duration) -> Self {
        Self::Close { duration }
    }

    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Negotiation { duration, .. }
            | Self::Request { duration, .. }
            | Self::Close { duration } => *duration,
        }
    }

    /// Returns the suggested retry delay.
    pub fn suggested_retry_delay(&self) -> Duration {
        Duration::from_millis(500)
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Negotiation { .. } => ErrorCode::new(8, 1),
            Self::Request { .. } => ErrorCode::new(8, 2),
            Self::Close { .. } => ErrorCode::new(8, 3),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Negotiation { .. } => vec![
                "Check that the server is reachable",
                "Increase the negotiation timeout",
            ],
            Self::Request { .. } => vec![
                "Submit the request again",
                "Increase the request timeout",
            ],
            Self::Close { .. } => vec!["The channel was closed locally regardless"],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::Negotiation { step, .. } => format!("{} 응답 시간 초과", step),
            Self::Request { .. } => "요청 응답 시간 초과".to_string(),
            Self::Close { .. } => "연결 종료 응답 시간 초과".to_string(),
        }
    }
}

// =============================================================================
// Status Codes
// =============================================================================

/// Returns the symbolic name of an OPC UA status code.
///
/// Only the severity and sub-code bits are compared; info bits are ignored.
pub fn status_code_name(code: u32) -> Option<&'static str> {
    let name = match code & 0xFFFF_0000 {
        0x0000_0000 => "Good",
        0x8000_0000 => "Bad",
        0x8001_0000 => "BadUnexpectedError",
        0x8002_0000 => "BadInternalError",
        0x8003_0000 => "BadOutOfMemory",
        0x8004_0000 => "BadResourceUnavailable",
        0x8005_0000 => "BadCommunicationError",
        0x8006_0000 => "BadEncodingError",
        0x8007_0000 => "BadDecodingError",
        0x8008_0000 => "BadEncodingLimitsExceeded",
        0x8009_0000 => "BadUnknownResponse",
        0x800A_0000 => "BadTimeout",
        0x800B_0000 => "BadServiceUnsupported",
        0x800C_0000 => "BadShutdown",
        0x800D_0000 => "BadServerNotConnected",
        0x800E_0000 => "BadServerHalted",
        0x800F_0000 => "BadNothingToDo",
        0x8010_0000 => "BadTooManyOperations",
        0x8011_0000 => "BadDataTypeIdUnknown",
        0x8012_0000 => "BadCertificateInvalid",
        0x8013_0000 => "BadSecurityChecksFailed",
        0x8014_0000 => "BadCertificateTimeInvalid",
        0x8015_0000 => "BadCertificateIssuerTimeInvalid",
        0x8016_0000 => "BadCertificateHostNameInvalid",
        0x8017_0000 => "BadCertificateUriInvalid",
        0x8018_0000 => "BadCertificateUseNotAllowed",
        0x8019_0000 => "BadCertificateIssuerUseNotAllowed",
        0x801A_0000 => "BadCertificateUntrusted",
        0x801B_0000 => "BadCertificateRevocationUnknown",
        0x801C_0000 => "BadCertificateIssuerRevocationUnknown",
        0x801D_0000 => "BadCertificateRevoked",
        0x801E_0000 => "BadCertificateIssuerRevoked",
        0x801F_0000 => "BadUserAccessDenied",
        0x8020_0000 => "BadIdentityTokenInvalid",
        0x8021_0000 => "BadIdentityTokenRejected",
        0x8022_0000 => "BadSecureChannelIdInvalid",
        0x8023_0000 => "BadInvalidTimestamp",
        0x8024_0000 => "BadNonceInvalid",
        0x8025_0000 => "BadSessionIdInvalid",
        0x8026_0000 => "BadSessionClosed",
        0x8027_0000 => "BadSessionNotActivated",
        0x8028_0000 => "BadSubscriptionIdInvalid",
        0x802A_0000 => "BadRequestHeaderInvalid",
        0x802C_0000 => "BadRequestCancelledByClient",
        0x803D_0000 => "BadNotSupported",
        0x8040_0000 => "BadNotImplemented",
        0x8054_0000 => "BadSecurityModeRejected",
        0x8055_0000 => "BadSecurityPolicyRejected",
        0x8056_0000 => "BadTooManySessions",
        0x8057_0000 => "BadUserSignatureInvalid",
        0x8058_0000 => "BadApplicationSignatureInvalid",
        0x807D_0000 => "BadTcpServerTooBusy",
        0x807E_0000 => "BadTcpMessageTypeInvalid",
        0x807F_0000 => "BadTcpSecureChannelUnknown",
        0x8080_0000 => "BadTcpMessageTooLarge",
        0x8081_0000 => "BadTcpNotEnoughResources",
        0x8082_0000 => "BadTcpInternalError",
        0x8083_0000 => "BadTcpEndpointUrlInvalid",
        0x8084_0000 => "BadRequestInterrupted",
        0x8085_0000 => "BadRequestTimeout",
        0x8086_0000 => "BadSecureChannelClosed",
        0x8087_0000 => "BadSecureChannelTokenUnknown",
        0x8088_0000 => "BadSequenceNumberInvalid",
        0x80AB_0000 => "BadInvalidArgument",
        0x80AC_0000 => "BadConnectionRejected",
        0x80AD_0000 => "BadDisconnect",
        0x80AE_0000 => "BadConnectionClosed",
        0x80AF_0000 => "BadInvalidState",
        0x80B0_0000 => "BadEndOfStream",
        0x80B8_0000 => "BadRequestTooLarge",
        0x80B9_0000 => "BadResponseTooLarge",
        0x80BE_0000 => "BadProtocolVersionUnsupported",
        _ => return None,
    };
    Some(name)
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - action may be required.
    Warning,
    /// Error - action required, but recoverable.
    Error,
    /// Critical - immediate action required.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error => Level::ERROR,
            Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code for categorization.
///
/// Format: `UA-XXYY` where XX is category and YY is specific error.
///
/// Categories:
/// - 1: Connection
/// - 2: Sequence
/// - 3: Security
/// - 4: Session
/// - 5: Transaction
/// - 6: Codec
/// - 7: Configuration
/// - 8: Timeout
/// - 9: Service fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category (1-9).
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }

    /// Returns the full error code as a u16.
    pub fn as_u16(&self) -> u16 {
        ((self.category as u16) << 8) | (self.code as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A Result type with UaError.
pub type UaResult<T> = Result<T, UaError>;

// =============================================================================
// Error Context Extension
// =============================================================================

/// Extension trait for adding context to secure conversation errors.
pub trait UaErrorContext<T> {
    /// Logs the error with endpoint context.
    fn with_endpoint(self, endpoint: &str) -> UaResult<T>;

    /// Logs the error with request context.
    fn with_request(self, request_id: u32) -> UaResult<T>;
}

impl<T> UaErrorContext<T> for UaResult<T> {
    fn with_endpoint(self, endpoint: &str) -> UaResult<T> {
        self.map_err(|e| {
            tracing::debug!(endpoint = endpoint, error = %e, "OPC UA error with endpoint context");
            e
        })
    }

    fn with_request(self, request_id: u32) -> UaResult<T> {
        self.map_err(|e| {
            tracing::debug!(request_id = request_id, error = %e, "OPC UA error with request context");
            e
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_fault_display() {
        let error = UaError::service_fault(0x8024_0000);
        assert_eq!(
            error.to_string(),
            "Server returned error BadNonceInvalid (0x80240000)"
        );
        assert_eq!(error.status_code(), Some(0x8024_0000));
        assert!(!error.is_channel_fatal());
    }

    #[test]
    fn test_service_fault_unknown_code() {
        let error = UaError::service_fault(0x80FF_0000);
        assert!(error.to_string().contains("Unknown"));
    }

    #[test]
    fn test_status_code_ignores_info_bits() {
        assert_eq!(status_code_name(0x800A_0400), Some("BadTimeout"));
        assert_eq!(status_code_name(0x0000_0000), Some("Good"));
        assert_eq!(status_code_name(0x80FE_0000), None);
    }

    #[test]
    fn test_channel_fatal_classification() {
        assert!(UaError::sequence_violation(5, 7).is_channel_fatal());
        assert!(UaError::security(SecurityError::malformed_padding(0, 1, 2)).is_channel_fatal());
        assert!(UaError::security(SecurityError::signature_failed("chunk")).is_channel_fatal());
        assert!(UaError::security(SecurityError::decryption_failed("bad block")).is_channel_fatal());
        assert!(!UaError::request_timeout(3, Duration::from_secs(1)).is_channel_fatal());
        assert!(!UaError::transaction(TransactionError::OutOfOrderTransactionMissing {
            expected: 4,
            queued: 1
        })
        .is_channel_fatal());
    }

    #[test]
    fn test_retryable() {
        assert!(UaError::request_timeout(3, Duration::from_secs(1)).is_retryable());
        assert!(UaError::service_fault(0x800A_0000).is_retryable());
        assert!(!UaError::service_fault(0x8024_0000).is_retryable());
        assert!(!UaError::sequence_violation(1, 3).is_retryable());
        assert!(UaError::not_connected().suggested_retry_delay().is_some());
    }

    #[test]
    fn test_sequence_violation_message() {
        let error = UaError::sequence_violation(11, 13);
        assert_eq!(error.to_string(), "Lost sequence, expected 11 but received 13");
        assert_eq!(error.category(), "sequence");
    }

    #[test]
    fn test_error_code() {
        let code = ErrorCode::new(3, 1);
        assert_eq!(code.to_string(), "UA-0301");
        assert_eq!(code.as_u16(), 0x0301);
        assert_eq!(
            UaError::security(SecurityError::malformed_padding(0, 1, 2)).error_code(),
            code
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let error: UaError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(
            error,
            UaError::Connection(ConnectionError::Closed { .. })
        ));
        assert!(error.is_channel_fatal());
    }

    #[test]
    fn test_severity() {
        assert_eq!(
            UaError::security(SecurityError::malformed_padding(0, 1, 2)).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(UaError::not_connected().severity(), ErrorSeverity::Warning);
        assert_eq!(ErrorSeverity::Warning.to_tracing_level(), Level::WARN);
    }

    #[test]
    fn test_recovery_hints() {
        let error = UaError::connection(ConnectionError::refused("opc.tcp://localhost:4840"));
        assert!(error.recovery_hints().iter().any(|h| h.contains("running")));
    }

    #[test]
    fn test_user_messages() {
        let error = UaError::connection(ConnectionError::refused("opc.tcp://192.168.1.100:4840"));
        assert!(error.user_message().contains("192.168.1.100"));
    }

    #[test]
    fn test_closed_display() {
        assert_eq!(ConnectionError::closed(None).to_string(), "Connection closed");
        assert_eq!(
            ConnectionError::closed(Some("peer reset".into())).to_string(),
            "Connection closed: peer reset"
        );
    }
}
