//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed: wrong or missing sync key, or corrupted ciphertext.
    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Handshake errors
    /// Short code is empty, longer than 4 characters or not alphanumeric.
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),

    /// Unique id is neither a dotted 3-part id nor an integer up to 999999.
    #[error("invalid unique id: {0}")]
    InvalidUniqueId(String),

    /// Handshake header is truncated or otherwise malformed.
    #[error("invalid handshake header: {0}")]
    InvalidHeader(String),

    // Framing errors
    /// Body starts with an unknown leader byte.
    #[error("invalid leader byte: {0:#04x}")]
    InvalidLeader(u8),

    /// Deflate or inflate failed.
    #[error("compression failed: {0}")]
    Compression(String),

    // Connection errors
    /// No open transport for the call.
    #[error("not connected")]
    NotConnected,

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Transport level failure.
    #[error("transport error: {0}")]
    Transport(String),

    // Dispatch errors
    /// No request handler registered under this name.
    #[error("unknown api: {0}")]
    UnknownApi(String),

    /// No event handler registered under this name.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// Connection permission is below the handler's minimum.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Application handler failed.
    #[error("{name}: {message}")]
    HandlerFault {
        /// Error name reported by the handler.
        name: String,
        /// Error message reported by the handler.
        message: String,
    },

    // Configuration errors
    /// A handler name was registered twice.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A handler name is not exported by the provider it was registered on.
    #[error("{name} does not exist in {provider}")]
    MissingHandler {
        /// Registered name.
        name: String,
        /// Provider the name was registered against.
        provider: String,
    },
}

impl ProtocolError {
    /// Stable code carried in the `error` field of correlated responses.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Serialization(_) => "Serialization",
            ProtocolError::Deserialization(_) => "Deserialization",
            ProtocolError::Encryption(_) => "Encryption",
            ProtocolError::DecryptFailed(_) => "DecryptFailed",
            ProtocolError::InvalidPublicKey(_) => "InvalidPublicKey",
            ProtocolError::InvalidShortCode(_) => "InvalidShortCode",
            ProtocolError::InvalidUniqueId(_) => "InvalidUniqueId",
            ProtocolError::InvalidHeader(_) => "InvalidHeader",
            ProtocolError::InvalidLeader(_) => "InvalidLeader",
            ProtocolError::Compression(_) => "Compression",
            ProtocolError::NotConnected => "NotConnected",
            ProtocolError::ConnectionClosed(_) => "ConnectionClosed",
            ProtocolError::Timeout(_) => "Timeout",
            ProtocolError::Transport(_) => "Transport",
            ProtocolError::UnknownApi(_) => "UnknownApi",
            ProtocolError::UnknownEvent(_) => "UnknownEvent",
            ProtocolError::PermissionDenied(_) => "PermissionDenied",
            ProtocolError::HandlerFault { .. } => "HandlerFault",
            ProtocolError::DuplicateRegistration(_) => "DuplicateRegistration",
            ProtocolError::MissingHandler { .. } => "MissingHandler",
        }
    }

    /// Whether the error is fatal to the connection that produced it.
    ///
    /// Framing and crypto failures mean the byte stream can no longer be
    /// trusted; everything else is answered with a correlated error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::DecryptFailed(_)
                | ProtocolError::Deserialization(_)
                | ProtocolError::InvalidShortCode(_)
                | ProtocolError::InvalidUniqueId(_)
                | ProtocolError::InvalidHeader(_)
                | ProtocolError::InvalidLeader(_)
                | ProtocolError::Compression(_)
        )
    }

    /// Builds a `HandlerFault` from an error name and message.
    pub fn handler_fault(name: impl Into<String>, message: impl Into<String>) -> Self {
        ProtocolError::HandlerFault {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        match err {
            rsa::Error::Decryption => ProtocolError::DecryptFailed(err.to_string()),
            rsa::Error::MessageTooLong => ProtocolError::Encryption(err.to_string()),
            _ => ProtocolError::InvalidPublicKey(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}
