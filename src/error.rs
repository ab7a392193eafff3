//! Error types for drmsession.

use std::sync::Arc;

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for DRM session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The device must be provisioned before the crypto engine can serve this call.
    #[error("Device is not provisioned")]
    NotProvisioned,

    /// The restored offline license has no license or playback time left.
    #[error("Offline license keys have expired")]
    KeysExpired,

    /// The crypto engine rejected an operation.
    #[error("Crypto engine error: {0}")]
    Engine(String),

    /// A provisioning or key request failed in the transport.
    #[error("Request failed: {0}")]
    Transport(#[from] TransportError),

    /// No session is open with the specified identifier.
    #[error("Session identifier {0:?} is invalid")]
    InvalidSession(Vec<u8>),

    /// The scheme init data is invalid or empty.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// Session construction parameters violate an invariant.
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The engine or transport does not implement the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Failed to decode data.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error can be recovered from by provisioning the device.
    pub fn is_not_provisioned(&self) -> bool {
        matches!(self, Error::NotProvisioned)
    }
}

/// Error shared between a session's `last_error` and every listener it is reported to.
pub type SharedError = Arc<Error>;

/// Result type alias for drmsession operations.
pub type Result<T> = std::result::Result<T, Error>;
