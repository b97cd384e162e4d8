//! Error types for key records and the backend boundary.

use thiserror::Error;

/// Errors working with locally held key records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// No installed key with this id.
    #[error("unknown digital key: {0}")]
    UnknownKey(String),

    /// Key material has the wrong shape.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// A record could not be parsed.
    #[error("invalid key record: {0}")]
    InvalidRecord(String),

    /// An enumerated field had a value outside its known set.
    #[error("unknown {field} value: {value}")]
    UnknownValue {
        /// Field name.
        field: &'static str,
        /// Raw value received.
        value: u8,
    },
}

/// Errors returned by a [`KeyLifecycleService`](crate::KeyLifecycleService).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Request never reached the backend or the response was lost.
    #[error("network error: {0}")]
    Network(String),

    /// Backend refused the request.
    #[error("backend rejected request ({code}): {message}")]
    Rejected {
        /// Backend result code.
        code: i32,
        /// Backend message.
        message: String,
    },

    /// Credentials missing or expired.
    #[error("not authorized")]
    Unauthorized,

    /// Referenced vehicle, key or device does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Response body did not match the expected record shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<KeyError> for ServiceError {
    fn from(err: KeyError) -> Self {
        ServiceError::InvalidResponse(err.to_string())
    }
}

/// Result type for backend calls.
pub type ServiceResult<T> = Result<T, ServiceError>;
