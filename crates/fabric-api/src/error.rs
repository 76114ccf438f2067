//! Fabric status codes and error types.
//!
//! The fabric speaks HTTP-style status codes. This module classifies them
//! into the error taxonomy the reconciler cares about: not-found and
//! conflict are "already converged" signals on the delete and create paths,
//! everything else is fatal for the current call.

use std::fmt;
use thiserror::Error;

/// Status codes returned by the fabric API.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FabricStatus {
    Ok = 200,
    Created = 201,
    NoContent = 204,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    Conflict = 409,
    PreconditionFailed = 412,
    TooManyRequests = 429,
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
}

impl FabricStatus {
    /// Creates a FabricStatus from a raw status code.
    ///
    /// Unknown codes map to the generic class of their hundred.
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => FabricStatus::Ok,
            201 => FabricStatus::Created,
            204 => FabricStatus::NoContent,
            400 => FabricStatus::BadRequest,
            401 => FabricStatus::Unauthorized,
            403 => FabricStatus::Forbidden,
            404 => FabricStatus::NotFound,
            409 => FabricStatus::Conflict,
            412 => FabricStatus::PreconditionFailed,
            429 => FabricStatus::TooManyRequests,
            500 => FabricStatus::InternalServerError,
            501 => FabricStatus::NotImplemented,
            502 => FabricStatus::BadGateway,
            503 => FabricStatus::ServiceUnavailable,
            504 => FabricStatus::GatewayTimeout,
            200..=299 => FabricStatus::Ok,
            400..=499 => FabricStatus::BadRequest,
            _ => FabricStatus::InternalServerError,
        }
    }

    /// Returns the numeric code.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Converts to a Result, returning Ok(()) for success.
    pub fn into_result(self, resource: impl Into<String>) -> FabricResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(FabricError::from_status(self, resource))
        }
    }
}

impl fmt::Display for FabricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FabricStatus::Ok => "OK",
            FabricStatus::Created => "Created",
            FabricStatus::NoContent => "No Content",
            FabricStatus::BadRequest => "Bad Request",
            FabricStatus::Unauthorized => "Unauthorized",
            FabricStatus::Forbidden => "Forbidden",
            FabricStatus::NotFound => "Not Found",
            FabricStatus::Conflict => "Conflict",
            FabricStatus::PreconditionFailed => "Precondition Failed",
            FabricStatus::TooManyRequests => "Too Many Requests",
            FabricStatus::InternalServerError => "Internal Server Error",
            FabricStatus::NotImplemented => "Not Implemented",
            FabricStatus::BadGateway => "Bad Gateway",
            FabricStatus::ServiceUnavailable => "Service Unavailable",
            FabricStatus::GatewayTimeout => "Gateway Timeout",
        };
        write!(f, "{} {}", self.code(), s)
    }
}

/// Error type for fabric operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FabricError {
    /// The fabric answered with an unsuccessful status.
    #[error("fabric request for {resource} failed: {status}")]
    Status {
        status: FabricStatus,
        resource: String,
    },

    /// The requested resource does not exist.
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    /// The resource already exists or was modified concurrently.
    #[error("resource conflict: {resource}")]
    Conflict { resource: String },

    /// The fabric does not offer the requested capability.
    #[error("feature not supported by fabric: {feature}")]
    NotSupported { feature: String },

    /// The request was rejected as malformed.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The request never produced a response.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The caller cancelled the in-flight request.
    #[error("request cancelled")]
    Cancelled,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FabricError {
    /// Creates an error from a fabric status code.
    pub fn from_status(status: FabricStatus, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        match status {
            FabricStatus::NotFound => FabricError::NotFound { resource },
            FabricStatus::Conflict | FabricStatus::PreconditionFailed => {
                FabricError::Conflict { resource }
            }
            FabricStatus::NotImplemented => FabricError::NotSupported { feature: resource },
            FabricStatus::BadRequest => FabricError::InvalidParameter {
                message: format!("fabric rejected request for {}", resource),
            },
            _ => FabricError::Status { status, resource },
        }
    }

    /// Creates a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        FabricError::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(resource: impl Into<String>) -> Self {
        FabricError::Conflict {
            resource: resource.into(),
        }
    }

    /// Creates a not supported error.
    pub fn not_supported(feature: impl Into<String>) -> Self {
        FabricError::NotSupported {
            feature: feature.into(),
        }
    }

    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        FabricError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        FabricError::Transport {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        FabricError::Internal {
            message: message.into(),
        }
    }

    /// Returns the status code if this is a Status error.
    pub fn status(&self) -> Option<FabricStatus> {
        match self {
            FabricError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if the resource was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FabricError::NotFound { .. })
    }

    /// Returns true if the resource already existed or raced.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FabricError::Conflict { .. })
    }

    /// Returns true if the caller cancelled the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FabricError::Cancelled)
    }

    /// Returns true if repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::Transport { .. }
                | FabricError::Status {
                    status: FabricStatus::TooManyRequests
                        | FabricStatus::BadGateway
                        | FabricStatus::ServiceUnavailable
                        | FabricStatus::GatewayTimeout,
                    ..
                }
        )
    }
}

/// Result type for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;
