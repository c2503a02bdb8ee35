//! Request and response headers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;
use crate::method::RemoteMethod;

/// Header preceding every request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub call_id: i32,
    pub remote_method: RemoteMethod,
    /// Client-side timeout; lets the server skip work for abandoned calls.
    pub timeout_millis: Option<u32>,
    /// Application feature flags the server must support.
    pub required_feature_flags: Vec<u32>,
    /// Present only for calls that want exactly-once semantics.
    pub request_id: Option<RequestId>,
    pub sidecar_offsets: Vec<u32>,
}

/// Header preceding every response body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub call_id: i32,
    /// When set the body is a bincode-encoded [`ErrorStatus`].
    pub is_error: bool,
    pub sidecar_offsets: Vec<u32>,
}

/// Error classes a server reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorCode {
    FatalUnknown,
    ApplicationError,
    NoSuchMethod,
    NoSuchService,
    ServerTooBusy,
    InvalidRequest,
    /// The request's sequence number is below the client's own low-water
    /// mark; its result is no longer retained.
    RequestStale,
    Unavailable,
    FatalServerShuttingDown,
    FatalVersionMismatch,
    FatalUnauthorized,
}

/// Application-defined error payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub error_ext_id: i32,
    pub payload: Vec<u8>,
}

/// Body of an error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub message: String,
    pub code: RpcErrorCode,
    pub unsupported_feature_flags: Vec<u32>,
    pub app_error: Option<AppError>,
}

impl ErrorStatus {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            unsupported_feature_flags: Vec::new(),
            app_error: None,
        }
    }

    pub fn unsupported_features(features: Vec<u32>) -> Self {
        Self {
            message: "server does not support required application features".to_string(),
            code: RpcErrorCode::InvalidRequest,
            unsupported_feature_flags: features,
            app_error: None,
        }
    }

    pub fn application(error_ext_id: i32, message: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message: message.into(),
            code: RpcErrorCode::ApplicationError,
            unsupported_feature_flags: Vec::new(),
            app_error: Some(AppError {
                error_ext_id,
                payload,
            }),
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if !self.unsupported_feature_flags.is_empty() {
            write!(f, " (unsupported features: {:?})", self.unsupported_feature_flags)?;
        }
        Ok(())
    }
}
