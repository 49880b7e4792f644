//! Reply envelope for request/reply topics.
//!
//! Every reply is either `{"result": ...}` or
//! `{"error": {"kind": "...", "message": "..."}}`.

use runbus_core::{Error, ErrorKind, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply sent back on a request's reply destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Successful result (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (mutually exclusive with result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    /// Success reply.
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// Error reply.
    pub fn err(error: ReplyError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    /// Build a reply from a handler result.
    pub fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(Error::from)) {
            Ok(value) => Self::ok(value),
            Err(error) => Self::err(ReplyError::from(&error)),
        }
    }

    /// Decode a reply body received over the bus.
    pub fn from_value(body: Value) -> Result<Self> {
        serde_json::from_value(body).map_err(|e| Error::Remote(format!("malformed reply: {}", e)))
    }

    /// Turn the reply back into a typed result on the caller side.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(error) = self.error {
            return Err(Error::from_remote(error.kind, error.message));
        }
        let result = self.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| Error::Remote(format!("unexpected reply: {}", e)))
    }

    /// Serialize for the wire.
    pub fn to_value(&self) -> Value {
        // Both fields are plain JSON values
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Structured error in a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// Machine-readable classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl ReplyError {
    /// Create a reply error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for ReplyError {
    fn from(error: &Error) -> Self {
        let message = match error {
            Error::Validation(message)
            | Error::Remote(message)
            | Error::Connection(message)
            | Error::ContractViolation(message)
            | Error::Internal(message) => message.clone(),
            other => other.to_string(),
        };
        Self::new(error.kind(), message)
    }
}
