//! Gateway HTTP protocol: JSON bodies for `/execute`

use serde::{Deserialize, Serialize};
use shellbox_core::{ExecutionRequest, SandboxError};

/// Session used when the client does not send one
pub const DEFAULT_SESSION: &str = "default";

/// `POST /execute` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(flatten)]
    pub request: ExecutionRequest,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ExecuteRequest {
    pub fn session(&self) -> &str {
        self.session_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SESSION)
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Malformed body; every other code comes from `SandboxError::code`
pub const ERR_INVALID_REQUEST: &str = "invalid_request";

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl From<&SandboxError> for ErrorBody {
    fn from(err: &SandboxError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
