use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the hosted service.
///
/// The auth endpoints and the table endpoints disagree on field names, so
/// every known spelling is accepted and the first one present wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

impl ApiErrorBody {
    pub fn into_message(self) -> Option<String> {
        [self.message, self.msg, self.error_description, self.error]
            .into_iter()
            .flatten()
            .find(|message| !message.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiException {
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
