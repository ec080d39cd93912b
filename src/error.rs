use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EmptyCommand,
    Timeout,
    SpawnFailed,
    DirectoryNotFound,
    NotADirectory,
    PtyAlreadyStarted,
    PtyStartFailed,
    MalformedMessage,
    FilesystemError,
    InvalidArgument,
    IoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn display_message(&self) -> String {
        match &self.details {
            Some(details) => format!("{}: {}", self.message, details),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ApiError> for RelayError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Api(api) => api.error_code,
            RelayError::Io(_) => ErrorCode::IoError,
            RelayError::Json(_) => ErrorCode::IoError,
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            RelayError::Api(api) => api.display_message(),
            other => other.to_string(),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EmptyCommand => "EMPTY_COMMAND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::DirectoryNotFound => "DIRECTORY_NOT_FOUND",
            ErrorCode::NotADirectory => "NOT_A_DIRECTORY",
            ErrorCode::PtyAlreadyStarted => "PTY_ALREADY_STARTED",
            ErrorCode::PtyStartFailed => "PTY_START_FAILED",
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::FilesystemError => "FILESYSTEM_ERROR",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::IoError => "IO_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let value = serde_json::to_value(ErrorCode::DirectoryNotFound).expect("serialize");
        assert_eq!(value, serde_json::json!("DIRECTORY_NOT_FOUND"));
        assert_eq!(ErrorCode::PtyAlreadyStarted.as_str(), "PTY_ALREADY_STARTED");
    }

    #[test]
    fn display_message_includes_details() {
        let err = ApiError::new(ErrorCode::SpawnFailed, "Failed to spawn").with_details("ENOENT");
        assert_eq!(err.display_message(), "Failed to spawn: ENOENT");
        let relay: RelayError = err.into();
        assert_eq!(relay.code(), ErrorCode::SpawnFailed);
    }

    #[test]
    fn json_encode_failures_are_server_side() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid");
        let relay = RelayError::from(json_err);
        assert_eq!(relay.code(), ErrorCode::IoError);
    }
}
