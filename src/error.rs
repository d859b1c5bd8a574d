//! Error taxonomy for the core. Codes are a contract (§7) — never rename the
//! `code()` strings without checking the HTTP surface and the CLI's error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("model not found: {message}")]
    ModelNotFound {
        message: String,
        suggestion: Option<String>,
    },

    #[error("download failed: {message}")]
    DownloadFailed {
        message: String,
        details: Option<String>,
    },

    #[error("insufficient resources: {message}")]
    InsufficientResources { message: String },

    #[error("server error: {message}")]
    ServerError { message: String },

    #[error("port in use: {message}")]
    PortInUse { message: String },

    #[error("filesystem error: {message}")]
    FileSystemError { message: String },

    #[error("checksum mismatch: {message}")]
    ChecksumError { message: String },

    #[error("binary error: {message}")]
    BinaryError {
        message: String,
        details: Option<String>,
    },

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl CoreError {
    /// Contract error code (§7) — not the Rust variant name.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            CoreError::DownloadFailed { .. } => "DOWNLOAD_FAILED",
            CoreError::InsufficientResources { .. } => "INSUFFICIENT_RESOURCES",
            CoreError::ServerError { .. } => "SERVER_ERROR",
            CoreError::PortInUse { .. } => "PORT_IN_USE",
            CoreError::FileSystemError { .. } => "FILE_SYSTEM_ERROR",
            CoreError::ChecksumError { .. } => "CHECKSUM_ERROR",
            CoreError::BinaryError { .. } => "BINARY_ERROR",
            CoreError::Unknown { .. } => "UNKNOWN_ERROR",
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            CoreError::ModelNotFound { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::PortInUse { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::InsufficientResources { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn model_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        CoreError::ModelNotFound {
            suggestion: Some(format!("run `genforge models pull {name}` to install it")),
            message: format!("no model registered with id '{name}'"),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        CoreError::Unknown {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::FileSystemError {
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::DownloadFailed {
            message: e.to_string(),
            details: None,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::FileSystemError {
            message: format!("json error: {e}"),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: &message,
                code: self.code(),
                suggestion: self.suggestion(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_contract() {
        assert_eq!(
            CoreError::model_not_found("x").code(),
            "MODEL_NOT_FOUND"
        );
        assert_eq!(
            CoreError::PortInUse {
                message: "x".into()
            }
            .code(),
            "PORT_IN_USE"
        );
    }

    #[test]
    fn model_not_found_carries_suggestion() {
        let e = CoreError::model_not_found("llama-2-7b");
        assert!(e.suggestion().unwrap().contains("llama-2-7b"));
    }
}
