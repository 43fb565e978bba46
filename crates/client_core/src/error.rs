use reqwest::StatusCode;
use shared::error::ApiErrorBody;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

const VALIDATION_FALLBACK: &str = "Request failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("server error (status {status})")]
    ServerError { status: u16 },
    #[error("request rejected (status {status}): {message}")]
    Validation { status: u16, message: String },
    #[error("transport handshake timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },
    #[error("transport handshake failed: {0}")]
    Handshake(String),
    #[error("no recipient selected")]
    NoRecipient,
    #[error("message needs text or an image")]
    EmptyMessage,
    #[error("not signed in")]
    NotAuthenticated,
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("transport is closed")]
    TransportClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Maps a non-success HTTP status and its (optional) error body onto the
    /// client taxonomy.
    pub fn classify(status: StatusCode, body: Option<&ApiErrorBody>) -> Self {
        match status.as_u16() {
            401 => ClientError::Unauthorized,
            403 => ClientError::Forbidden,
            code if code >= 500 => ClientError::ServerError { status: code },
            code => {
                let message = body
                    .and_then(ApiErrorBody::text)
                    .map(str::to_string)
                    .or_else(|| status.canonical_reason().map(str::to_string))
                    .unwrap_or_else(|| VALIDATION_FALLBACK.to_string());
                ClientError::Validation {
                    status: code,
                    message,
                }
            }
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ClientError::classify(status, None);
        }
        if err.is_decode() {
            return ClientError::UnexpectedShape(err.to_string());
        }
        ClientError::NetworkUnreachable(err.to_string())
    }

    /// Errors that leave the session intact and can be retried by hand.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::NetworkUnreachable(_)
                | ClientError::ServerError { .. }
                | ClientError::ConnectTimeout { .. }
                | ClientError::Handshake(_)
        )
    }

    /// Text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::NetworkUnreachable(_) => {
                "Network error. Please check your connection.".to_string()
            }
            ClientError::Unauthorized => "Session expired. Please log in again.".to_string(),
            ClientError::Forbidden => "Forbidden".to_string(),
            ClientError::ServerError { .. } => "Server error".to_string(),
            ClientError::Validation { message, .. } => message.clone(),
            ClientError::ConnectTimeout { .. } | ClientError::Handshake(_) => {
                "Realtime connection unavailable; retrying in the background.".to_string()
            }
            ClientError::NoRecipient => "No recipient selected".to_string(),
            ClientError::EmptyMessage => "Type a message or attach an image.".to_string(),
            ClientError::NotAuthenticated => "Please log in first.".to_string(),
            ClientError::UnexpectedShape(_)
            | ClientError::Storage(_)
            | ClientError::TransportClosed
            | ClientError::Config(_) => "Unexpected error.".to_string(),
        }
    }
}
