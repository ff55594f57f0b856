//! Client error types

use obs_transfer::EndpointError;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error answered by the service
    #[error("service error ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// Object, bucket or upload not found
    #[error("not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// XML encoding or parsing error
    #[error("XML error: {0}")]
    Xml(String),

    /// Invalid response
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

impl ClientError {
    /// Build a service error from an XML error body
    pub fn from_service_xml(xml: &str, status: u16) -> Self {
        let body: ErrorBody = quick_xml::de::from_str(xml).unwrap_or_default();
        Self::Service {
            status,
            code: body.code.unwrap_or_else(|| format!("HTTP{}", status)),
            message: body.message.unwrap_or_else(|| "Unknown error".to_string()),
            request_id: body.request_id,
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Service { status: 404, .. })
    }

    /// Whether re-sending the request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::Service { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Io(_) => true,
            _ => false,
        }
    }
}

impl From<ClientError> for EndpointError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Http(e) if e.is_decode() => EndpointError::InvalidResponse(e.to_string()),
            ClientError::Http(e) => EndpointError::Transport(e.to_string()),
            ClientError::Service {
                status,
                code,
                message,
                request_id,
            } => EndpointError::Service {
                status,
                code,
                message,
                request_id,
            },
            ClientError::NotFound { bucket, key } => EndpointError::NotFound { bucket, key },
            ClientError::Io(e) => EndpointError::Io(e),
            e @ (ClientError::Config(_) | ClientError::Xml(_) | ClientError::InvalidResponse(_)) => {
                EndpointError::InvalidResponse(e.to_string())
            }
        }
    }
}
