use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Failure talking to the record service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid api base url '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{status} from {url}: {}", .error.message)]
    Api {
        url: String,
        status: u16,
        error: ApiError,
    },
    #[error("unexpected response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no api token configured; log in first")]
    NoSession,
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl ClientError {
    /// Error code reported by the service, if it answered with one.
    pub fn api_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api { error, .. } => Some(error.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(ErrorCode::NotFound)
    }
}
