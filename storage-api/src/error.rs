use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication rejected by storage cluster")]
    Unauthorized,

    #[error("unexpected status {status} from {context}: {body}")]
    UnexpectedStatus {
        status: u16,
        context: String,
        body: String,
    },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("task {location} did not finish within {waited:?}")]
    TaskTimeout { location: String, waited: Duration },

    #[error("accepted response from {0} carried no Location header")]
    MissingLocation(String),

    #[error("invalid API endpoint: {0}")]
    InvalidEndpoint(String),
}

impl ApiError {
    /// Status code of an unexpected response, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::UnexpectedStatus { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Response body of an unexpected response, empty otherwise.
    pub fn body(&self) -> &str {
        match self {
            ApiError::UnexpectedStatus { body, .. } => body,
            _ => "",
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
