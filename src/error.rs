// Error taxonomy for the proxy. Only errors raised before the first byte is
// streamed ever reach the HTTP layer; mid-stream failures end the body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The requested source URL is malformed or unsupported.
    #[error("invalid source url: {0}")]
    Classification(String),

    /// Transport failure talking to an origin or CDN.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The media tool could not resolve a playable CDN URL.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// The external media process could not be started or failed.
    #[error("external process failed: {0}")]
    ProcessFailure(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Classification(_) => StatusCode::BAD_REQUEST,
            ProxyError::Connection(_)
            | ProxyError::Resolution(_)
            | ProxyError::ProcessFailure(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Connection(e.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Connection(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("proxy request rejected status={} error={}", status.as_u16(), self);
        match self {
            ProxyError::Classification(msg) => (status, msg).into_response(),
            // Upstream failures carry no body.
            _ => status.into_response(),
        }
    }
}
