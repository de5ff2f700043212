use thiserror::Error;

/// Failure signal from a single MSP API call.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// An HTML page where JSON was expected, usually a login redirect.
    #[error("{url} returned an HTML page instead of JSON")]
    HtmlResponse { url: String },

    #[error("invalid JSON from {url}: {message}")]
    InvalidJson { url: String, message: String },

    #[error("unauthorized: {url} rejected the API token")]
    Unauthorized { url: String },
}

impl ApiError {
    /// Auth failures require reconfiguration and are never retried within a cycle.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::HtmlResponse { .. })
    }
}
