use crate::keys::OriginKey;
use http::StatusCode;
use thiserror::Error;

/// Result type alias for vod-proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Errors that can occur while configuring the proxy or serving a request
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid proxy path: {0}")]
    MalformedProxyPath(String),

    #[error("url strategy not found for {0}")]
    UnknownOrigin(OriginKey),

    #[error("upstream attempt against {target} failed: {reason}")]
    UpstreamAttemptFailed { target: String, reason: String },

    #[error("both main and backup server fail")]
    BothOriginsFailed,

    #[error("invalid strategy configuration: {0}")]
    InvalidStrategyConfiguration(String),

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("failed to read upstream body: {0}")]
    ResponseBody(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not build upstream client: {0}")]
    Client(String),

    #[error("proxy has been closed")]
    Closed,
}

impl ProxyError {
    /// Status code used when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
