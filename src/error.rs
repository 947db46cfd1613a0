use thiserror::Error;

/// Errors crossing the chain adapter boundary.
///
/// The transient/permanent split drives the retry policy: transient errors
/// are retried with linear backoff inside the adapter, everything else
/// surfaces to the pipeline immediately.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("rpc call timed out")]
    Timeout,

    #[error("http status {0}")]
    Status(reqwest::StatusCode),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map_or(false, |s| s.is_server_error())
            }
            AdapterError::Status(s) => s.is_server_error(),
            AdapterError::Ws(_) | AdapterError::Timeout | AdapterError::RateLimited => true,
            AdapterError::Rpc(_) | AdapterError::Malformed(_) | AdapterError::NotConfigured(_) => {
                false
            }
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AdapterError::RateLimited)
    }
}
