use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadBalancerError {
    #[error("invalid upstream address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("at least one upstream target is required")]
    NoTargets,

    #[error("request to upstream {addr} failed: {source}")]
    Upstream {
        addr: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("upstream {addr} did not respond within {timeout:?}")]
    UpstreamTimeout { addr: String, timeout: Duration },

    #[error("failed to build upstream request: {0}")]
    Request(#[from] http::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LoadBalancerError {
    /// Status returned to the client when forwarding fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            LoadBalancerError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
