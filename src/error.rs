use thiserror::Error;

/// Typed failures the core surfaces to the dispatch caller.
///
/// The endpoint layer maps these to HTTP status codes: `UnknownModel` to
/// 400, `ProxyUpstreamError` to 502, `ShuttingDown`/`SpawnFailed` to 503,
/// `HealthTimeout` to 504.
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("model '{0}' does not resolve to any configured model or alias")]
    UnknownModel(String),

    #[error("model '{model}' resolved but has no owning group (config invariant violated)")]
    GroupNotFound { model: String },

    #[error("failed to spawn backend for model '{model}': {source}")]
    SpawnFailed {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("health check for model '{model}' did not pass within {timeout_secs}s")]
    HealthTimeout { model: String, timeout_secs: u64 },

    #[error("backend for model '{model}' exited unexpectedly while {phase}")]
    UnexpectedExit { model: String, phase: &'static str },

    #[error("upstream connection for model '{model}' failed: {source}")]
    ProxyUpstreamError {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("swap rejected: daemon is shutting down")]
    ShuttingDown,
}

impl SwapError {
    /// HTTP status this error maps to at the endpoint boundary.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            SwapError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            SwapError::GroupNotFound { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SwapError::ProxyUpstreamError { .. } => StatusCode::BAD_GATEWAY,
            SwapError::ShuttingDown | SwapError::SpawnFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SwapError::HealthTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SwapError::UnexpectedExit { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn status_codes_map_to_the_right_http_response() {
        assert_eq!(
            SwapError::UnknownModel("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SwapError::ProxyUpstreamError {
                model: "x".into(),
                source: anyhow::anyhow!("boom")
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            SwapError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SwapError::HealthTimeout {
                model: "x".into(),
                timeout_secs: 15
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
