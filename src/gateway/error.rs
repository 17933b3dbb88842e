/// Errors surfaced by [`Gateway`](super::Gateway).
///
/// `Clone` so a single refresh failure can be handed to every caller that was
/// queued behind it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("network: {0}")]
    Network(String),

    #[error("authorization expired")]
    AuthExpired,

    #[error("token refresh failed: {0}")]
    RefreshFailed(Box<GatewayError>),

    #[error("{message}")]
    Business { code: i64, message: String },

    #[error("decode: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub(crate) fn refresh_failed(cause: GatewayError) -> Self {
        match cause {
            already @ GatewayError::RefreshFailed(_) => already,
            other => GatewayError::RefreshFailed(Box::new(other)),
        }
    }

    /// True when the session ended because the refresh token was rejected.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, GatewayError::RefreshFailed(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}
