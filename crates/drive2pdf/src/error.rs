use thiserror::Error;

/// Errors that can occur while authorizing, talking to Drive, or converting.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Drive API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authorization failed: {0}")]
    Auth(String),

    /// The token endpoint rejected the stored refresh token.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("gave up re-authorizing after {0} attempts")]
    ReauthLimit(u32),

    #[error("session is closed")]
    SessionClosed,

    #[error("session manager has been shut down")]
    ShutDown,

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    /// Build an [`Error::Api`] from a status code and a raw response body.
    ///
    /// Drive wraps failures as `{"error": {"message": ...}}`; anything else is
    /// kept verbatim.
    pub fn api(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.trim().to_string());
        Self::Api { status, message }
    }
}
