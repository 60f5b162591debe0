/// Errors surfaced by the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A non-2xx, non-raw response. The body is captured as raw text (not
    /// eagerly parsed as JSON) so callers can inspect it without the
    /// transport having to guess at its shape.
    #[error("http {status}: {status_text}")]
    Status {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("failed to decode response body as JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, HttpError>;
