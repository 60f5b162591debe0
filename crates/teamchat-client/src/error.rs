/// Errors surfaced by the socket session, wire client, and orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http transport error: {0}")]
    Http(#[from] teamchat_http::HttpError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Lookup(String),

    #[error("invalid operation: {0}")]
    Contract(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

// `impl_context!` hardcodes the identifier `Error`, so alias it locally to
// get `.context()`/`.with_context()` on `Result`/`Option` without renaming
// the public `ClientError` type.
#[allow(dead_code)]
type Error = ClientError;

impl teamchat_common::FromMessage for ClientError {
    fn from_message(message: String) -> Self {
        ClientError::Protocol(message)
    }
}

teamchat_common::impl_context!();
