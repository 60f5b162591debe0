use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{AuthToken, HttpError, Result, query::Query};

/// A paginated list response: the decoded items plus the server's paging
/// metadata.
#[derive(Debug, Clone)]
pub struct PagedResponse {
    pub items: Value,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub total: Option<u64>,
}

/// Options for a single [`Transport::request`] call.
#[derive(Debug, Default)]
pub struct RequestOptions<'a> {
    pub method: Method_,
    pub body: Option<Value>,
    pub query: Query,
    pub headers: Vec<(&'a str, String)>,
}

/// A thin wrapper so `RequestOptions` can `#[derive(Default)]` without
/// requiring `reqwest::Method: Default`.
#[derive(Debug, Clone)]
pub struct Method_(pub Method);

impl Default for Method_ {
    fn default() -> Self {
        Self(Method::GET)
    }
}

impl<'a> RequestOptions<'a> {
    pub fn get() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Method_(method);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Serialize) -> Self {
        self.body = serde_json::to_value(body).ok();
        self
    }

    #[must_use]
    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Performs all REST calls against a single installation, attaching the
/// `tw-auth` cookie and decoding JSON bodies.
#[derive(Debug, Clone)]
pub struct Transport {
    base_url: url::Url,
    client: reqwest::Client,
    token: AuthToken,
}

impl Transport {
    pub fn new(base_url: url::Url, token: AuthToken) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Issue a request without attaching an auth cookie — used only for
    /// the initial login call.
    pub async fn request_unauthenticated(
        &self,
        path: &str,
        opts: RequestOptions<'_>,
    ) -> Result<reqwest::Response> {
        self.send(path, opts, false).await
    }

    /// Issue an authenticated request. Target paths must not already
    /// contain a `?` — callers supply query params exclusively through
    /// [`RequestOptions::query`].
    pub async fn request(&self, path: &str, opts: RequestOptions<'_>) -> Result<Option<Value>> {
        let response = self.send(path, opts, true).await?;
        Self::decode(response).await
    }

    /// Like [`Transport::request`] but returns the raw `reqwest::Response`
    /// (e.g. to read `Set-Cookie` on impersonate).
    pub async fn request_raw(
        &self,
        path: &str,
        opts: RequestOptions<'_>,
    ) -> Result<reqwest::Response> {
        self.send(path, opts, true).await
    }

    /// A list endpoint, decomposed into its items plus paging metadata.
    pub async fn request_list(&self, path: &str, opts: RequestOptions<'_>) -> Result<PagedResponse> {
        let body = self.request(path, opts).await?.unwrap_or(Value::Null);
        let offset = body.pointer("/page/offset").and_then(Value::as_u64);
        let limit = body.pointer("/page/limit").and_then(Value::as_u64);
        let total = body.pointer("/page/total").and_then(Value::as_u64);
        Ok(PagedResponse {
            items: body,
            offset,
            limit,
            total,
        })
    }

    async fn send(
        &self,
        path: &str,
        opts: RequestOptions<'_>,
        authenticated: bool,
    ) -> Result<reqwest::Response> {
        if path.contains('?') && !opts.query.is_empty() {
            return Err(HttpError::Validation(
                "path already contains a query string; pass params through `query` instead".into(),
            ));
        }

        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| HttpError::Validation(format!("invalid path {path}: {e}")))?;

        let mut req = self.client.request(opts.method.0, url);

        if !opts.query.is_empty() {
            req = req.query(opts.query.as_pairs());
        }

        if authenticated {
            let cookie = AuthToken::cookie_header(&self.token.get().await);
            req = req.header(reqwest::header::COOKIE, cookie);
        }

        for (name, value) in &opts.headers {
            req = req.header(*name, value.clone());
        }

        if let Some(body) = opts.body {
            req = req.json(&body);
        }

        debug!(path, authenticated, "sending request");
        Ok(req.send().await?)
    }

    async fn decode(response: reqwest::Response) -> Result<Option<Value>> {
        let status = response.status();
        if status == StatusCode::NO_CONTENT
            || response.content_length() == Some(0)
        {
            if !status.is_success() {
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or("unknown").into(),
                    body: String::new(),
                });
            }
            return Ok(None);
        }

        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("unknown").to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                status_text,
                body,
            });
        }

        let text = response.text().await?;
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}
