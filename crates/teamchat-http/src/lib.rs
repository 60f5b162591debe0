//! The HTTP transport: all REST calls to an installation, with cookie
//! auth, bracket-notation query encoding, and typed errors.

pub mod auth_token;
pub mod error;
pub mod query;
pub mod transport;

pub use {
    auth_token::AuthToken,
    error::{HttpError, Result},
    query::Query,
    transport::{PagedResponse, RequestOptions, Transport},
};

#[cfg(test)]
mod tests {
    use reqwest::Method;
    use serde_json::json;

    use super::*;

    async fn transport_against(server: &mockito::ServerGuard) -> Transport {
        let base = url::Url::parse(&format!("{}/", server.url())).expect("valid base url");
        Transport::new(base, AuthToken::new("test-token"))
    }

    #[tokio::test]
    async fn attaches_tw_auth_cookie() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/chat/me.json")
            .match_header("cookie", "tw-auth=test-token")
            .with_status(200)
            .with_body(r#"{"account":{"id":1}}"#)
            .create_async()
            .await;

        let transport = transport_against(&server).await;
        let body = transport
            .request("chat/me.json", RequestOptions::get())
            .await
            .expect("request succeeds");

        mock.assert_async().await;
        assert_eq!(body, Some(json!({"account": {"id": 1}})));
    }

    #[tokio::test]
    async fn no_content_resolves_to_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/launchpad/v1/logout.json")
            .with_status(204)
            .create_async()
            .await;

        let transport = transport_against(&server).await;
        let body = transport
            .request(
                "launchpad/v1/logout.json",
                RequestOptions::get().method(Method::DELETE),
            )
            .await
            .expect("request succeeds");

        assert_eq!(body, None);
    }

    #[tokio::test]
    async fn non_2xx_fails_with_status_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/chat/people/9999.json")
            .with_status(404)
            .with_body(r#"{"message":"not found"}"#)
            .create_async()
            .await;

        let transport = transport_against(&server).await;
        let err = transport
            .request("chat/people/9999.json", RequestOptions::get())
            .await
            .expect_err("request fails");

        match err {
            HttpError::Status { status, body, .. } => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            },
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_uses_bracket_notation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/chat/v3/people.json")
            .match_query(mockito::Matcher::UrlEncoded(
                "filter[searchTerm]".into(),
                "peter".into(),
            ))
            .with_status(200)
            .with_body(r#"{"people":[]}"#)
            .create_async()
            .await;

        let transport = transport_against(&server).await;
        transport
            .request(
                "chat/v3/people.json",
                RequestOptions::get().query(Query::new().filter("searchTerm", Some("peter"))),
            )
            .await
            .expect("request succeeds");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn path_with_query_string_and_explicit_query_is_rejected() {
        let server = mockito::Server::new_async().await;
        let transport = transport_against(&server).await;
        let err = transport
            .request(
                "chat/v3/people.json?foo=bar",
                RequestOptions::get().query(Query::new().field("x", "1")),
            )
            .await
            .expect_err("rejected");
        assert!(matches!(err, HttpError::Validation(_)));
    }
}
