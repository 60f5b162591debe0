//! Wire-shaped DTOs: the JSON the server actually sends, deserialized
//! verbatim. Higher-level identity and caching live in `teamchat-client`;
//! this module only knows how to parse bytes into structured data.

use serde::{Deserialize, Serialize};

/// A tenant's base URL, plus an optional explicit socket-server override.
#[derive(Debug, Clone)]
pub struct Installation {
    pub base_url: url::Url,
    pub socket_server: Option<url::Url>,
}

impl Installation {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            base_url,
            socket_server: None,
        }
    }

    #[must_use]
    pub fn with_socket_server(mut self, url: url::Url) -> Self {
        self.socket_server = Some(url);
        self
    }
}

/// The magic password used when logging in with a bare API key.
pub const API_KEY_PASSWORD: &str = "club-lemon";

/// Production installations live under `teamwork.com` and share one
/// socket server; every other host is a development tenant reached
/// through its own `/socket` endpoint.
pub const PRODUCTION_SOCKET_URL: &str = "wss://chat.teamwork.com/socket";
const PRODUCTION_HOST_SUFFIX: &str = "teamwork.com";

/// Resolve the WebSocket URL for an installation: an explicit override
/// wins, otherwise production installations use the shared socket
/// server and everything else substitutes its own hostname.
pub fn resolve_socket_url(installation: &Installation) -> Result<url::Url, url::ParseError> {
    if let Some(explicit) = &installation.socket_server {
        return Ok(explicit.clone());
    }
    let host = installation.base_url.host_str().unwrap_or_default();
    if host.ends_with(PRODUCTION_HOST_SUFFIX) {
        url::Url::parse(PRODUCTION_SOCKET_URL)
    } else {
        url::Url::parse(&format!("wss://{host}/socket"))
    }
}

/// Credentials accepted by the login flow.
#[derive(Debug, Clone)]
pub enum Credentials {
    UserPass { username: String, password: String },
    ApiKey(String),
    Token(String),
}

/// `authentication.response` contents sent by the client mid-handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    #[serde(rename = "authKey")]
    pub auth_key: String,
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(rename = "installationDomain")]
    pub installation_domain: String,
    #[serde(rename = "installationId")]
    pub installation_id: i64,
    #[serde(rename = "clientVersion")]
    pub client_version: String,
}

/// `authentication.error` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// Raw person payload, as embedded in REST responses and push frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonPayload {
    pub id: i64,
    pub handle: String,
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "lastActivityAt", default)]
    pub last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "pairRoomId", default)]
    pub pair_room_id: Option<i64>,
    #[serde(default)]
    pub company: Option<serde_json::Value>,
}

/// Raw room payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type", default)]
    pub room_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "creatorId", default)]
    pub creator_id: Option<i64>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "lastActivityAt", default)]
    pub last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "lastViewedAt", default)]
    pub last_viewed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub people: Vec<PersonPayload>,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    #[serde(rename = "unreadCount", default)]
    pub unread_count: u32,
    #[serde(rename = "importantUnreadCount", default)]
    pub important_unread_count: u32,
}

/// Raw message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: i64,
    #[serde(rename = "roomId")]
    pub room_id: i64,
    #[serde(rename = "userId")]
    pub author_id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "editedAt", default)]
    pub edited_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub file: Option<serde_json::Value>,
    #[serde(rename = "thirdPartyCards", default)]
    pub third_party_cards: Option<serde_json::Value>,
    #[serde(rename = "isUserActive", default)]
    pub is_user_active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_payload_parses_with_missing_optionals() {
        let raw = serde_json::json!({"id": 1, "handle": "peter"});
        let person: PersonPayload = serde_json::from_value(raw).expect("parses");
        assert_eq!(person.id, 1);
        assert_eq!(person.handle, "peter");
        assert!(person.status.is_none());
    }

    #[test]
    fn production_host_uses_shared_socket_server() {
        let installation = Installation::new(url::Url::parse("https://digitalcrew.teamwork.com").expect("url"));
        let socket = resolve_socket_url(&installation).expect("resolves");
        assert_eq!(socket.as_str(), PRODUCTION_SOCKET_URL);
    }

    #[test]
    fn development_host_substitutes_its_own_hostname() {
        let installation = Installation::new(url::Url::parse("https://staging.example.test").expect("url"));
        let socket = resolve_socket_url(&installation).expect("resolves");
        assert_eq!(socket.as_str(), "wss://staging.example.test/socket");
    }

    #[test]
    fn explicit_socket_server_override_wins() {
        let override_url = url::Url::parse("wss://custom.example.test/socket").expect("url");
        let installation = Installation::new(url::Url::parse("https://digitalcrew.teamwork.com").expect("url"))
            .with_socket_server(override_url.clone());
        assert_eq!(resolve_socket_url(&installation).expect("resolves"), override_url);
    }
}
