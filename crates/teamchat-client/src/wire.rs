//! The wire client: combines the HTTP transport and the socket session
//! into every domain-level RPC (login, send message, typing, status,
//! impersonate, paginated list helpers).

use std::time::Duration;

use reqwest::Method;
use teamchat_http::{AuthToken, PagedResponse, Query, RequestOptions, Transport};
use teamchat_protocol::{
    AWAIT_FRAME_TIMEOUT_SECS, AuthenticationResponse, Credentials, Installation, MessagePayload,
    PersonPayload, RoomPayload, frame_names, resolve_socket_url,
};

use crate::{
    error::{ClientError, Context, Result},
    socket::SocketSession,
};

/// Account fields the handshake's `authentication.response` frame needs,
/// resolved from `GET /chat/me.json?includeAuth=true` (§6/§4.3) before
/// the socket ever connects — the cookie alone doesn't carry them.
#[derive(Debug, Clone)]
struct AccountInfo {
    auth_key: String,
    user_id: i64,
    installation_domain: String,
    installation_id: i64,
}

async fn fetch_account_info(transport: &Transport) -> Result<AccountInfo> {
    let body = transport
        .request(
            "chat/me.json",
            RequestOptions::get().query(Query::new().field("includeAuth", "true")),
        )
        .await
        .context("fetching chat/me.json for the handshake account fields")?
        .ok_or_else(|| ClientError::Protocol("chat/me.json returned no body".into()))?;
    let account = body
        .get("account")
        .ok_or_else(|| ClientError::Protocol("chat/me.json missing 'account'".into()))?;
    Ok(AccountInfo {
        auth_key: account
            .get("authKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Protocol("chat/me.json account missing 'authKey'".into()))?
            .to_string(),
        user_id: account
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ClientError::Protocol("chat/me.json account missing 'id'".into()))?,
        installation_domain: account
            .get("installationDomain")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        installation_id: account
            .get("installationId")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}

impl AccountInfo {
    fn to_handshake(&self) -> AuthenticationResponse {
        AuthenticationResponse {
            auth_key: self.auth_key.clone(),
            user_id: self.user_id,
            installation_domain: self.installation_domain.clone(),
            installation_id: self.installation_id,
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// A filter for the paginated list endpoints (`getRooms`/`getPeople`/
/// `getUserMessages`).
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub include_messages: bool,
    pub include_users: bool,
    pub sort: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl ListFilter {
    fn into_query(self) -> Query {
        let mut query = Query::new()
            .filter("updatedAfter", self.since.map(|t| t.to_rfc3339()))
            .filter("status", self.status)
            .filter("searchTerm", self.search)
            .page(self.offset, self.limit);
        if let Some(sort) = self.sort {
            query = query.field("sort", sort);
        } else {
            query = query.field("sort", "lastActivityAt");
        }
        if self.include_messages {
            query = query.field("includeMessageData", "true");
        }
        if self.include_users {
            query = query.field("includeUserData", "true");
        }
        query
    }
}

/// Decomposed `unseen.counts.updated` response.
#[derive(Debug, Clone, Default)]
pub struct UnseenCounts {
    pub important_rooms: u64,
    pub important_conversations: Option<u64>,
    pub total_rooms: u64,
    pub total_conversations: Option<u64>,
}

pub struct WireClient {
    installation: Installation,
    transport: Transport,
    token: AuthToken,
    socket: SocketSession,
    account: AccountInfo,
}

impl WireClient {
    pub async fn from_credentials(
        installation: Installation,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let transport = Transport::new(installation.base_url.clone(), AuthToken::new(""));
        let response = transport
            .request_unauthenticated(
                "launchpad/v1/login.json",
                RequestOptions::get().method(Method::POST).body(serde_json::json!({
                    "username": username.into(),
                    "password": password.into(),
                    "rememberMe": true,
                })),
            )
            .await?;

        let cookie = extract_tw_auth(&response)
            .ok_or_else(|| ClientError::Auth("login response carried no tw-auth cookie".into()))?;
        Self::from_auth(installation, cookie).await
    }

    pub async fn from_key(installation: Installation, key: impl Into<String>) -> Result<Self> {
        Self::from_credentials(installation, key, teamchat_protocol::API_KEY_PASSWORD).await
    }

    pub async fn from_auth(installation: Installation, token: impl Into<String>) -> Result<Self> {
        let token = AuthToken::new(token);
        let transport = Transport::new(installation.base_url.clone(), token.clone());
        let account = fetch_account_info(&transport).await?;
        let socket_url = resolve_socket_url(&installation)
            .map_err(|e| ClientError::Connection(format!("invalid socket url: {e}")))?;
        let socket = SocketSession::connect(socket_url.as_str(), &token.get().await, account.to_handshake())
            .await
            .context("authenticating socket session")?;
        Ok(Self {
            installation,
            transport,
            token,
            socket,
            account,
        })
    }

    pub async fn from(installation: Installation, credentials: Credentials) -> Result<Self> {
        match credentials {
            Credentials::UserPass { username, password } => {
                Self::from_credentials(installation, username, password).await
            },
            Credentials::ApiKey(key) => Self::from_key(installation, key).await,
            Credentials::Token(token) => Self::from_auth(installation, token).await,
        }
    }

    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    pub fn socket(&self) -> &SocketSession {
        &self.socket
    }

    /// The current user's id, resolved from `chat/me.json` at connect
    /// time — the socket handshake already required fetching this.
    pub fn user_id(&self) -> i64 {
        self.account.user_id
    }

    /// The current `tw-auth` cookie value, for persistence into a
    /// credential cache (e.g. `.teamchatrc`).
    pub async fn auth_token(&self) -> String {
        self.token.get().await
    }

    /// Open a fresh socket session reusing this client's transport and
    /// auth token, for use by the orchestrator's reconnect loop. Refetches
    /// the account fields since a reconnect re-runs the full handshake.
    pub async fn reconnect(&self) -> Result<Self> {
        let socket_url = resolve_socket_url(&self.installation)
            .map_err(|e| ClientError::Connection(format!("invalid socket url: {e}")))?;
        let account = fetch_account_info(&self.transport).await?;
        let socket = SocketSession::connect(socket_url.as_str(), &self.token.get().await, account.to_handshake())
            .await
            .context("reconnecting socket session")?;
        Ok(Self {
            installation: self.installation.clone(),
            transport: self.transport.clone(),
            token: self.token.clone(),
            socket,
            account,
        })
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(AWAIT_FRAME_TIMEOUT_SECS)
    }

    /// `GET /chat/me.json?includeAuth=true`.
    pub async fn me(&self) -> Result<serde_json::Value> {
        self.transport
            .request(
                "chat/me.json",
                RequestOptions::get().query(Query::new().field("includeAuth", "true")),
            )
            .await?
            .ok_or_else(|| ClientError::Protocol("chat/me.json returned no body".into()))
    }

    pub async fn send_message(&self, room_id: i64, body: impl Into<String>) -> Result<MessagePayload> {
        let frame = self
            .socket
            .socket_request(
                frame_names::ROOM_MESSAGE_CREATED,
                serde_json::json!({"roomId": room_id, "body": body.into()}),
                Self::default_timeout(),
            )
            .await?;
        let message = frame
            .contents
            .get("message")
            .cloned()
            .unwrap_or(frame.contents);
        Ok(serde_json::from_value(message)?)
    }

    pub async fn set_typing(&self, room_id: i64, is_typing: bool) -> Result<()> {
        self.socket
            .socket_request(
                frame_names::ROOM_TYPING,
                serde_json::json!({"roomId": room_id, "isTyping": is_typing}),
                Self::default_timeout(),
            )
            .await?;
        Ok(())
    }

    pub async fn activate_room(&self, room_id: i64) -> Result<()> {
        self.socket
            .socket_request(
                frame_names::ROOM_USER_ACTIVE,
                serde_json::json!({"roomId": room_id, "date": chrono::Utc::now().to_rfc3339()}),
                Self::default_timeout(),
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget: the server only replies when status genuinely
    /// changes, so no response is awaited.
    pub async fn update_status(&self, status: &str) -> Result<()> {
        if status != "idle" && status != "active" {
            return Err(ClientError::Contract(format!(
                "status must be 'idle' or 'active', got '{status}'"
            )));
        }
        self.socket
            .send_frame(
                frame_names::USER_MODIFIED_STATUS,
                serde_json::json!({"status": status}),
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn unseen_counts(&self) -> Result<UnseenCounts> {
        let frame = self
            .socket
            .socket_request(
                frame_names::UNSEEN_COUNTS_REQUEST,
                serde_json::json!({}),
                Self::default_timeout(),
            )
            .await?;
        let get = |path: &str| frame.contents.pointer(path).and_then(|v| v.as_u64());
        Ok(UnseenCounts {
            important_rooms: get("/important/rooms").unwrap_or(0),
            important_conversations: get("/important/conversations"),
            total_rooms: get("/total/rooms").unwrap_or(0),
            total_conversations: get("/total/conversations"),
        })
    }

    /// The raw `userSettings` PUT. Callers are responsible for the
    /// "pair rooms only" legality check and for resolving a default
    /// `before_message_id` — see [`crate::session::Session::clear_room_history`].
    pub async fn clear_room_history(&self, room_id: i64, before_message_id: i64) -> Result<()> {
        self.transport
            .request(
                &format!("chat/v2/conversations/{room_id}/user-settings.json"),
                RequestOptions::get().method(Method::PUT).body(serde_json::json!({
                    "userSettings": {"messageIdHistoryStartsAfter": before_message_id},
                })),
            )
            .await?;
        Ok(())
    }

    pub async fn impersonate(&self, person_id: i64) -> Result<()> {
        let response = self
            .transport
            .request_raw(
                &format!("people/{person_id}/impersonate.json"),
                RequestOptions::get().method(Method::PUT),
            )
            .await?;
        let cookie = extract_tw_auth(&response)
            .ok_or_else(|| ClientError::Auth("impersonate response carried no tw-auth cookie".into()))?;
        self.token.set(cookie).await;
        Ok(())
    }

    pub async fn unimpersonate(&self) -> Result<()> {
        let response = self
            .transport
            .request_raw(
                "people/impersonate/revert.json",
                RequestOptions::get().method(Method::PUT),
            )
            .await?;
        let cookie = extract_tw_auth(&response)
            .ok_or_else(|| ClientError::Auth("unimpersonate response carried no tw-auth cookie".into()))?;
        self.token.set(cookie).await;
        Ok(())
    }

    /// No endpoint exists for exact handle lookup; search and match.
    pub async fn get_person_by_handle(&self, handle: &str) -> Result<PersonPayload> {
        let page = self
            .transport
            .request_list(
                "chat/v3/people.json",
                RequestOptions::get().query(Query::new().filter("searchTerm", Some(handle))),
            )
            .await?;
        let people: Vec<PersonPayload> = page
            .items
            .get("people")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        people
            .into_iter()
            .find(|p| p.handle == handle)
            .ok_or_else(|| ClientError::Lookup(format!("no person with handle '{handle}'")))
    }

    pub async fn get_rooms(&self, filter: ListFilter) -> Result<(Vec<RoomPayload>, PagedResponse)> {
        let page = self
            .transport
            .request_list(
                "chat/v3/conversations.json",
                RequestOptions::get().query(filter.into_query()),
            )
            .await?;
        let rooms: Vec<RoomPayload> = page
            .items
            .get("conversations")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok((rooms, page))
    }

    pub async fn get_people(&self, filter: ListFilter) -> Result<(Vec<PersonPayload>, PagedResponse)> {
        let page = self
            .transport
            .request_list(
                "chat/v3/people.json",
                RequestOptions::get().query(filter.into_query()),
            )
            .await?;
        let people: Vec<PersonPayload> = page
            .items
            .get("people")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok((people, page))
    }

    pub async fn get_user_messages(&self, filter: ListFilter) -> Result<(Vec<MessagePayload>, PagedResponse)> {
        let page = self
            .transport
            .request_list("chat/v2/messages.json", RequestOptions::get().query(filter.into_query()))
            .await?;
        let messages: Vec<MessagePayload> = page
            .items
            .get("messages")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok((messages, page))
    }

    pub async fn get_room(&self, room_id: i64) -> Result<RoomPayload> {
        let body = self
            .transport
            .request(
                &format!("chat/v2/rooms/{room_id}.json"),
                RequestOptions::get().query(Query::new().field("includeUserData", "true")),
            )
            .await?
            .ok_or_else(|| ClientError::Lookup(format!("room {room_id} not found")))?;
        let room = body
            .get("room")
            .cloned()
            .ok_or_else(|| ClientError::Protocol("room response missing 'room' key".into()))?;
        Ok(serde_json::from_value(room)?)
    }

    pub async fn get_person(&self, person_id: i64) -> Result<PersonPayload> {
        let body = self
            .transport
            .request(&format!("chat/people/{person_id}.json"), RequestOptions::get())
            .await?
            .ok_or_else(|| ClientError::Lookup(format!("person {person_id} not found")))?;
        let person = body
            .get("person")
            .cloned()
            .ok_or_else(|| ClientError::Protocol("person response missing 'person' key".into()))?;
        Ok(serde_json::from_value(person)?)
    }

    pub async fn create_room_with_handles(
        &self,
        handles: &[String],
        first_message: Option<&str>,
    ) -> Result<RoomPayload> {
        let mut room_body = serde_json::json!({"handles": handles});
        if let Some(message) = first_message {
            room_body["message"] = serde_json::json!({"body": message});
        }
        let body = self
            .transport
            .request(
                "chat/v2/rooms.json",
                RequestOptions::get().method(Method::POST).body(serde_json::json!({"room": room_body})),
            )
            .await?
            .ok_or_else(|| ClientError::Protocol("room creation returned no body".into()))?;
        let room_id = body
            .pointer("/room/id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ClientError::Protocol("room creation response missing id".into()))?;
        self.get_room(room_id).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.transport
            .request(
                "launchpad/v1/logout.json",
                RequestOptions::get().method(Method::DELETE),
            )
            .await?;
        Ok(())
    }

    pub async fn update_handle(&self, person_id: i64, handle: &str) -> Result<PersonPayload> {
        self.transport
            .request(
                &format!("chat/people/{person_id}.json"),
                RequestOptions::get()
                    .method(Method::PUT)
                    .body(serde_json::json!({"person": {"handle": handle}})),
            )
            .await?;
        self.get_person(person_id).await
    }

    pub async fn update_room_title(&self, room_id: i64, title: &str) -> Result<()> {
        self.transport
            .request(
                &format!("chat/v2/conversations/{room_id}.json"),
                RequestOptions::get()
                    .method(Method::PUT)
                    .body(serde_json::json!({"conversation": {"title": title}})),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_room(&self, room_id: i64) -> Result<()> {
        self.transport
            .request(
                &format!("chat/rooms/{room_id}.json"),
                RequestOptions::get().method(Method::DELETE),
            )
            .await?;
        Ok(())
    }

    pub async fn get_room_messages(&self, room_id: i64) -> Result<Vec<MessagePayload>> {
        let body = self
            .transport
            .request(
                &format!("chat/v2/rooms/{room_id}/messages.json"),
                RequestOptions::get(),
            )
            .await?
            .unwrap_or(serde_json::Value::Null);
        let messages = body.get("messages").cloned().unwrap_or_default();
        Ok(serde_json::from_value(messages)?)
    }

    pub async fn post_room_message(&self, room_id: i64, body: &str) -> Result<MessagePayload> {
        let response = self
            .transport
            .request(
                &format!("chat/rooms/{room_id}/messages.json"),
                RequestOptions::get()
                    .method(Method::POST)
                    .body(serde_json::json!({"message": {"body": body}})),
            )
            .await?
            .ok_or_else(|| ClientError::Protocol("post message returned no body".into()))?;
        let message = response
            .get("message")
            .cloned()
            .ok_or_else(|| ClientError::Protocol("post message response missing 'message' key".into()))?;
        Ok(serde_json::from_value(message)?)
    }
}

/// Pull `tw-auth=<value>` out of a `Set-Cookie` header.
fn extract_tw_auth(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            cookie.split(';').next().and_then(|pair| {
                let (name, value) = pair.split_once('=')?;
                (name.trim() == "tw-auth").then(|| value.trim().to_string())
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_counts_default_to_zero_and_nil_conversations() {
        let counts = UnseenCounts::default();
        assert_eq!(counts.important_rooms, 0);
        assert!(counts.important_conversations.is_none());
    }

    #[test]
    fn list_filter_defaults_sort_to_last_activity() {
        let query = ListFilter::default().into_query();
        assert!(
            query
                .as_pairs()
                .contains(&("sort".to_string(), "lastActivityAt".to_string()))
        );
    }
}
