//! Wire protocol definitions for the team-chat WebSocket and REST APIs.
//!
//! All socket traffic is JSON frames (see [`Frame`]); inbound frames are
//! matched against pending waiters with a [`Filter`]. REST responses and
//! push-frame contents deserialize into the DTOs in [`wire`].

pub mod frame;
pub mod wire;

pub use {
    frame::{Filter, Frame, FrameSource, NonceCounter, is_subset},
    wire::{
        API_KEY_PASSWORD, AuthenticationError, AuthenticationResponse, Credentials, Installation,
        MessagePayload, PRODUCTION_SOCKET_URL, PersonPayload, RoomPayload, resolve_socket_url,
    },
};

/// Heartbeat parameters (§4.3).
pub const PING_INTERVAL_SECS: u64 = 10;
pub const PING_TIMEOUT_SECS: u64 = 3;
pub const PING_MAX_ATTEMPT: u32 = 3;

/// Default timeout for an individual `awaitFrame`/`socketRequest` call.
pub const AWAIT_FRAME_TIMEOUT_SECS: u64 = 30;

/// Constant reconnect back-off interval used by the session orchestrator.
pub const RECONNECT_INTERVAL_SECS: u64 = 3;

/// Maximum number of messages retained per room.
pub const MESSAGE_HISTORY_LIMIT: usize = 50;

/// Frame names known to the client, both inbound and outbound.
pub mod frame_names {
    pub const AUTHENTICATION_REQUEST: &str = "authentication.request";
    pub const AUTHENTICATION_RESPONSE: &str = "authentication.response";
    pub const AUTHENTICATION_CONFIRMATION: &str = "authentication.confirmation";
    pub const AUTHENTICATION_ERROR: &str = "authentication.error";

    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    pub const ROOM_MESSAGE_CREATED: &str = "room.message.created";
    pub const ROOM_MESSAGE_UPDATED: &str = "room.message.updated";
    pub const ROOM_MESSAGES_DELETED: &str = "room.messages.deleted";
    pub const ROOM_MESSAGES_DELETED_UNDONE: &str = "room.messages.deleted-undone";
    pub const ROOM_UPDATED: &str = "room.updated";
    pub const ROOM_DELETED: &str = "room.deleted";
    pub const ROOM_TYPING: &str = "room.typing";
    pub const ROOM_USER_ACTIVE: &str = "room.user.active";

    pub const USER_MODIFIED: &str = "user.modified";
    pub const USER_MODIFIED_STATUS: &str = "user.modified.status";
    pub const USER_ADDED: &str = "user.added";
    pub const USER_UPDATED: &str = "user.updated";
    pub const USER_DELETED: &str = "user.deleted";

    pub const COMPANY_ADDED: &str = "company.added";
    pub const COMPANY_UPDATED: &str = "company.updated";
    pub const COMPANY_DELETED: &str = "company.deleted";

    pub const UNSEEN_COUNTS_REQUEST: &str = "unseen.counts.request";
    pub const UNSEEN_COUNTS_UPDATED: &str = "unseen.counts.updated";
}
