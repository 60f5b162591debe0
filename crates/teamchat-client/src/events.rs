//! Applies inbound frames to the [`EntityCache`] and fans out the
//! resulting semantic events. See the frame → action table this module
//! is built from.

use std::sync::Arc;

use teamchat_protocol::{Frame, MessagePayload, PersonPayload, RoomPayload, frame_names};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{EntityCache, Message, Person, Room};

/// Fetches entities the cache doesn't yet know about. Implemented by the
/// wire client, which is the only thing in this crate allowed to make
/// REST calls.
#[async_trait::async_trait]
pub trait FrameResolver: Send + Sync {
    async fn fetch_person(&self, id: i64) -> Option<PersonPayload>;
    async fn fetch_room(&self, id: i64) -> Option<RoomPayload>;
}

/// Semantic events emitted as frames are applied to the cache. Subscribe
/// with [`EventRouter::subscribe`] for a combined, wildcard stream.
#[derive(Debug, Clone)]
pub enum Event {
    Message { room: Arc<Room>, message: Arc<Message> },
    MessageReceived { room: Arc<Room>, message: Arc<Message> },
    MessageMention { room: Arc<Room>, message: Arc<Message> },
    /// A room was fetched and cached on first reference — e.g. a push
    /// frame arrived for a room id the cache didn't already know.
    RoomNew(Arc<Room>),
    RoomUpdated(Arc<Room>),
    RoomDeleted(i64),
    RoomTyping { room_id: i64, contents: serde_json::Value },
    RoomPersonAdded { room: Arc<Room>, person_id: i64 },
    RoomPersonRemoved { room: Arc<Room>, person_id: i64 },
    PersonCreated(Arc<Person>),
    PersonUpdated(Arc<Person>),
    PersonDeleted(i64),
    UnseenCountsUpdated(serde_json::Value),
    Company(serde_json::Value),
    Connected,
    Disconnect,
    Reconnect { downtime: std::time::Duration },
}

/// Applies frames to the cache and broadcasts [`Event`]s.
pub struct EventRouter {
    cache: Arc<EntityCache>,
    tx: broadcast::Sender<Event>,
}

impl EventRouter {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { cache, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // No active subscribers is not an error — events fired before
        // the first `subscribe()` call are simply dropped.
        let _ = self.tx.send(event);
    }

    /// Apply one inbound frame, fetching any entity the cache doesn't
    /// already know about through `resolver`.
    pub async fn apply_frame(&self, frame: &Frame, resolver: &dyn FrameResolver) {
        match frame.name.as_str() {
            frame_names::ROOM_MESSAGE_CREATED => self.on_message_created(frame, resolver).await,
            frame_names::ROOM_MESSAGE_UPDATED => self.on_message_updated(frame).await,
            frame_names::ROOM_MESSAGES_DELETED => self.on_messages_redact(frame, "redacted").await,
            frame_names::ROOM_MESSAGES_DELETED_UNDONE => {
                self.on_messages_redact(frame, "active").await;
            },
            frame_names::ROOM_UPDATED => self.on_room_updated(frame, resolver).await,
            frame_names::ROOM_DELETED => self.on_room_deleted(frame),
            frame_names::ROOM_TYPING => self.on_room_typing(frame),
            frame_names::USER_MODIFIED => self.on_user_modified(frame).await,
            frame_names::USER_ADDED => self.on_person_pushed(frame, resolver, true).await,
            frame_names::USER_UPDATED => self.on_person_pushed(frame, resolver, false).await,
            frame_names::USER_DELETED => self.on_user_deleted(frame).await,
            frame_names::COMPANY_ADDED | frame_names::COMPANY_UPDATED | frame_names::COMPANY_DELETED => {
                self.emit(Event::Company(frame.contents.clone()));
            },
            frame_names::UNSEEN_COUNTS_UPDATED => {
                self.emit(Event::UnseenCountsUpdated(frame.contents.clone()));
            },
            frame_names::PING | frame_names::PONG => {
                // Resolved by the socket session's nonce-keyed waiters, not
                // the event router.
            },
            other => debug!(frame = other, "ignoring unknown frame"),
        }
    }

    async fn resolve_room(&self, id: i64, resolver: &dyn FrameResolver) -> Option<Arc<Room>> {
        if let Some(room) = self.cache.get_room(id) {
            return Some(room);
        }
        let payload = resolver.fetch_room(id).await?;
        let room = self.cache.save_room(&payload).await;
        self.emit(Event::RoomNew(room.clone()));
        Some(room)
    }

    async fn on_message_created(&self, frame: &Frame, resolver: &dyn FrameResolver) {
        let Some(room_id) = frame.contents.get("roomId").and_then(|v| v.as_i64()) else {
            warn!("room.message.created missing roomId");
            return;
        };
        let Some(raw) = frame.contents.get("message") else {
            warn!("room.message.created missing message");
            return;
        };
        let payload: MessagePayload = match serde_json::from_value(raw.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed message payload");
                return;
            },
        };

        let Some(room) = self.resolve_room(room_id, resolver).await else {
            warn!(room_id, "could not resolve room for inbound message");
            return;
        };
        let message = self.cache.save_message(&room, &payload).await;

        self.emit(Event::Message {
            room: room.clone(),
            message: message.clone(),
        });

        let current_user_id = self.cache.current_user_id().await;
        let authored_by_self = current_user_id == Some(payload.author_id);
        if !authored_by_self {
            self.emit(Event::MessageReceived {
                room: room.clone(),
                message: message.clone(),
            });
        }

        if !authored_by_self
            && let Some(current_user_id) = current_user_id
            && let Some(self_person) = self.cache.get_person(current_user_id)
            && mentions_handle(&message.body().await, &self_person.handle().await)
        {
            self.emit(Event::MessageMention { room, message });
        }
    }

    async fn on_message_updated(&self, frame: &Frame) {
        let Some(room_id) = frame.contents.get("roomId").and_then(|v| v.as_i64()) else {
            return;
        };
        let Some(room) = self.cache.get_room(room_id) else {
            return;
        };
        if let Some(raw) = frame.contents.get("message")
            && let Ok(payload) = serde_json::from_value::<MessagePayload>(raw.clone())
        {
            self.cache.save_message(&room, &payload).await;
        }
    }

    async fn on_messages_redact(&self, frame: &Frame, status: &str) {
        let Some(room_id) = frame.contents.get("roomId").and_then(|v| v.as_i64()) else {
            return;
        };
        let Some(room) = self.cache.get_room(room_id) else {
            return;
        };
        let ids: Vec<i64> = frame
            .contents
            .get("ids")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        self.cache.mark_messages(&room, &ids, status).await;
    }

    async fn on_room_updated(&self, frame: &Frame, resolver: &dyn FrameResolver) {
        let Some(room_id) = frame.contents.get("roomId").and_then(|v| v.as_i64()) else {
            return;
        };
        let Some(payload) = resolver.fetch_room(room_id).await else {
            warn!(room_id, "room.updated could not refresh room");
            return;
        };
        let previous_people: Vec<i64> = match self.cache.get_room(room_id) {
            Some(room) => room.people().await.iter().map(|p| p.id).collect(),
            None => Vec::new(),
        };

        let room = self.cache.save_room(&payload).await;
        let current_people: Vec<i64> = room.people().await.iter().map(|p| p.id).collect();

        for added in current_people.iter().filter(|id| !previous_people.contains(id)) {
            self.emit(Event::RoomPersonAdded {
                room: room.clone(),
                person_id: *added,
            });
        }
        for removed in previous_people.iter().filter(|id| !current_people.contains(id)) {
            self.emit(Event::RoomPersonRemoved {
                room: room.clone(),
                person_id: *removed,
            });
        }
        self.emit(Event::RoomUpdated(room));
    }

    fn on_room_deleted(&self, frame: &Frame) {
        let Some(room_id) = frame.contents.get("roomId").and_then(|v| v.as_i64()) else {
            return;
        };
        self.cache.remove_room(room_id);
        self.emit(Event::RoomDeleted(room_id));
    }

    fn on_room_typing(&self, frame: &Frame) {
        let Some(room_id) = frame.contents.get("roomId").and_then(|v| v.as_i64()) else {
            return;
        };
        self.emit(Event::RoomTyping {
            room_id,
            contents: frame.contents.clone(),
        });
    }

    async fn on_user_modified(&self, frame: &Frame) {
        let Some(user_id) = frame.contents.get("userId").and_then(|v| v.as_i64()) else {
            return;
        };
        let (Some(key), Some(value)) = (
            frame.contents.get("key").and_then(|v| v.as_str()),
            frame.contents.get("value"),
        ) else {
            return;
        };
        if let Some(person) = self.cache.apply_person_field(user_id, key, value).await {
            self.emit(Event::PersonUpdated(person));
        }
    }

    async fn on_person_pushed(&self, frame: &Frame, resolver: &dyn FrameResolver, created: bool) {
        let Some(user_id) = frame.contents.get("userId").and_then(|v| v.as_i64()) else {
            return;
        };
        let Some(payload) = resolver.fetch_person(user_id).await else {
            warn!(user_id, "could not fetch person for push frame");
            return;
        };
        let person = self.cache.save_person(&payload).await;
        if created {
            self.emit(Event::PersonCreated(person));
        } else {
            self.emit(Event::PersonUpdated(person));
        }
    }

    async fn on_user_deleted(&self, frame: &Frame) {
        let Some(user_id) = frame.contents.get("userId").and_then(|v| v.as_i64()) else {
            return;
        };
        self.cache.remove_person(user_id).await;
        self.emit(Event::PersonDeleted(user_id));
    }
}

/// True iff `body` contains `@handle` as a whole word — the `@` is not
/// itself part of a longer token, and the handle isn't a prefix of a
/// longer one (`@selfish` does not mention `@self`).
pub(crate) fn mentions_handle(body: &str, handle: &str) -> bool {
    let needle = format!("@{handle}");
    let mut search_from = 0;
    while let Some(offset) = body[search_from..].find(&needle) {
        let start = search_from + offset;
        let before_ok = body[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        let end = start + needle.len();
        let after_ok = body[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        if before_ok && after_ok {
            return true;
        }
        search_from = end;
    }
    false
}

#[cfg(test)]
mod tests {
    use teamchat_protocol::{Frame, NonceCounter};

    use super::*;

    struct StubResolver {
        person: Option<PersonPayload>,
        room: Option<RoomPayload>,
    }

    #[async_trait::async_trait]
    impl FrameResolver for StubResolver {
        async fn fetch_person(&self, _id: i64) -> Option<PersonPayload> {
            self.person.clone()
        }

        async fn fetch_room(&self, _id: i64) -> Option<RoomPayload> {
            self.room.clone()
        }
    }

    fn person_payload(id: i64, handle: &str) -> PersonPayload {
        PersonPayload {
            id,
            handle: handle.into(),
            first_name: None,
            last_name: None,
            email: None,
            title: None,
            status: None,
            last_activity_at: None,
            pair_room_id: None,
            company: None,
        }
    }

    #[tokio::test]
    async fn message_created_emits_message_and_received() {
        let cache = Arc::new(EntityCache::new());
        cache.set_current_user(1).await;
        cache.save_person(&person_payload(1, "self")).await;
        cache
            .save_room(&teamchat_protocol::RoomPayload {
                id: Some(5),
                room_type: Some("private".into()),
                title: None,
                status: None,
                creator_id: None,
                created_at: None,
                updated_at: None,
                last_activity_at: None,
                last_viewed_at: None,
                people: vec![],
                messages: vec![],
                unread_count: 0,
                important_unread_count: 0,
            })
            .await;

        let router = EventRouter::new(cache);
        let mut events = router.subscribe();

        let nonce = NonceCounter::new();
        let frame = Frame::new(
            frame_names::ROOM_MESSAGE_CREATED,
            serde_json::json!({
                "roomId": 5,
                "message": {
                    "id": 100,
                    "roomId": 5,
                    "userId": 2,
                    "body": "hey @self check this out",
                    "createdAt": "2026-01-01T00:00:00Z",
                },
            }),
            Some(&nonce),
        );

        let resolver = StubResolver { person: None, room: None };
        router.apply_frame(&frame, &resolver).await;

        let mut saw_message = false;
        let mut saw_mention = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::Message { .. } => saw_message = true,
                Event::MessageMention { .. } => saw_mention = true,
                _ => {},
            }
        }
        assert!(saw_message);
        assert!(saw_mention);
    }

    #[test]
    fn mention_requires_a_word_boundary() {
        assert!(mentions_handle("hey @self check this", "self"));
        assert!(!mentions_handle("hey @selfish check this", "self"));
        assert!(!mentions_handle("no mention here", "self"));
        assert!(mentions_handle("@self", "self"));
    }

    #[tokio::test]
    async fn unknown_room_is_fetched_before_message_apply() {
        let cache = Arc::new(EntityCache::new());
        cache.set_current_user(1).await;
        cache.save_person(&person_payload(1, "self")).await;

        let router = EventRouter::new(cache.clone());
        let nonce = NonceCounter::new();
        let frame = Frame::new(
            frame_names::ROOM_MESSAGE_CREATED,
            serde_json::json!({
                "roomId": 42,
                "message": {
                    "id": 1,
                    "roomId": 42,
                    "userId": 1,
                    "body": "hi",
                    "createdAt": "2026-01-01T00:00:00Z",
                },
            }),
            Some(&nonce),
        );

        let resolver = StubResolver {
            person: None,
            room: Some(teamchat_protocol::RoomPayload {
                id: Some(42),
                room_type: Some("private".into()),
                title: None,
                status: None,
                creator_id: None,
                created_at: None,
                updated_at: None,
                last_activity_at: None,
                last_viewed_at: None,
                people: vec![],
                messages: vec![],
                unread_count: 0,
                important_unread_count: 0,
            }),
        };
        let mut events = router.subscribe();
        router.apply_frame(&frame, &resolver).await;

        let room = cache.get_room(42).expect("room fetched and cached");
        assert_eq!(room.messages().await.len(), 1);

        let mut saw_room_new = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::RoomNew(_)) {
                saw_room_new = true;
            }
        }
        assert!(saw_room_new, "first reference to an unknown room emits RoomNew");
    }
}
