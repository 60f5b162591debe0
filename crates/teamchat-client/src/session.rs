//! The session orchestrator: owns the wire client and entity cache,
//! holds the current-user profile, arbitrates lookups, and runs the
//! reconnection loop.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use teamchat_protocol::{Credentials, Installation, RECONNECT_INTERVAL_SECS};
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use crate::{
    cache::{EntityCache, Message, Person, Room},
    error::{ClientError, Result},
    events::{Event, EventRouter, FrameResolver},
    wire::{ListFilter, UnseenCounts, WireClient},
};

/// Liveness bookkeeping for the connection's lifetime.
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    pub initial_connection_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub last_disconnect_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub downtime: std::time::Duration,
    pub disconnects: u64,
    pub reconnects: u64,
}

struct WireResolver(Arc<RwLock<WireClient>>);

#[async_trait::async_trait]
impl FrameResolver for WireResolver {
    async fn fetch_person(&self, id: i64) -> Option<teamchat_protocol::PersonPayload> {
        self.0.read().await.get_person(id).await.ok()
    }

    async fn fetch_room(&self, id: i64) -> Option<teamchat_protocol::RoomPayload> {
        self.0.read().await.get_room(id).await.ok()
    }
}

/// Owns one authenticated connection to the chat service, the entity
/// cache it keeps coherent, and the reconnect loop that survives
/// transient drops.
pub struct Session {
    wire: Arc<RwLock<WireClient>>,
    cache: Arc<EntityCache>,
    events: Arc<EventRouter>,
    monitor: RwLock<Monitor>,
    force_closed: AtomicBool,
}

impl Session {
    pub async fn connect(installation: Installation, credentials: Credentials) -> Result<Arc<Self>> {
        let wire = WireClient::from(installation, credentials).await?;
        let user_id = wire.user_id();

        let cache = Arc::new(EntityCache::new());
        cache.set_current_user(user_id).await;
        let person_payload = wire.get_person(user_id).await?;
        cache.save_person(&person_payload).await;

        let events = Arc::new(EventRouter::new(cache.clone()));
        let wire = Arc::new(RwLock::new(wire));

        let session = Arc::new(Self {
            wire,
            cache,
            events,
            monitor: RwLock::new(Monitor {
                initial_connection_timestamp: Some(chrono::Utc::now()),
                ..Monitor::default()
            }),
            force_closed: AtomicBool::new(false),
        });

        session.spawn_pump();
        session.events.emit(Event::Connected);
        Ok(session)
    }

    fn spawn_pump(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(session) = weak.upgrade() else { return };
            let rx = session.wire.read().await.socket().subscribe();
            Self::run_pump(weak, rx).await;
        });
    }

    async fn run_pump(session: Weak<Self>, mut rx: broadcast::Receiver<teamchat_protocol::Frame>) {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    let Some(session) = session.upgrade() else { return };
                    let resolver = WireResolver(session.wire.clone());
                    session.events.apply_frame(&frame, &resolver).await;
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event router lagged behind inbound frames");
                },
                Err(broadcast::error::RecvError::Closed) => {
                    let Some(session) = session.upgrade() else { return };
                    session.handle_disconnect().await;
                    return;
                },
            }
        }
    }

    async fn handle_disconnect(self: Arc<Self>) {
        if self.force_closed.load(Ordering::SeqCst) {
            return;
        }
        self.events.emit(Event::Disconnect);
        let disconnected_at = chrono::Utc::now();
        {
            let mut monitor = self.monitor.write().await;
            monitor.last_disconnect_timestamp = Some(disconnected_at);
            monitor.disconnects += 1;
        }

        loop {
            if self.force_closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_INTERVAL_SECS)).await;

            let reconnected = { self.wire.read().await.reconnect().await };
            match reconnected {
                Ok(new_wire) => {
                    *self.wire.write().await = new_wire;
                    let downtime = (chrono::Utc::now() - disconnected_at)
                        .to_std()
                        .unwrap_or_default();
                    {
                        let mut monitor = self.monitor.write().await;
                        monitor.downtime += downtime;
                        monitor.reconnects += 1;
                    }
                    self.catch_up().await;
                    self.spawn_pump();
                    self.events.emit(Event::Reconnect { downtime });
                    return;
                },
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed, retrying");
                },
            }
        }
    }

    /// Refresh people and rooms (with their recent messages) touched
    /// since the last disconnect, so the cache reflects anything missed
    /// while offline.
    async fn catch_up(&self) {
        let since = self.monitor.read().await.last_disconnect_timestamp;
        let wire = self.wire.read().await;

        let people_filter = ListFilter {
            since,
            ..ListFilter::default()
        };
        match wire.get_people(people_filter).await {
            Ok((people, _)) => {
                for person in people {
                    self.cache.save_person(&person).await;
                }
            },
            Err(e) => warn!(error = %e, "catch-up people fetch failed"),
        }

        let rooms_filter = ListFilter {
            since,
            include_messages: true,
            ..ListFilter::default()
        };
        match wire.get_rooms(rooms_filter).await {
            Ok((rooms, _)) => {
                for room in rooms {
                    self.cache.save_room(&room).await;
                }
                info!("catch-up fetch complete");
            },
            Err(e) => warn!(error = %e, "catch-up rooms fetch failed"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn monitor(&self) -> Monitor {
        self.monitor.read().await.clone()
    }

    /// The current `tw-auth` cookie value, for persistence into a
    /// credential cache (e.g. `.teamchatrc`).
    pub async fn auth_token(&self) -> String {
        self.wire.read().await.auth_token().await
    }

    pub fn get_person(&self, id: i64) -> Option<Arc<Person>> {
        self.cache.get_person(id)
    }

    pub fn get_person_by_handle(&self, handle: &str) -> Option<Arc<Person>> {
        self.cache.get_person_by_handle(handle)
    }

    pub fn get_all_people(&self) -> Vec<Arc<Person>> {
        self.cache.all_people()
    }

    pub async fn get_people(&self, filter: ListFilter) -> Result<Vec<Arc<Person>>> {
        let (people, _) = self.wire.read().await.get_people(filter).await?;
        let mut out = Vec::with_capacity(people.len());
        for payload in &people {
            out.push(self.cache.save_person(payload).await);
        }
        Ok(out)
    }

    pub fn get_room(&self, id: i64) -> Option<Arc<Room>> {
        self.cache.get_room(id)
    }

    pub async fn get_room_by_title(&self, title: &str) -> Option<Arc<Room>> {
        for room in self.cache.all_rooms() {
            if room.title().await.as_deref() == Some(title) {
                return Some(room);
            }
        }
        None
    }

    pub fn get_all_rooms(&self) -> Vec<Arc<Room>> {
        self.cache.all_rooms()
    }

    pub async fn get_rooms(&self, filter: ListFilter) -> Result<Vec<Arc<Room>>> {
        let (rooms, _) = self.wire.read().await.get_rooms(filter).await?;
        let mut out = Vec::with_capacity(rooms.len());
        for payload in &rooms {
            out.push(self.cache.save_room(payload).await);
        }
        Ok(out)
    }

    /// If `handles` resolves to a single other person, returns their pair
    /// room. Otherwise finds a locally-known room whose participants are
    /// a superset of `handles`, or creates an uninitialized one.
    pub async fn get_room_for_handles(&self, handles: &[String]) -> Result<Arc<Room>> {
        if handles.len() == 1
            && let Some(person) = self.cache.get_person_by_handle(&handles[0])
            && let Some(pair_room) = person.pair_room().await
        {
            return Ok(pair_room);
        }

        for room in self.cache.all_rooms() {
            let participant_handles: std::collections::HashSet<String> = {
                let mut set = std::collections::HashSet::new();
                for person in room.people().await {
                    set.insert(person.handle().await);
                }
                set
            };
            if handles.iter().all(|h| participant_handles.contains(h)) {
                return Ok(room);
            }
        }

        let mut people = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(person) = self.cache.get_person_by_handle(handle) {
                people.push(person);
                continue;
            }
            let payload = self.wire.read().await.get_person_by_handle(handle).await?;
            people.push(self.cache.save_person(&payload).await);
        }
        Ok(Room::uninitialized(people))
    }

    /// Creates a room server-side via `POST /chat/v2/rooms.json` and
    /// folds the result into the cache.
    pub async fn create_room_with_handles(
        &self,
        handles: &[String],
        first_message: Option<&str>,
    ) -> Result<Arc<Room>> {
        let payload = self
            .wire
            .read()
            .await
            .create_room_with_handles(handles, first_message)
            .await?;
        Ok(self.cache.save_room(&payload).await)
    }

    /// Sends a message in `room`. If the room is uninitialized (never
    /// realized server-side), this creates it first via the same path as
    /// [`Session::create_room_with_handles`].
    pub async fn send_room_message(&self, room: &Arc<Room>, body: &str) -> Result<Arc<Message>> {
        if let Some(room_id) = room.id().await {
            let payload = self.wire.read().await.send_message(room_id, body).await?;
            return Ok(self.cache.save_message(room, &payload).await);
        }

        let mut handles = Vec::new();
        for person in room.people().await {
            handles.push(person.handle().await);
        }
        let realized = self.create_room_with_handles(&handles, Some(body)).await?;
        let room_id = realized
            .id()
            .await
            .ok_or_else(|| ClientError::Protocol("realized room still has no id".into()))?;
        let messages = self.wire.read().await.get_room_messages(room_id).await?;
        let last = messages
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Protocol("newly created room has no messages".into()))?;
        Ok(self.cache.save_message(&realized, &last).await)
    }

    pub async fn set_room_typing(&self, room_id: i64, is_typing: bool) -> Result<()> {
        self.wire.read().await.set_typing(room_id, is_typing).await
    }

    pub async fn activate_room(&self, room_id: i64) -> Result<()> {
        self.wire.read().await.activate_room(room_id).await
    }

    pub async fn update_room_title(&self, room_id: i64, title: &str) -> Result<()> {
        self.wire.read().await.update_room_title(room_id, title).await
    }

    pub async fn delete_room(&self, room_id: i64) -> Result<()> {
        self.wire.read().await.delete_room(room_id).await?;
        self.cache.remove_room(room_id);
        Ok(())
    }

    pub async fn get_room_messages(&self, room_id: i64) -> Result<Vec<teamchat_protocol::MessagePayload>> {
        self.wire.read().await.get_room_messages(room_id).await
    }

    pub async fn send_person_message(&self, person: &Arc<Person>, body: &str) -> Result<Arc<Message>> {
        let room = self.get_room_for_handles(&[person.handle().await]).await?;
        self.send_room_message(&room, body).await
    }

    pub async fn update_handle(&self, new_handle: &str) -> Result<()> {
        let user_id = self
            .cache
            .current_user_id()
            .await
            .ok_or_else(|| ClientError::Contract("no current user set".into()))?;
        let payload = self.wire.read().await.update_handle(user_id, new_handle).await?;
        self.cache.save_person(&payload).await;
        Ok(())
    }

    pub async fn update_status(&self, status: &str) -> Result<()> {
        self.wire.read().await.update_status(status).await
    }

    pub async fn get_unseen_count(&self) -> Result<UnseenCounts> {
        self.wire.read().await.unseen_counts().await
    }

    /// Clears chat history up to and including `before_message_id`, or the
    /// room's most recent known message if omitted. Only legal for pair
    /// rooms.
    pub async fn clear_room_history(&self, room_id: i64, before_message_id: Option<i64>) -> Result<()> {
        let room = self
            .cache
            .get_room(room_id)
            .ok_or_else(|| ClientError::Lookup(format!("room {room_id} not found")))?;
        let most_recent_message_id = room.messages().await.last().map(|m| m.id);
        let target = resolve_clear_history_target(
            room.room_type().await.as_deref(),
            before_message_id,
            most_recent_message_id,
        )?;
        self.wire.read().await.clear_room_history(room_id, target).await
    }

    pub async fn get_updates(&self, since: chrono::DateTime<chrono::Utc>) -> Result<Vec<Arc<Room>>> {
        self.get_rooms(ListFilter {
            since: Some(since),
            ..ListFilter::default()
        })
        .await
    }

    /// Idempotent. Disables the reconnect loop and tears down the socket.
    pub async fn close(&self) {
        if self.force_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wire
            .read()
            .await
            .socket()
            .close("closed by caller")
            .await;
    }

    pub async fn logout(&self) -> Result<()> {
        self.close().await;
        self.wire.read().await.logout().await
    }
}

/// Resolves the `clear_room_history` target: an explicit `before_message_id`
/// wins, otherwise the room's most recent known message. Errors if the
/// room isn't a pair room, or if there's no message to default to.
fn resolve_clear_history_target(
    room_type: Option<&str>,
    before_message_id: Option<i64>,
    most_recent_message_id: Option<i64>,
) -> Result<i64> {
    if room_type != Some("pair") {
        return Err(ClientError::Contract(
            "clear_room_history is only legal for pair rooms".into(),
        ));
    }
    before_message_id.or(most_recent_message_id).ok_or_else(|| {
        ClientError::Contract(
            "clear_room_history has no explicit before_message_id and the room has no known messages to default to"
                .into(),
        )
    })
}

/// True if `message.body` mentions `person` by `@handle`.
pub async fn is_mentioned(message: &Message, person: &Person) -> bool {
    message.author_id != person.id
        && crate::events::mentions_handle(&message.body().await, &person.handle().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_starts_with_no_downtime() {
        let monitor = Monitor::default();
        assert_eq!(monitor.disconnects, 0);
        assert_eq!(monitor.reconnects, 0);
        assert_eq!(monitor.downtime, std::time::Duration::ZERO);
    }

    #[test]
    fn clear_history_rejects_non_pair_rooms() {
        let result = resolve_clear_history_target(Some("private"), None, Some(10));
        assert!(result.is_err());
    }

    #[test]
    fn clear_history_defaults_to_most_recent_message() {
        let target = resolve_clear_history_target(Some("pair"), None, Some(42)).expect("resolves");
        assert_eq!(target, 42);
    }

    #[test]
    fn clear_history_explicit_id_wins_over_default() {
        let target = resolve_clear_history_target(Some("pair"), Some(7), Some(42)).expect("resolves");
        assert_eq!(target, 7);
    }

    #[test]
    fn clear_history_errors_without_any_target_to_default_to() {
        let result = resolve_clear_history_target(Some("pair"), None, None);
        assert!(result.is_err());
    }
}
