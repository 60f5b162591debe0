//! The entity cache: People, Rooms, and Messages, kept as long-lived
//! shared objects so that references handed out to callers stay valid
//! across updates (`savePerson`/`saveRoom` mutate in place, they never
//! replace the cached object's identity).

use std::{collections::VecDeque, sync::Arc};

use dashmap::DashMap;
use teamchat_protocol::{MESSAGE_HISTORY_LIMIT, MessagePayload, PersonPayload, RoomPayload};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct PersonFields {
    handle: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    title: Option<String>,
    status: Option<String>,
    last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
    company: Option<serde_json::Value>,
}

impl From<&PersonPayload> for PersonFields {
    fn from(p: &PersonPayload) -> Self {
        Self {
            handle: p.handle.clone(),
            first_name: p.first_name.clone(),
            last_name: p.last_name.clone(),
            email: p.email.clone(),
            title: p.title.clone(),
            status: p.status.clone(),
            last_activity_at: p.last_activity_at,
            company: p.company.clone(),
        }
    }
}

/// A person in the directory. Cheap to hold onto: identity (`id`) never
/// changes, mutable fields live behind a lock so updates are visible to
/// every holder of the `Arc`.
#[derive(Debug)]
pub struct Person {
    pub id: i64,
    fields: RwLock<PersonFields>,
    pair_room: RwLock<Option<Arc<Room>>>,
}

impl Person {
    fn new(payload: &PersonPayload) -> Arc<Self> {
        Arc::new(Self {
            id: payload.id,
            fields: RwLock::new(PersonFields::from(payload)),
            pair_room: RwLock::new(None),
        })
    }

    pub async fn handle(&self) -> String {
        self.fields.read().await.handle.clone()
    }

    pub async fn status(&self) -> Option<String> {
        self.fields.read().await.status.clone()
    }

    pub async fn pair_room(&self) -> Option<Arc<Room>> {
        self.pair_room.read().await.clone()
    }

    /// Returns the previous handle if it changed, so the cache can fix
    /// up its handle index.
    async fn apply(&self, payload: &PersonPayload) -> Option<String> {
        let mut fields = self.fields.write().await;
        let previous_handle = (fields.handle != payload.handle).then(|| fields.handle.clone());
        *fields = PersonFields::from(payload);
        previous_handle
    }

    async fn set_pair_room(&self, room: Arc<Room>) {
        *self.pair_room.write().await = Some(room);
    }

    /// Apply a single `key → value` patch, as carried by `user.modified`.
    /// Returns the previous handle if `key == "handle"` and it changed.
    pub(crate) async fn apply_field(&self, key: &str, value: &serde_json::Value) -> Option<String> {
        let mut fields = self.fields.write().await;
        match key {
            "handle" => {
                let new_handle = value.as_str()?.to_string();
                let previous = (fields.handle != new_handle).then(|| fields.handle.clone());
                fields.handle = new_handle;
                return previous;
            },
            "firstName" => fields.first_name = value.as_str().map(str::to_string),
            "lastName" => fields.last_name = value.as_str().map(str::to_string),
            "email" => fields.email = value.as_str().map(str::to_string),
            "title" => fields.title = value.as_str().map(str::to_string),
            "status" => fields.status = value.as_str().map(str::to_string),
            _ => {},
        }
        None
    }
}

#[derive(Debug, Clone)]
struct RoomFields {
    room_type: Option<String>,
    title: Option<String>,
    status: Option<String>,
    creator_id: Option<i64>,
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
    last_viewed_at: Option<chrono::DateTime<chrono::Utc>>,
    unread_count: u32,
    important_unread_count: u32,
}

impl From<&RoomPayload> for RoomFields {
    fn from(r: &RoomPayload) -> Self {
        Self {
            room_type: r.room_type.clone(),
            title: r.title.clone(),
            status: r.status.clone(),
            creator_id: r.creator_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
            last_activity_at: r.last_activity_at,
            last_viewed_at: r.last_viewed_at,
            unread_count: r.unread_count,
            important_unread_count: r.important_unread_count,
        }
    }
}

/// A room. "Initialized" iff `id` is set — an uninitialized room is a
/// locally-constructed conversation that hasn't been realized server-side
/// yet (see `Session::get_room_for_handles`).
#[derive(Debug)]
pub struct Room {
    id: RwLock<Option<i64>>,
    fields: RwLock<RoomFields>,
    people: RwLock<Vec<Arc<Person>>>,
    messages: RwLock<VecDeque<Arc<Message>>>,
}

impl Room {
    /// A locally-constructed, not-yet-realized room (no server id).
    pub(crate) fn uninitialized(people: Vec<Arc<Person>>) -> Arc<Self> {
        Arc::new(Self {
            id: RwLock::new(None),
            fields: RwLock::new(RoomFields {
                room_type: Some("pair".into()),
                title: None,
                status: None,
                creator_id: None,
                created_at: None,
                updated_at: None,
                last_activity_at: None,
                last_viewed_at: None,
                unread_count: 0,
                important_unread_count: 0,
            }),
            people: RwLock::new(people),
            messages: RwLock::new(VecDeque::new()),
        })
    }

    pub async fn id(&self) -> Option<i64> {
        *self.id.read().await
    }

    pub async fn title(&self) -> Option<String> {
        self.fields.read().await.title.clone()
    }

    pub async fn room_type(&self) -> Option<String> {
        self.fields.read().await.room_type.clone()
    }

    pub async fn people(&self) -> Vec<Arc<Person>> {
        self.people.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<Arc<Message>> {
        self.messages.read().await.iter().cloned().collect()
    }

    /// Merge a payload into this room, returning the ids of people added
    /// and removed relative to the previous participant set.
    async fn apply(&self, payload: &RoomPayload, people: Vec<Arc<Person>>) -> (Vec<i64>, Vec<i64>) {
        *self.id.write().await = payload.id.or(*self.id.read().await);
        *self.fields.write().await = RoomFields::from(payload);

        let mut current = self.people.write().await;
        let previous_ids: std::collections::HashSet<i64> = current.iter().map(|p| p.id).collect();
        let incoming_ids: std::collections::HashSet<i64> = people.iter().map(|p| p.id).collect();

        let added: Vec<i64> = incoming_ids.difference(&previous_ids).copied().collect();
        let removed: Vec<i64> = previous_ids.difference(&incoming_ids).copied().collect();
        *current = people;

        (added, removed)
    }

    async fn add_message(&self, message: Arc<Message>) {
        let mut messages = self.messages.write().await;
        if let Some(existing) = messages.iter().position(|m| m.id == message.id) {
            messages[existing] = message;
            return;
        }
        messages.push_back(message);
        while messages.len() > MESSAGE_HISTORY_LIMIT {
            messages.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
struct MessageFields {
    body: String,
    created_at: chrono::DateTime<chrono::Utc>,
    edited_at: Option<chrono::DateTime<chrono::Utc>>,
    status: String,
}

/// A chat message. Identity is `id`; `status` flips to `"redacted"` on
/// delete and back to `"active"` on undo, never actually removed from
/// its room's history.
#[derive(Debug)]
pub struct Message {
    pub id: i64,
    pub room_id: i64,
    pub author_id: i64,
    fields: RwLock<MessageFields>,
}

impl Message {
    fn new(payload: &MessagePayload) -> Arc<Self> {
        Arc::new(Self {
            id: payload.id,
            room_id: payload.room_id,
            author_id: payload.author_id,
            fields: RwLock::new(MessageFields {
                body: payload.body.clone(),
                created_at: payload.created_at,
                edited_at: payload.edited_at,
                status: payload.status.clone().unwrap_or_else(|| "active".into()),
            }),
        })
    }

    pub async fn body(&self) -> String {
        self.fields.read().await.body.clone()
    }

    pub async fn status(&self) -> String {
        self.fields.read().await.status.clone()
    }

    async fn set_status(&self, status: impl Into<String>) {
        self.fields.write().await.status = status.into();
    }
}

/// Whether `people` is a "room with self": every participant is the
/// current user (duplicates allowed), which makes pair-aliasing invalid.
fn is_room_with_self(people: &[Arc<Person>], current_user_id: i64) -> bool {
    !people.is_empty() && people.iter().all(|p| p.id == current_user_id)
}

/// People, Rooms, and Messages, the single source of truth for entity
/// identity. All mutation goes through [`EntityCache::save_person`] and
/// [`EntityCache::save_room`].
#[derive(Default)]
pub struct EntityCache {
    people: DashMap<i64, Arc<Person>>,
    handles: DashMap<String, i64>,
    rooms: DashMap<i64, Arc<Room>>,
    current_user_id: RwLock<Option<i64>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_current_user(&self, id: i64) {
        *self.current_user_id.write().await = Some(id);
    }

    pub async fn current_user_id(&self) -> Option<i64> {
        *self.current_user_id.read().await
    }

    pub fn get_person(&self, id: i64) -> Option<Arc<Person>> {
        self.people.get(&id).map(|entry| entry.clone())
    }

    pub fn get_person_by_handle(&self, handle: &str) -> Option<Arc<Person>> {
        self.handles.get(handle).and_then(|id| self.get_person(*id))
    }

    pub fn get_room(&self, id: i64) -> Option<Arc<Room>> {
        self.rooms.get(&id).map(|entry| entry.clone())
    }

    pub fn all_people(&self) -> Vec<Arc<Person>> {
        self.people.iter().map(|entry| entry.clone()).collect()
    }

    pub fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|entry| entry.clone()).collect()
    }

    /// Apply a `user.modified` single-field patch to an already-cached
    /// Person. No-op if the person isn't known yet.
    pub async fn apply_person_field(&self, id: i64, key: &str, value: &serde_json::Value) -> Option<Arc<Person>> {
        let person = self.get_person(id)?;
        if let Some(old_handle) = person.apply_field(key, value).await {
            self.handles.remove(&old_handle);
            self.handles.insert(person.handle().await, person.id);
        }
        Some(person)
    }

    /// Insert or update a Person. Never replaces the cached object's
    /// identity — callers holding an `Arc<Person>` observe the update.
    pub async fn save_person(&self, payload: &PersonPayload) -> Arc<Person> {
        if let Some(existing) = self.get_person(payload.id) {
            if let Some(old_handle) = existing.apply(payload).await {
                self.handles.remove(&old_handle);
            }
            self.handles.insert(payload.handle.clone(), payload.id);
            return existing;
        }

        let person = Person::new(payload);
        self.people.insert(person.id, person.clone());
        self.handles.insert(payload.handle.clone(), person.id);

        let pair_room = Room::uninitialized(vec![person.clone()]);
        person.set_pair_room(pair_room).await;

        person
    }

    /// Insert or update a Room, resolving its `people` payloads through
    /// [`EntityCache::save_person`] first. Applies the pair-room aliasing
    /// rule: a genuine `{self, other}` pair never becomes a second Room
    /// object, it's merged into `other.pairRoom`.
    pub async fn save_room(&self, payload: &RoomPayload) -> Arc<Room> {
        let mut people = Vec::with_capacity(payload.people.len());
        for raw in &payload.people {
            people.push(self.save_person(raw).await);
        }

        if let Some(id) = payload.id
            && let Some(existing) = self.get_room(id)
        {
            existing.apply(payload, people).await;
            for message in &payload.messages {
                self.save_message(&existing, message).await;
            }
            return existing;
        }

        let current_user_id = self.current_user_id().await;
        if payload.room_type.as_deref() == Some("pair")
            && let Some(current_user_id) = current_user_id
            && !is_room_with_self(&people, current_user_id)
        {
            let other = people.iter().find(|p| p.id != current_user_id).cloned();
            if let Some(other) = other {
                let pair_room = other.pair_room().await.unwrap_or_else(|| {
                    Room::uninitialized(people.clone())
                });
                pair_room.apply(payload, people).await;
                other.set_pair_room(pair_room.clone()).await;
                if let Some(id) = payload.id {
                    self.rooms.insert(id, pair_room.clone());
                }
                for message in &payload.messages {
                    self.save_message(&pair_room, message).await;
                }
                return pair_room;
            }
        }

        let room = Room::uninitialized(people.clone());
        room.apply(payload, people).await;
        if let Some(id) = payload.id {
            self.rooms.insert(id, room.clone());
        }
        for message in &payload.messages {
            self.save_message(&room, message).await;
        }
        room
    }

    pub async fn remove_person(&self, id: i64) -> Option<Arc<Person>> {
        let (_, person) = self.people.remove(&id)?;
        let handle = person.handle().await;
        self.handles.remove(&handle);
        Some(person)
    }

    pub fn remove_room(&self, id: i64) -> Option<Arc<Room>> {
        self.rooms.remove(&id).map(|(_, room)| room)
    }

    /// Ingest a message push, resolving its room (caller fetches an
    /// unknown room before calling this) and returning the stored
    /// `Arc<Message>`.
    pub async fn save_message(&self, room: &Arc<Room>, payload: &MessagePayload) -> Arc<Message> {
        let message = Message::new(payload);
        room.add_message(message.clone()).await;
        message
    }

    pub async fn mark_messages(&self, room: &Arc<Room>, ids: &[i64], status: &str) {
        for message in room.messages().await {
            if ids.contains(&message.id) {
                message.set_status(status).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn room_payload(id: Option<i64>, room_type: &str, people: Vec<PersonPayload>) -> RoomPayload {
        RoomPayload {
            id,
            room_type: Some(room_type.into()),
            title: None,
            status: None,
            creator_id: None,
            created_at: None,
            updated_at: None,
            last_activity_at: None,
            last_viewed_at: None,
            people,
            messages: Vec::new(),
            unread_count: 0,
            important_unread_count: 0,
        }
    }

    #[tokio::test]
    async fn save_person_preserves_identity_across_updates() {
        let cache = EntityCache::new();
        let first = cache.save_person(&person_payload(1, "peter")).await;
        let mut updated = person_payload(1, "peter");
        updated.title = Some("Engineer".into());
        let second = cache.save_person(&updated).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.handle().await, "peter");
    }

    #[tokio::test]
    async fn save_person_reindexes_on_handle_change() {
        let cache = EntityCache::new();
        cache.save_person(&person_payload(1, "peter")).await;
        let mut renamed = person_payload(1, "pete");
        renamed.handle = "pete".into();
        cache.save_person(&renamed).await;

        assert!(cache.get_person_by_handle("peter").is_none());
        assert!(cache.get_person_by_handle("pete").is_some());
    }

    #[tokio::test]
    async fn pair_room_is_aliased_to_persons_pair_room() {
        let cache = EntityCache::new();
        cache.set_current_user(1).await;
        cache.save_person(&person_payload(1, "self")).await;
        let peter = cache.save_person(&person_payload(2, "peter")).await;

        let room = cache
            .save_room(&room_payload(
                Some(5),
                "pair",
                vec![person_payload(1, "self"), person_payload(2, "peter")],
            ))
            .await;

        let pair_room = peter.pair_room().await.expect("pair room set");
        assert!(Arc::ptr_eq(&room, &pair_room));
        assert_eq!(cache.get_room(5).expect("registered by id").id().await, Some(5));
    }

    #[tokio::test]
    async fn reingesting_pair_room_does_not_duplicate() {
        let cache = EntityCache::new();
        cache.set_current_user(1).await;
        cache.save_person(&person_payload(1, "self")).await;
        cache.save_person(&person_payload(2, "peter")).await;

        let payload = room_payload(
            Some(5),
            "pair",
            vec![person_payload(1, "self"), person_payload(2, "peter")],
        );
        let first = cache.save_room(&payload).await;
        let second = cache.save_room(&payload).await;

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn room_with_self_is_not_aliased() {
        let cache = EntityCache::new();
        cache.set_current_user(1).await;
        cache.save_person(&person_payload(1, "self")).await;

        let room = cache
            .save_room(&room_payload(
                Some(9),
                "pair",
                vec![person_payload(1, "self"), person_payload(1, "self")],
            ))
            .await;

        assert_eq!(room.id().await, Some(9));
    }

    #[tokio::test]
    async fn message_history_is_bounded_fifo() {
        let cache = EntityCache::new();
        let room = cache
            .save_room(&room_payload(Some(1), "private", vec![]))
            .await;

        for i in 0..(MESSAGE_HISTORY_LIMIT as i64 + 10) {
            let payload = MessagePayload {
                id: i,
                room_id: 1,
                author_id: 1,
                body: format!("message {i}"),
                created_at: chrono::Utc::now(),
                edited_at: None,
                status: None,
                file: None,
                third_party_cards: None,
                is_user_active: None,
            };
            cache.save_message(&room, &payload).await;
        }

        let messages = room.messages().await;
        assert_eq!(messages.len(), MESSAGE_HISTORY_LIMIT);
        assert_eq!(messages.first().expect("oldest retained").id, 10);
    }
}
