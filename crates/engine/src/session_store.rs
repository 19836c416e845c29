//! Per-session in-memory cache of session info + message list, backed by
//! [`Storage`]: an `RwLock` over a `HashMap`, fast-path read then
//! write-lock slow path. Sessions are created directly rather than resolved
//! from inbound channel metadata, so there's no identity/channel-key
//! indirection here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use sa_domain::error::{Error, Result};

use crate::event_bus::{BusEvent, EventBus};
use crate::identifier::{Direction, Identifier, Kind};
use crate::message::{Message, SessionInfo};
use crate::storage::{Storage, StorageJsonExt};

struct SessionRecord {
    info: SessionInfo,
    messages: Vec<Message>,
}

/// Invariants upheld by this store (spec §4.G):
/// 1. at most one in-memory copy of each session record (the `RwLock<HashMap>`
///    below is that single copy);
/// 2. messages are kept in ascending-ID order (append-only, IDs are minted
///    ascending);
/// 3. all mutations go through these methods, never directly to `Storage`.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
    ids: Arc<Identifier>,
}

fn info_key(id: &str) -> String {
    format!("session/info/{id}")
}

fn message_key(session_id: &str, message_id: &str) -> String {
    format!("session/message/{session_id}/{message_id}")
}

fn share_key(share_id: &str) -> String {
    format!("share/{share_id}")
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, events: Arc<EventBus>, ids: Arc<Identifier>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage,
            events,
            ids,
        }
    }

    /// Reload every persisted session (and its messages) from storage. Called
    /// once at process start so a restart doesn't lose history.
    pub async fn load_all(&self) -> Result<()> {
        let keys = self.storage.list("session/info/").await?;
        for key in keys {
            let info: Option<SessionInfo> = self.storage.read_json(&key).await?;
            let Some(info) = info else { continue };
            let message_keys = self
                .storage
                .list(&format!("session/message/{}/", info.id))
                .await?;
            let mut messages = Vec::with_capacity(message_keys.len());
            for mkey in message_keys {
                if let Some(msg) = self.storage.read_json::<Message>(&mkey).await? {
                    messages.push(msg);
                }
            }
            messages.sort_by(|a, b| a.id.cmp(&b.id));
            self.sessions
                .write()
                .insert(info.id.clone(), SessionRecord { info, messages });
        }
        Ok(())
    }

    pub async fn create(&self, title: Option<String>) -> Result<SessionInfo> {
        let id = self.ids.next(Kind::Session, Direction::Descending);
        let now = Utc::now();
        let info = SessionInfo {
            id: id.clone(),
            title,
            share_id: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.write_json(&info_key(&id), &info).await?;
        self.sessions.write().insert(
            id.clone(),
            SessionRecord {
                info: info.clone(),
                messages: Vec::new(),
            },
        );
        self.publish_updated(&info);
        Ok(info)
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).map(|r| r.info.clone())
    }

    /// Newest-first, matching the descending session ID encoding.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> =
            self.sessions.read().values().map(|r| r.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn has_messages(&self, id: &str) -> bool {
        self.sessions
            .read()
            .get(id)
            .map(|r| !r.messages.is_empty())
            .unwrap_or(false)
    }

    pub fn get_messages(&self, id: &str) -> Result<Vec<Message>> {
        self.sessions
            .read()
            .get(id)
            .map(|r| r.messages.clone())
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    /// Append a brand-new message (persist + publish `message.created`).
    pub async fn append_message(&self, session_id: &str, message: Message) -> Result<()> {
        self.storage
            .write_json(&message_key(session_id, &message.id), &message)
            .await?;
        self.events.publish(BusEvent::new(
            "message.created",
            serde_json::json!({ "sessionID": session_id, "messageID": message.id, "role": message.role }),
        ));
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        record.messages.push(message);
        Ok(())
    }

    /// Re-persist an existing message (incremental streaming update or final
    /// completion) and publish the matching part/completed event.
    pub async fn save_message(&self, session_id: &str, message: &Message, completed: bool) -> Result<()> {
        self.storage
            .write_json(&message_key(session_id, &message.id), message)
            .await?;
        let topic = if completed {
            "message.completed"
        } else {
            "message.part.updated"
        };
        self.events.publish(BusEvent::new(
            topic,
            serde_json::json!({ "sessionID": session_id, "messageID": message.id }),
        ));
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            if let Some(slot) = record.messages.iter_mut().find(|m| m.id == message.id) {
                *slot = message.clone();
            } else {
                record.messages.push(message.clone());
            }
        }
        Ok(())
    }

    pub async fn set_title(&self, session_id: &str, title: String) -> Result<()> {
        self.update(session_id, |info| info.title = Some(title)).await
    }

    pub async fn share(&self, session_id: &str) -> Result<SessionInfo> {
        let share_id = self.ids.next(Kind::Share, Direction::Ascending);
        self.storage
            .write_json(
                &share_key(&share_id),
                &serde_json::json!({ "sessionID": session_id, "createdAt": Utc::now() }),
            )
            .await?;
        self.update(session_id, |info| info.share_id = Some(share_id.clone()))
            .await
    }

    pub async fn unshare(&self, session_id: &str) -> Result<SessionInfo> {
        self.update(session_id, |info| info.share_id = None).await
    }

    async fn update(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut SessionInfo),
    ) -> Result<SessionInfo> {
        let info = {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            mutate(&mut record.info);
            record.info.updated_at = Utc::now();
            record.info.clone()
        };
        self.storage.write_json(&info_key(session_id), &info).await?;
        self.publish_updated(&info);
        Ok(info)
    }

    /// Remove the session and every persisted message. "remove wins" over a
    /// concurrent `share`: this takes the write lock and drops the entry
    /// unconditionally (see DESIGN.md open-question decisions).
    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        let existed = self.sessions.write().remove(session_id).is_some();
        if !existed {
            return Ok(false);
        }
        self.storage.remove(&info_key(session_id)).await?;
        for key in self
            .storage
            .list(&format!("session/message/{session_id}/"))
            .await?
        {
            self.storage.remove(&key).await?;
        }
        self.events.publish(BusEvent::new(
            "session.removed",
            serde_json::json!({ "sessionID": session_id }),
        ));
        Ok(true)
    }

    fn publish_updated(&self, info: &SessionInfo) {
        self.events.publish(BusEvent::new(
            "session.updated",
            serde_json::to_value(info).unwrap_or_default(),
        ));
    }

    pub fn publish_idle(&self, session_id: &str) {
        self.events.publish(BusEvent::new(
            "session.idle",
            serde_json::json!({ "sessionID": session_id }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::storage::FsStorage;

    fn store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new(64));
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path(), events.clone()));
        (
            SessionStore::new(storage, events, Arc::new(Identifier::new())),
            dir,
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (store, _dir) = store();
        let info = store.create(None).await.unwrap();
        assert_eq!(store.get(&info.id).unwrap().id, info.id);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let (store, _dir) = store();
        let a = store.create(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let b = store.create(None).await.unwrap();
        let listed = store.list();
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[tokio::test]
    async fn append_message_keeps_ascending_order() {
        let (store, _dir) = store();
        let info = store.create(None).await.unwrap();
        let ids = Identifier::new();
        let m1 = Message::new(
            ids.next(Kind::Message, Direction::Ascending),
            info.id.clone(),
            Role::User,
            vec![],
        );
        let m2 = Message::new(
            ids.next(Kind::Message, Direction::Ascending),
            info.id.clone(),
            Role::Assistant,
            vec![],
        );
        store.append_message(&info.id, m1.clone()).await.unwrap();
        store.append_message(&info.id, m2.clone()).await.unwrap();
        let messages = store.get_messages(&info.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].id < messages[1].id);
    }

    #[tokio::test]
    async fn share_then_unshare_round_trip() {
        let (store, _dir) = store();
        let info = store.create(None).await.unwrap();
        let shared = store.share(&info.id).await.unwrap();
        assert!(shared.share_id.is_some());
        let unshared = store.unshare(&info.id).await.unwrap();
        assert!(unshared.share_id.is_none());
    }

    #[tokio::test]
    async fn remove_purges_session_and_messages() {
        let (store, _dir) = store();
        let info = store.create(None).await.unwrap();
        let ids = Identifier::new();
        let msg = Message::new(
            ids.next(Kind::Message, Direction::Ascending),
            info.id.clone(),
            Role::User,
            vec![],
        );
        store.append_message(&info.id, msg).await.unwrap();
        assert!(store.remove(&info.id).await.unwrap());
        assert!(store.get(&info.id).is_none());
        assert!(store.get_messages(&info.id).is_err());
    }

    #[tokio::test]
    async fn remove_missing_session_returns_false() {
        let (store, _dir) = store();
        assert!(!store.remove("ses_missing").await.unwrap());
    }

    #[tokio::test]
    async fn reload_from_storage_restores_sessions_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new(64));
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path(), events.clone()));
        let ids = Arc::new(Identifier::new());
        let info = {
            let store = SessionStore::new(storage.clone(), events.clone(), ids.clone());
            let info = store.create(Some("hello".into())).await.unwrap();
            let msg = Message::new(
                ids.next(Kind::Message, Direction::Ascending),
                info.id.clone(),
                Role::User,
                vec![],
            );
            store.append_message(&info.id, msg).await.unwrap();
            info
        };

        let reloaded = SessionStore::new(storage, events, ids);
        reloaded.load_all().await.unwrap();
        assert_eq!(reloaded.get(&info.id).unwrap().title.as_deref(), Some("hello"));
        assert_eq!(reloaded.get_messages(&info.id).unwrap().len(), 1);
    }
}
