//! Session Store (C9). Conversation-scoped stickiness
//! records over the KV surface (`session:<conv>`).

pub use crate::domain::Session;
use crate::kv::{keys, KvStore, KvStoreExt};
use std::sync::Arc;
use std::time::Duration;

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Session> {
        self.kv.get(&keys::session(conversation_id)).await.ok().flatten()
    }

    /// Creates or overwrites the binding for this conversation.
    pub async fn bind(&self, conversation_id: &str, logical_model: &str, provider_id: &str, model_id: &str) {
        let now = chrono::Utc::now();
        let session = Session {
            conversation_id: conversation_id.to_string(),
            logical_model: logical_model.to_string(),
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            created_at: now,
            last_accessed: now,
            message_count: 1,
        };
        let _ = self.kv.set(&keys::session(conversation_id), &session, Some(self.ttl)).await;
    }

    /// Updates `last_accessed`/`message_count` on an existing session, or
    /// is a no-op when none exists (the caller should `bind` first for new
    /// conversations).
    pub async fn touch(&self, conversation_id: &str) {
        if let Some(mut session) = self.get(conversation_id).await {
            session.last_accessed = chrono::Utc::now();
            session.message_count += 1;
            let _ = self.kv.set(&keys::session(conversation_id), &session, Some(self.ttl)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn bind_then_get_round_trips() {
        let store = SessionStore::new(InMemoryKv::new(), Duration::from_secs(3600));
        store.bind("c1", "gpt-4", "p1", "m1").await;
        let session = store.get("c1").await.unwrap();
        assert_eq!(session.provider_id, "p1");
        assert_eq!(session.message_count, 1);

        store.touch("c1").await;
        let session = store.get("c1").await.unwrap();
        assert_eq!(session.message_count, 2);
    }

    #[tokio::test]
    async fn missing_session_returns_none() {
        let store = SessionStore::new(InMemoryKv::new(), Duration::from_secs(3600));
        assert!(store.get("missing").await.is_none());
    }
}
