//! Durable session store.
//!
//! Optional: the gateway runs memory-only when no database is configured or
//! it is unreachable at startup. Callers bound every call with the timeout
//! guard, and writes are fire-and-forget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;

pub mod postgres;

pub use postgres::PgSessionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct StoredSession {
    pub id: String,
    pub user_name: String,
    pub company: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    Chat,
    ChatStream,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::Chat => "chat",
            EventKind::ChatStream => "chat_stream",
        }
    }
}

/// One analytics row. Counters are absent when the event has none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub session_id: String,
    pub kind: EventKind,
    pub intent: Option<String>,
    pub tokens_in: Option<i32>,
    pub tokens_out: Option<i32>,
    pub latency_ms: Option<i64>,
    pub metadata: serde_json::Value,
}

impl EventRecord {
    pub fn new(session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            intent: None,
            tokens_in: None,
            tokens_out: None,
            latency_ms: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// False for the memory-only store; lookups are skipped entirely.
    fn is_enabled(&self) -> bool;

    async fn get_session(&self, id: &str) -> Result<Option<StoredSession>, StoreError>;

    async fn create_session(
        &self,
        id: &str,
        user_name: &str,
        company: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn update_activity(&self, id: &str) -> Result<(), StoreError>;

    async fn log_event(&self, event: &EventRecord) -> Result<(), StoreError>;
}

/// Memory-only mode. Reads find nothing, writes succeed without effect.
pub struct DisabledStore;

#[async_trait]
impl SessionStore for DisabledStore {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn get_session(&self, _id: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(None)
    }

    async fn create_session(
        &self,
        _id: &str,
        _user_name: &str,
        _company: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_activity(&self, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn log_event(&self, _event: &EventRecord) -> Result<(), StoreError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_store_is_inert() {
        let store = DisabledStore;
        assert!(!store.is_enabled());
        assert!(store.get_session("abc").await.unwrap().is_none());
        store.create_session("abc", "Ada", None).await.unwrap();
        assert!(store.get_session("abc").await.unwrap().is_none());
        store
            .log_event(&EventRecord::new("abc", EventKind::Chat))
            .await
            .unwrap();
    }

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::ChatStream.as_str(), "chat_stream");
        assert_eq!(
            serde_json::to_value(EventKind::SessionStart).unwrap(),
            serde_json::json!("session_start")
        );
    }

    #[test]
    fn test_new_event_has_empty_metadata_object() {
        let event = EventRecord::new("s1", EventKind::SessionStart);
        assert!(event.metadata.as_object().unwrap().is_empty());
        assert!(event.tokens_in.is_none());
    }
}
