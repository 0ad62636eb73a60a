//! Session state and lookup order.
//!
//! Lookup order: durable store (bounded by a 3s deadline), then the
//! in-memory cache, then a fresh session built from the request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::llm_client::ChatMessage;
use crate::resilience::session_cache::SessionCache;
use crate::resilience::timeout::{run_with_timeout, spawn_detached};
use crate::store::SessionStore;

/// Oldest messages are dropped beyond this.
pub const MAX_HISTORY: usize = 20;
pub const STORE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for fire-and-forget store writes.
pub const STORE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const GUEST_NAME: &str = "Guest";

const PERSONA_ACK: &str = "Understood. I'll answer as the candidate's assistant, professionally and concisely.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_name: String,
    pub company: Option<String>,
    pub job_posting: Option<String>,
    pub history: Vec<ChatMessage>,
}

impl SessionRecord {
    pub fn new(
        id: impl Into<String>,
        user_name: impl Into<String>,
        company: Option<String>,
        job_posting: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_name: user_name.into(),
            company,
            job_posting,
            history: Vec::new(),
        }
    }

    /// Records one question/answer pair, keeping the last `MAX_HISTORY` messages.
    pub fn push_exchange(&mut self, query: &str, reply: &str) {
        self.history.push(ChatMessage::user(query));
        self.history.push(ChatMessage::model(reply));
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Full conversation for the provider: persona preamble, prior turns,
    /// then the new query.
    pub fn build_messages(&self, query: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 3);
        messages.push(ChatMessage::user(self.persona_prompt()));
        messages.push(ChatMessage::model(PERSONA_ACK));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(query));
        messages
    }

    fn persona_prompt(&self) -> String {
        let company = self.company.as_deref().unwrap_or("their company");
        let mut prompt = format!(
            "You are a career assistant answering questions about one candidate's professional \
             background. You are speaking with {} from {company}. Be accurate, specific, and brief.",
            self.user_name
        );
        if let Some(posting) = &self.job_posting {
            prompt.push_str("\n\nThe visitor is hiring for this role. Relate answers to it where relevant:\n");
            prompt.push_str(posting);
        }
        prompt
    }
}

/// Request-supplied values used when a session has to be created.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionDefaults<'a> {
    pub user_name: Option<&'a str>,
    pub company: Option<&'a str>,
    pub job_posting: Option<&'a str>,
}

/// Finds or creates the session for `id`. Never fails: a slow or broken
/// store falls through to memory.
pub async fn resolve_session(
    store: &Arc<dyn SessionStore>,
    cache: &SessionCache<SessionRecord>,
    id: &str,
    defaults: SessionDefaults<'_>,
) -> SessionRecord {
    if store.is_enabled() {
        let lookup_store = store.clone();
        let key = id.to_string();
        let durable = run_with_timeout("store.get_session", STORE_LOOKUP_TIMEOUT, None, async move {
            lookup_store.get_session(&key).await
        })
        .await;

        if let Some(stored) = durable {
            let activity_store = store.clone();
            let key = id.to_string();
            spawn_detached("store.update_activity", STORE_WRITE_TIMEOUT, async move {
                activity_store.update_activity(&key).await
            });

            // Durable identity wins; history only lives in memory.
            let mut record = cache.get(id).unwrap_or_else(|| {
                SessionRecord::new(id, "", None, defaults.job_posting.map(str::to_string))
            });
            record.user_name = stored.user_name;
            if stored.company.is_some() {
                record.company = stored.company;
            }
            cache.put(id, record.clone());
            debug!(session_id = id, "Session restored from durable store");
            return record;
        }
    }

    if let Some(record) = cache.get(id) {
        return record;
    }

    let record = SessionRecord::new(
        id,
        defaults.user_name.unwrap_or(GUEST_NAME),
        defaults.company.map(str::to_string),
        defaults.job_posting.map(str::to_string),
    );

    if store.is_enabled() {
        let create_store = store.clone();
        let (key, user_name, company) = (
            record.id.clone(),
            record.user_name.clone(),
            record.company.clone(),
        );
        spawn_detached("store.create_session", STORE_WRITE_TIMEOUT, async move {
            create_store
                .create_session(&key, &user_name, company.as_deref())
                .await
        });
    }

    info!(session_id = id, "Created new session");
    cache.put(id, record.clone());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::Role;
    use crate::store::testing::RecordingStore;
    use crate::store::DisabledStore;

    fn cache() -> SessionCache<SessionRecord> {
        SessionCache::new(Duration::from_secs(3600), 100)
    }

    fn defaults() -> SessionDefaults<'static> {
        SessionDefaults {
            user_name: Some("Grace"),
            company: Some("Initech"),
            job_posting: None,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut record = SessionRecord::new("s", "Ada", None, None);
        for i in 0..15 {
            record.push_exchange(&format!("q{i}"), &format!("a{i}"));
        }
        assert_eq!(record.history.len(), MAX_HISTORY);
        // 30 messages pushed, the first 10 (q0..q4 with answers) dropped.
        assert_eq!(record.history[0], ChatMessage::user("q5"));
        assert_eq!(record.history[19], ChatMessage::model("a14"));
    }

    #[test]
    fn test_build_messages_wraps_history() {
        let mut record = SessionRecord::new("s", "Ada", Some("Acme".to_string()), Some("Rust SRE".to_string()));
        record.push_exchange("hi", "hello");
        let messages = record.build_messages("what about Kubernetes?");

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].text.contains("Ada from Acme"));
        assert!(messages[0].text.contains("Rust SRE"));
        assert_eq!(messages[1].role, Role::Model);
        assert_eq!(messages[4], ChatMessage::user("what about Kubernetes?"));
    }

    #[tokio::test]
    async fn test_memory_only_creates_then_reuses() {
        let store: Arc<dyn SessionStore> = Arc::new(DisabledStore);
        let cache = cache();

        let first = resolve_session(&store, &cache, "s1", defaults()).await;
        assert_eq!(first.user_name, "Grace");
        assert_eq!(first.company.as_deref(), Some("Initech"));

        cache.update("s1", |r| r.push_exchange("q", "a"));
        let other_defaults = SessionDefaults {
            user_name: Some("Someone Else"),
            ..Default::default()
        };
        let second = resolve_session(&store, &cache, "s1", other_defaults).await;
        assert_eq!(second.user_name, "Grace");
        assert_eq!(second.history.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_name_defaults_to_guest() {
        let store: Arc<dyn SessionStore> = Arc::new(DisabledStore);
        let record = resolve_session(&store, &cache(), "s1", SessionDefaults::default()).await;
        assert_eq!(record.user_name, GUEST_NAME);
    }

    #[tokio::test]
    async fn test_durable_fields_override_cache_but_keep_history() {
        let recording = Arc::new(RecordingStore::with_session("s1", "Linus", Some("Transmeta")));
        let store: Arc<dyn SessionStore> = recording.clone();
        let cache = cache();
        let mut cached = SessionRecord::new("s1", "Guest", None, None);
        cached.push_exchange("q", "a");
        cache.put("s1", cached);

        let record = resolve_session(&store, &cache, "s1", defaults()).await;

        assert_eq!(record.user_name, "Linus");
        assert_eq!(record.company.as_deref(), Some("Transmeta"));
        assert_eq!(record.history.len(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*recording.activity.lock(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_session_is_created_in_store() {
        let recording = Arc::new(RecordingStore::default());
        let store: Arc<dyn SessionStore> = recording.clone();

        let record = resolve_session(&store, &cache(), "fresh", defaults()).await;
        assert_eq!(record.user_name, "Grace");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sessions = recording.sessions.lock();
        assert_eq!(sessions.get("fresh").map(|s| s.user_name.as_str()), Some("Grace"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_falls_back_to_cache_within_deadline() {
        let recording = Arc::new(RecordingStore {
            lookup_delay: Some(Duration::from_secs(30)),
            ..RecordingStore::with_session("s1", "From Store", None)
        });
        let store: Arc<dyn SessionStore> = recording;
        let cache = cache();
        cache.put("s1", SessionRecord::new("s1", "From Cache", None, None));

        let started = tokio::time::Instant::now();
        let record = resolve_session(&store, &cache, "s1", defaults()).await;

        assert_eq!(record.user_name, "From Cache");
        assert!(started.elapsed() < STORE_LOOKUP_TIMEOUT + Duration::from_millis(100));
    }
}
