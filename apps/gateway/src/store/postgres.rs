use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::store::{EventRecord, SessionStore, StoreError, StoredSession};

/// PostgreSQL-backed sessions and analytics events.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn get_session(&self, id: &str) -> Result<Option<StoredSession>, StoreError> {
        let row = sqlx::query_as::<_, StoredSession>(
            r#"
            SELECT id, user_name, company, created_at, last_active
            FROM sessions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_session(
        &self,
        id: &str,
        user_name: &str,
        company: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_name, company)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(user_name)
        .bind(company)
        .execute(&self.pool)
        .await?;

        info!(session_id = id, "Session persisted");
        Ok(())
    }

    async fn update_activity(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_active = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events
                (session_id, event_type, intent, tokens_in, tokens_out, latency_ms, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&event.session_id)
        .bind(event.kind.as_str())
        .bind(event.intent.as_deref())
        .bind(event.tokens_in)
        .bind(event.tokens_out)
        .bind(event.latency_ms)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
