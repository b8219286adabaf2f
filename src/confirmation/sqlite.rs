//! SQLite-backed pending-confirmation store.
//!
//! Survives restarts, so a confirmation asked before a deploy can still be
//! answered after it (until it expires). Resolution is a single conditional
//! `UPDATE`, which keeps it exactly-once across processes sharing the database.
//!
//! ```rust,no_run
//! use tower_agent_router::confirmation::SqliteConfirmationStore;
//!
//! # async fn demo() -> tower_agent_router::Result<()> {
//! let store = SqliteConfirmationStore::new("confirmations.db").await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};

use super::{ConfirmationEnvelope, PendingConfirmation, PendingConfirmationStore, Resolution};
use crate::error::{ConfirmationError, Result, RouterError};

pub struct SqliteConfirmationStore {
    pool: Pool<Sqlite>,
}

impl SqliteConfirmationStore {
    /// Opens (creating if needed) the database at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every query on
    /// the same database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_confirmations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                origin_handler TEXT NOT NULL,
                follow_up_handler TEXT NOT NULL,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                context TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolution TEXT,
                resolved_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_confirmations_session
            ON pending_confirmations(session_id)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_confirmations_expiry
            ON pending_confirmations(expires_at)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Fixed-width UTC timestamps, so SQL string comparison orders them.
    fn timestamp(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                ConfirmationError::Store {
                    message: format!("bad timestamp '{raw}': {e}"),
                }
                .into()
            })
    }

    fn from_row(row: &SqliteRow) -> Result<PendingConfirmation> {
        let options: String = row.try_get("options")?;
        let context: String = row.try_get("context")?;
        let expires_at: String = row.try_get("expires_at")?;
        let created_at: String = row.try_get("created_at")?;
        let resolution: Option<String> = row.try_get("resolution")?;
        Ok(PendingConfirmation {
            envelope: ConfirmationEnvelope {
                id: row.try_get("id")?,
                question: row.try_get("question")?,
                options: serde_json::from_str(&options)?,
                context: serde_json::from_str(&context)?,
                expires_at: Self::parse_time(&expires_at)?,
            },
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            origin_handler: row.try_get("origin_handler")?,
            follow_up_handler: row.try_get("follow_up_handler")?,
            created_at: Self::parse_time(&created_at)?,
            resolution: resolution.as_deref().and_then(Resolution::parse),
        })
    }
}

#[async_trait]
impl PendingConfirmationStore for SqliteConfirmationStore {
    async fn put(&self, pending: PendingConfirmation) -> Result<()> {
        let env = &pending.envelope;
        sqlx::query(
            r#"
            INSERT INTO pending_confirmations
                (id, session_id, user_id, origin_handler, follow_up_handler,
                 question, options, context, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&env.id)
        .bind(&pending.session_id)
        .bind(&pending.user_id)
        .bind(&pending.origin_handler)
        .bind(&pending.follow_up_handler)
        .bind(&env.question)
        .bind(serde_json::to_string(&env.options)?)
        .bind(serde_json::to_string(&env.context)?)
        .bind(Self::timestamp(env.expires_at))
        .bind(Self::timestamp(pending.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PendingConfirmation>> {
        let row = sqlx::query("SELECT * FROM pending_confirmations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn resolve(&self, id: &str, resolution: Resolution) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_confirmations
            SET resolution = ?, resolved_at = ?
            WHERE id = ? AND resolved_at IS NULL
            "#,
        )
        .bind(resolution.as_str())
        .bind(Self::timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM pending_confirmations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RouterError::Confirmation(ConfirmationError::Unknown {
                id: id.to_string(),
            })),
        }
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM pending_confirmations WHERE expires_at < ?")
            .bind(Self::timestamp(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

impl std::fmt::Debug for SqliteConfirmationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConfirmationStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(id: &str) -> PendingConfirmation {
        expiring(id, Utc::now() + chrono::Duration::minutes(5))
    }

    fn expiring(id: &str, expires_at: DateTime<Utc>) -> PendingConfirmation {
        let now = Utc::now();
        PendingConfirmation {
            envelope: ConfirmationEnvelope {
                id: id.to_string(),
                question: "Order the groceries?".into(),
                options: vec!["confirm".into(), "cancel".into()],
                context: json!({"items": ["milk", "eggs"]}),
                expires_at,
            },
            session_id: "s1".into(),
            user_id: "u1".into(),
            origin_handler: "shopping".into(),
            follow_up_handler: "shopping".into(),
            created_at: now,
            resolution: None,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = SqliteConfirmationStore::new_in_memory().await.unwrap();
        store.put(pending("c1")).await.unwrap();
        let got = store.get("c1").await.unwrap().unwrap();
        assert_eq!(got.envelope.context["items"][1], "eggs");
        assert_eq!(got.origin_handler, "shopping");
        assert!(got.resolution.is_none());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_is_exactly_once() {
        let store = SqliteConfirmationStore::new_in_memory().await.unwrap();
        store.put(pending("c1")).await.unwrap();
        assert!(store.resolve("c1", Resolution::Accepted).await.unwrap());
        assert!(!store.resolve("c1", Resolution::Rejected).await.unwrap());
        let got = store.get("c1").await.unwrap().unwrap();
        assert_eq!(got.resolution, Some(Resolution::Accepted));
    }

    #[tokio::test]
    async fn resolve_unknown_id_errors() {
        let store = SqliteConfirmationStore::new_in_memory().await.unwrap();
        let err = store.resolve("ghost", Resolution::Accepted).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Confirmation(ConfirmationError::Unknown { .. })
        ));
    }

    #[tokio::test]
    async fn purge_removes_expired_rows_only() {
        let store = SqliteConfirmationStore::new_in_memory().await.unwrap();
        let now = Utc::now();
        store.put(expiring("old", now - chrono::Duration::minutes(1))).await.unwrap();
        store.put(expiring("done", now - chrono::Duration::seconds(1))).await.unwrap();
        store.resolve("done", Resolution::Rejected).await.unwrap();
        store.put(pending("fresh")).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 2);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
        assert!(matches!(
            store.resolve("done", Resolution::Accepted).await.unwrap_err(),
            RouterError::Confirmation(ConfirmationError::Unknown { .. })
        ));
        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = SqliteConfirmationStore::new_in_memory().await.unwrap();
        store.put(pending("c1")).await.unwrap();
        assert!(matches!(
            store.put(pending("c1")).await.unwrap_err(),
            RouterError::Database(_)
        ));
    }
}
