//! State store
//!
//! Embedded SQLite database holding run summaries, the audit trail, event
//! snapshots, and a small key/value metadata table. The schema is created
//! idempotently at open; every write autocommits.

use avocado_core::models::{SyncStatus, Trigger};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;

use crate::error::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_at TEXT NOT NULL,
        "trigger" TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        duration_ms INTEGER NOT NULL DEFAULT 0,
        changes_applied INTEGER NOT NULL DEFAULT 0,
        conflicts INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER,
        created_at TEXT NOT NULL,
        calendar_id TEXT NOT NULL,
        uid TEXT NOT NULL,
        action TEXT NOT NULL,
        details_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS event_snapshots (
        calendar_id TEXT NOT NULL,
        uid TEXT NOT NULL,
        etag TEXT NOT NULL DEFAULT '',
        payload_hash TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (calendar_id, uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SyncRunRow {
    pub id: i64,
    pub run_at: String,
    #[sqlx(rename = "trigger")]
    #[serde(rename = "trigger")]
    pub trigger: String,
    pub status: String,
    pub message: String,
    pub duration_ms: i64,
    pub changes_applied: i64,
    pub conflicts: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditEventRow {
    pub id: i64,
    pub run_id: Option<i64>,
    pub created_at: String,
    pub calendar_id: String,
    pub uid: String,
    pub action: String,
    pub details_json: String,
}

impl AuditEventRow {
    pub fn details(&self) -> serde_json::Value {
        serde_json::from_str(&self.details_json).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SnapshotRow {
    pub calendar_id: String,
    pub uid: String,
    pub etag: String,
    pub payload_hash: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

impl StateStore {
    /// Open (and create) the database file, bootstrapping the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = StateStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests and throwaway runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = StateStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Open a run row; audits written during the run carry its id.
    pub async fn start_run(&self, trigger: Trigger) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_runs (run_at, "trigger", status, message, duration_ms, changes_applied, conflicts)
            VALUES (?, ?, 'running', '', 0, 0, 0)
            "#,
        )
        .bind(now_iso())
        .bind(trigger.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Finalize a run row.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_run(
        &self,
        run_id: i64,
        status: SyncStatus,
        message: &str,
        duration_ms: i64,
        changes_applied: i64,
        conflicts: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = ?, message = ?, duration_ms = ?, changes_applied = ?, conflicts = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(duration_ms)
        .bind(changes_applied)
        .bind(conflicts)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRunRow>, StoreError> {
        let rows = sqlx::query_as::<_, SyncRunRow>(
            r#"
            SELECT id, run_at, "trigger", status, message, duration_ms, changes_applied, conflicts
            FROM sync_runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_audit_event(
        &self,
        run_id: Option<i64>,
        calendar_id: &str,
        uid: &str,
        action: &str,
        details: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_events (run_id, created_at, calendar_id, uid, action, details_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(now_iso())
        .bind(calendar_id)
        .bind(uid)
        .bind(action)
        .bind(details.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn recent_audit_events(&self, limit: i64) -> Result<Vec<AuditEventRow>, StoreError> {
        let rows = sqlx::query_as::<_, AuditEventRow>(
            r#"
            SELECT id, run_id, created_at, calendar_id, uid, action, details_json
            FROM audit_events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_audit_event(&self, event_id: i64) -> Result<AuditEventRow, StoreError> {
        let row = sqlx::query_as::<_, AuditEventRow>(
            r#"
            SELECT id, run_id, created_at, calendar_id, uid, action, details_json
            FROM audit_events
            WHERE id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::AuditEventNotFound(event_id))
    }

    pub async fn upsert_snapshot(
        &self,
        calendar_id: &str,
        uid: &str,
        etag: &str,
        payload_hash: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_snapshots (calendar_id, uid, etag, payload_hash, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (calendar_id, uid) DO UPDATE SET
                etag = excluded.etag,
                payload_hash = excluded.payload_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(calendar_id)
        .bind(uid)
        .bind(etag)
        .bind(payload_hash)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_snapshot(
        &self,
        calendar_id: &str,
        uid: &str,
    ) -> Result<Option<SnapshotRow>, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT calendar_id, uid, etag, payload_hash, updated_at
            FROM event_snapshots
            WHERE calendar_id = ? AND uid = ?
            "#,
        )
        .bind(calendar_id)
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_meta WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO app_meta (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = StateStore::in_memory().await.unwrap();
        let run_id = store.start_run(Trigger::Manual).await.unwrap();
        store
            .finish_run(run_id, SyncStatus::Success, "Processed 3 events", 42, 1, 0)
            .await
            .unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].trigger, "manual");
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].changes_applied, 1);
        assert_eq!(runs[0].duration_ms, 42);
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let store = StateStore::in_memory().await.unwrap();
        for _ in 0..3 {
            let id = store.start_run(Trigger::Scheduled).await.unwrap();
            store
                .finish_run(id, SyncStatus::Skipped, "", 0, 0, 0)
                .await
                .unwrap();
        }
        let runs = store.recent_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].id > runs[1].id);
    }

    #[tokio::test]
    async fn test_audit_events() {
        let store = StateStore::in_memory().await.unwrap();
        let run_id = store.start_run(Trigger::Manual).await.unwrap();
        let event_id = store
            .record_audit_event(
                Some(run_id),
                "cal-1",
                "uid-1",
                "apply_ai_change",
                &json!({"category": "health", "fields": ["start", "end"]}),
            )
            .await
            .unwrap();

        let fetched = store.get_audit_event(event_id).await.unwrap();
        assert_eq!(fetched.action, "apply_ai_change");
        assert_eq!(fetched.run_id, Some(run_id));
        assert_eq!(fetched.details()["category"], "health");

        let recent = store.recent_audit_events(10).await.unwrap();
        assert_eq!(recent.len(), 1);

        assert!(matches!(
            store.get_audit_event(event_id + 1).await,
            Err(StoreError::AuditEventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_upsert_overwrites() {
        let store = StateStore::in_memory().await.unwrap();
        store
            .upsert_snapshot("cal-1", "uid-1", "etag-a", "hash-a")
            .await
            .unwrap();
        store
            .upsert_snapshot("cal-1", "uid-1", "etag-b", "hash-b")
            .await
            .unwrap();
        let snapshot = store.get_snapshot("cal-1", "uid-1").await.unwrap().unwrap();
        assert_eq!(snapshot.etag, "etag-b");
        assert_eq!(snapshot.payload_hash, "hash-b");
        assert!(store.get_snapshot("cal-1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let store = StateStore::in_memory().await.unwrap();
        assert!(store.get_meta("fingerprint").await.unwrap().is_none());
        store.set_meta("fingerprint", "abc").await.unwrap();
        store.set_meta("fingerprint", "def").await.unwrap();
        assert_eq!(store.get_meta("fingerprint").await.unwrap().as_deref(), Some("def"));
    }
}
