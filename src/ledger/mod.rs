//! Change ledger
//!
//! One row per proposed/applied mutation, plus an append-only log per
//! session. The most recent log line is mirrored into a short-TTL cache
//! slot for external pollers. Recording is fire-and-forget: failures here
//! are logged but never escalate to session failure.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

use crate::agent::types::LogType;

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Applied,
    Rejected,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "applied" => Some(Self::Applied),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A proposed or applied file mutation
#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub id: i64,
    pub session_id: String,
    pub file_path: String,
    pub original_content: String,
    pub new_content: String,
    pub status: ChangeStatus,
    pub backup_path: Option<String>,
    pub summary: Option<String>,
    pub created_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for FileChange {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = ChangeStatus::from_str(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown change status: {status_str}").into())
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            file_path: row.try_get("file_path")?,
            original_content: row.try_get("original_content")?,
            new_content: row.try_get("new_content")?,
            status,
            backup_path: row.try_get("backup_path")?,
            summary: row.try_get("summary")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// An append-only log entry
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub session_id: String,
    pub log_type: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub created_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for LogEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let data: Option<String> = row.try_get("data")?;
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            log_type: row.try_get("log_type")?,
            message: row.try_get("message")?,
            data: data.and_then(|d| serde_json::from_str(&d).ok()),
            created_at: row.try_get("created_at")?,
        })
    }
}

// ============================================================================
// Last-log cache
// ============================================================================

/// Explicit key-value cache with a TTL; swap in a distributed or
/// database-backed store behind the same interface.
#[async_trait]
pub trait LogCache: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration);
    async fn get(&self, key: &str) -> Option<String>;
}

/// In-memory TTL map with size-triggered eviction
pub struct MemoryLogCache {
    entries: RwLock<HashMap<String, (String, Instant, Duration)>>,
}

impl MemoryLogCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLogCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogCache for MemoryLogCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.write().await;
        if entries.len() > 1000 {
            entries.retain(|_, (_, at, ttl)| at.elapsed() < *ttl);
        }
        entries.insert(key.to_string(), (value, Instant::now(), ttl));
    }

    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|(value, at, ttl)| {
            if at.elapsed() < *ttl {
                Some(value.clone())
            } else {
                None
            }
        })
    }
}

// ============================================================================
// Ledger
// ============================================================================

pub struct ChangeLedger {
    db: SqlitePool,
    cache: Arc<dyn LogCache>,
    last_log_ttl: Duration,
}

impl ChangeLedger {
    pub fn new(db: SqlitePool, cache: Arc<dyn LogCache>, last_log_ttl: Duration) -> Self {
        Self {
            db,
            cache,
            last_log_ttl,
        }
    }

    /// Record a proposed/applied mutation. Returns the row id, or None when
    /// persistence failed (logged, never escalated).
    #[allow(clippy::too_many_arguments)]
    pub async fn record_change(
        &self,
        session_id: &str,
        file_path: &str,
        original_content: &str,
        new_content: &str,
        status: ChangeStatus,
        backup_path: Option<&Path>,
        summary: &str,
    ) -> Option<i64> {
        let backup = backup_path.map(|p| p.display().to_string());
        let result = sqlx::query(
            r#"
            INSERT INTO file_changes
                (session_id, file_path, original_content, new_content, status, backup_path, summary, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(session_id)
        .bind(file_path)
        .bind(original_content)
        .bind(new_content)
        .bind(status.as_str())
        .bind(backup)
        .bind(summary)
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await;

        match result {
            Ok(done) => Some(done.last_insert_rowid()),
            Err(e) => {
                warn!(session_id, file_path, error = %e, "Failed to record file change");
                None
            }
        }
    }

    /// Append a log entry and mirror it into the last-log cache slot.
    pub async fn record_log(
        &self,
        session_id: &str,
        log_type: LogType,
        message: &str,
        data: Option<serde_json::Value>,
    ) {
        let now = Utc::now().timestamp();
        let data_json = data.as_ref().map(|d| d.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO agent_logs (session_id, log_type, message, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session_id)
        .bind(log_type.as_str())
        .bind(message)
        .bind(data_json)
        .bind(now)
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            warn!(session_id, error = %e, "Failed to append log entry");
        }

        let snapshot = serde_json::json!({
            "type": log_type.as_str(),
            "message": message,
            "data": data,
            "created_at": now,
        });
        self.cache
            .put(
                &format!("last_log:{session_id}"),
                snapshot.to_string(),
                self.last_log_ttl,
            )
            .await;
    }

    /// Most recent log line for a session, from the cache slot.
    pub async fn last_log(&self, session_id: &str) -> Option<String> {
        self.cache.get(&format!("last_log:{session_id}")).await
    }

    /// Recent log entries in creation order (oldest first).
    pub async fn recent_logs(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<LogEntry>> {
        let mut rows: Vec<LogEntry> = sqlx::query_as(
            "SELECT * FROM agent_logs WHERE session_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Log entries newer than a given row id, oldest first.
    pub async fn logs_after(&self, session_id: &str, after_id: i64) -> anyhow::Result<Vec<LogEntry>> {
        let rows = sqlx::query_as(
            "SELECT * FROM agent_logs WHERE session_id = $1 AND id > $2 ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(after_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn get_change(&self, id: i64) -> anyhow::Result<Option<FileChange>> {
        let row = sqlx::query_as("SELECT * FROM file_changes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    /// Changes awaiting an external decision.
    pub async fn pending_changes(&self, session_id: &str) -> anyhow::Result<Vec<FileChange>> {
        let rows = sqlx::query_as(
            "SELECT * FROM file_changes WHERE session_id = $1 AND status = 'pending' ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// All changes for a session in processing order.
    pub async fn changes(&self, session_id: &str) -> anyhow::Result<Vec<FileChange>> {
        let rows = sqlx::query_as(
            "SELECT * FROM file_changes WHERE session_id = $1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn mark_applied(&self, id: i64, backup_path: Option<&Path>) -> anyhow::Result<()> {
        sqlx::query("UPDATE file_changes SET status = 'applied', backup_path = $1 WHERE id = $2")
            .bind(backup_path.map(|p| p.display().to_string()))
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_rejected(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE file_changes SET status = 'rejected' WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
