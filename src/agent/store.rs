//! Session persistence
//!
//! CRUD for session rows plus guarded status transitions. The session row is
//! the channel between the control surface and the agent loop: control
//! actions update it here, the loop re-reads it at its polling points.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::{AgentConfig, Session, SessionStatus};

#[derive(Clone)]
pub struct SessionStore {
    db: SqlitePool,
}

impl SessionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a session row in status `idle`.
    pub async fn create_session(&self, config: &AgentConfig) -> Result<Session> {
        anyhow::ensure!(config.max_iterations > 0, "max_iterations must be positive");

        let id = config
            .session_id
            .clone()
            .unwrap_or_else(|| format!("fix_{}", Uuid::new_v4()));
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO agent_sessions
                (id, status, current_iteration, max_iterations, analysis_level, auto_apply,
                 total_scans, total_issues_found, total_issues_fixed, created_at, updated_at)
            VALUES ($1, 'idle', 0, $2, $3, $4, 0, 0, 0, $5, $5)
            "#,
        )
        .bind(&id)
        .bind(config.max_iterations as i64)
        .bind(config.analysis_level as i64)
        .bind(config.auto_apply as i64)
        .bind(now)
        .execute(&self.db)
        .await
        .context("Failed to insert session")?;

        self.get(&id).await?.context("Session vanished after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as("SELECT * FROM agent_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(session)
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let rows = sqlx::query_as(
            "SELECT * FROM agent_sessions ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Unconditional status update.
    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE agent_sessions SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Guarded transition: applies only when the current status is one of
    /// `from`. Returns whether the transition happened, so terminal states
    /// are never overwritten by a racing writer.
    pub async fn transition(
        &self,
        id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<bool> {
        let placeholders: Vec<String> =
            (0..from.len()).map(|i| format!("${}", i + 4)).collect();
        let sql = format!(
            "UPDATE agent_sessions SET status = $1, updated_at = $2 WHERE id = $3 AND status IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().timestamp())
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark the session failed with an error message. The single
    /// fatal-error funnel for the loop.
    pub async fn set_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE agent_sessions SET status = 'failed', error_message = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn increment_iteration(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE agent_sessions SET current_iteration = current_iteration + 1, updated_at = $1 WHERE id = $2",
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Bump scan counters after one completed scan.
    pub async fn record_scan(&self, id: &str, issues_found: u64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_sessions
            SET total_scans = total_scans + 1,
                total_issues_found = total_issues_found + $1,
                updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(issues_found as i64)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn record_fixed(&self, id: &str, fixed: u64) -> Result<()> {
        sqlx::query(
            "UPDATE agent_sessions SET total_issues_fixed = total_issues_fixed + $1, updated_at = $2 WHERE id = $3",
        )
        .bind(fixed as i64)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
