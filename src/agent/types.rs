//! Types for the remediation agent
//!
//! Session state machine, log taxonomy, and start configuration.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

// ============================================================================
// Session Types
// ============================================================================

/// Status of a remediation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created but not yet driven by an agent task
    Idle,
    /// Agent loop is advancing the session
    Running,
    /// Externally paused; the loop polls for resume
    Paused,
    /// Converged to zero issues, or reached the iteration limit
    Completed,
    /// Fatal error; see `error_message`
    Failed,
    /// Stopped by request or by the paused-too-long fail-safe
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// Kind of an agent log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Info,
    Warning,
    Error,
    Success,
    ScanComplete,
    FixApplied,
    FixGenerated,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
            Self::ScanComplete => "scan_complete",
            Self::FixApplied => "fix_applied",
            Self::FixGenerated => "fix_generated",
        }
    }
}

/// A remediation session row
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub analysis_level: u8,
    pub auto_apply: bool,
    pub total_scans: u64,
    pub total_issues_found: u64,
    pub total_issues_fixed: u64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Session {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = SessionStatus::from_str(&status_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown session status: {status_str}").into())
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            status,
            current_iteration: row.try_get::<i64, _>("current_iteration")? as u32,
            max_iterations: row.try_get::<i64, _>("max_iterations")? as u32,
            analysis_level: row.try_get::<i64, _>("analysis_level")? as u8,
            auto_apply: row.try_get::<i64, _>("auto_apply")? != 0,
            total_scans: row.try_get::<i64, _>("total_scans")? as u64,
            total_issues_found: row.try_get::<i64, _>("total_issues_found")? as u64,
            total_issues_fixed: row.try_get::<i64, _>("total_issues_fixed")? as u64,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// ============================================================================
// Start Configuration
// ============================================================================

/// Configuration for starting a remediation session
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Analysis strictness level passed to the tool
    pub analysis_level: u8,
    /// Iteration budget for the scan-fix loop
    pub max_iterations: u32,
    /// Apply fixes immediately instead of staging them for review
    pub auto_apply: bool,
    /// Scan paths (source-tree-relative); empty means "let the tool decide"
    pub paths: Vec<String>,
    /// Session ID to use (auto-generated if None)
    pub session_id: Option<String>,
}

impl AgentConfig {
    pub fn new(analysis_level: u8, max_iterations: u32) -> Self {
        Self {
            analysis_level,
            max_iterations,
            auto_apply: false,
            paths: Vec::new(),
            session_id: None,
        }
    }

    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            SessionStatus::Idle,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Stopped,
        ] {
            assert_eq!(SessionStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::from_str("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }
}
