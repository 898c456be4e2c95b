//! Caller-facing control surface for remediation sessions.
//!
//! Owns the spawned loop tasks and exposes lifecycle actions (start, pause,
//! resume, stop) plus review operations on staged changes. All lifecycle
//! actions go through guarded status transitions so concurrent requests and
//! the loop itself cannot clobber a terminal state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::file_ops::FileMutator;
use crate::ledger::{ChangeLedger, ChangeStatus, FileChange, LogEntry};

use super::RemediationAgent;
use super::store::SessionStore;
use super::types::{AgentConfig, Session, SessionStatus};

pub struct AgentService {
    store: SessionStore,
    ledger: Arc<ChangeLedger>,
    mutator: Arc<FileMutator>,
    agent: Arc<RemediationAgent>,
    tasks: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl AgentService {
    pub fn new(
        store: SessionStore,
        ledger: Arc<ChangeLedger>,
        mutator: Arc<FileMutator>,
        agent: Arc<RemediationAgent>,
    ) -> Self {
        Self {
            store,
            ledger,
            mutator,
            agent,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session and spawn its loop. Returns the session id
    /// immediately; the loop runs in the background.
    pub async fn start(&self, config: AgentConfig) -> Result<String> {
        let session = self.store.create_session(&config).await?;
        info!(
            session_id = %session.id,
            level = config.analysis_level,
            max_iterations = config.max_iterations,
            auto_apply = config.auto_apply,
            "Starting remediation session"
        );
        self.spawn_loop(&session.id, config.paths).await?;
        Ok(session.id)
    }

    async fn spawn_loop(&self, session_id: &str, paths: Vec<String>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(session_id) {
            bail!("session {session_id} already has an active agent");
        }
        let agent = self.agent.clone();
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            agent.run(&id, paths).await;
        });
        tasks.insert(session_id.to_string(), handle);
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<Session> {
        self.store
            .get(session_id)
            .await?
            .with_context(|| format!("session {session_id} not found"))
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Session>> {
        self.store.list_sessions(limit).await
    }

    /// Request a pause. Returns false when the session was not running.
    pub async fn pause(&self, session_id: &str) -> Result<bool> {
        self.store
            .transition(session_id, &[SessionStatus::Running], SessionStatus::Paused)
            .await
    }

    /// Resume a paused session. When no loop task is alive for it (for
    /// example after a process restart), a fresh one is spawned; scan paths
    /// then fall back to the tool configuration.
    pub async fn resume(&self, session_id: &str) -> Result<bool> {
        let resumed = self
            .store
            .transition(session_id, &[SessionStatus::Paused], SessionStatus::Running)
            .await?;
        if resumed && !self.is_active(session_id).await {
            warn!(session_id, "No live agent task for resumed session, respawning");
            self.spawn_loop(session_id, Vec::new()).await?;
        }
        Ok(resumed)
    }

    /// Request a stop. Idle and paused sessions stop immediately; a running
    /// loop observes the status at its next polling point.
    pub async fn stop(&self, session_id: &str) -> Result<bool> {
        self.store
            .transition(
                session_id,
                &[
                    SessionStatus::Idle,
                    SessionStatus::Running,
                    SessionStatus::Paused,
                ],
                SessionStatus::Stopped,
            )
            .await
    }

    /// Await the session's loop task (if any) and return the final row.
    pub async fn wait(&self, session_id: &str) -> Result<Session> {
        let handle = self.tasks.write().await.remove(session_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(session_id, error = %e, "Agent task panicked");
            }
        }
        self.status(session_id).await
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(session_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn last_log(&self, session_id: &str) -> Option<String> {
        self.ledger.last_log(session_id).await
    }

    pub async fn logs_after(&self, session_id: &str, after_id: i64) -> Result<Vec<LogEntry>> {
        self.ledger.logs_after(session_id, after_id).await
    }

    pub async fn pending_changes(&self, session_id: &str) -> Result<Vec<FileChange>> {
        self.ledger.pending_changes(session_id).await
    }

    /// Apply a staged change to disk. The current file content is compared
    /// against the snapshot taken at staging time; a mismatch is logged but
    /// does not block the apply, since the mutator still syntax-checks and
    /// backs up.
    pub async fn approve_change(&self, change_id: i64) -> Result<()> {
        let change = self
            .ledger
            .get_change(change_id)
            .await?
            .with_context(|| format!("change {change_id} not found"))?;
        if change.status != ChangeStatus::Pending {
            bail!("change {change_id} is not pending");
        }

        match self.mutator.read(&change.file_path).await {
            Ok(current) if current != change.original_content => {
                warn!(
                    change_id,
                    file = %change.file_path,
                    "File changed since the fix was staged"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(change_id, file = %change.file_path, error = %e, "Could not re-read staged file");
            }
        }

        let outcome = self
            .mutator
            .write(&change.file_path, &change.new_content, true)
            .await
            .with_context(|| format!("applying change {change_id} to {}", change.file_path))?;
        self.ledger
            .mark_applied(change_id, outcome.backup_path.as_deref())
            .await?;
        info!(change_id, file = %change.file_path, "Change approved and applied");
        Ok(())
    }

    /// Discard a staged change without touching the file.
    pub async fn reject_change(&self, change_id: i64) -> Result<()> {
        let change = self
            .ledger
            .get_change(change_id)
            .await?
            .with_context(|| format!("change {change_id} not found"))?;
        if change.status != ChangeStatus::Pending {
            bail!("change {change_id} is not pending");
        }
        self.ledger.mark_rejected(change_id).await?;
        info!(change_id, file = %change.file_path, "Change rejected");
        Ok(())
    }

    /// Undo an applied change by restoring its backup, then mark it
    /// rejected so it no longer counts as in effect.
    pub async fn revert_change(&self, change_id: i64) -> Result<()> {
        let change = self
            .ledger
            .get_change(change_id)
            .await?
            .with_context(|| format!("change {change_id} not found"))?;
        if change.status != ChangeStatus::Applied {
            bail!("change {change_id} has not been applied");
        }
        let backup = change
            .backup_path
            .as_deref()
            .with_context(|| format!("change {change_id} has no backup to restore"))?;
        self.mutator
            .restore(Path::new(backup), &change.file_path)
            .await
            .with_context(|| format!("restoring {} from {backup}", change.file_path))?;
        self.ledger.mark_rejected(change_id).await?;
        info!(change_id, file = %change.file_path, "Change reverted from backup");
        Ok(())
    }
}
