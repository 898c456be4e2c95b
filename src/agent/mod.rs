//! Remediation agent
//!
//! The session-based control loop: scan the source tree, turn findings into
//! issues, ask the collaborator for corrected files, and apply or stage the
//! mutations. One spawned task advances one session; the session row is
//! re-read at every polling point so external pause/resume/stop requests are
//! observed cooperatively.

pub mod service;
pub mod store;
pub mod types;

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::analysis::{Analyzer, Issue, ScanRequest};
use crate::config::CONFIG;
use crate::file_ops::FileMutator;
use crate::fixer::{self, FixGenerator};
use crate::ledger::{ChangeLedger, ChangeStatus};

use store::SessionStore;
use types::{LogType, Session, SessionStatus};

/// Loop timing and sizing knobs
#[derive(Debug, Clone)]
pub struct AgentTuning {
    /// Interval between status polls while paused
    pub pause_poll_interval: Duration,
    /// Poll ticks tolerated before a paused session is force-stopped
    pub pause_max_ticks: u32,
    /// Yield between iterations
    pub iteration_delay: Duration,
    /// Lines of context around the issue line in the collaborator prompt
    pub context_margin: u32,
}

impl AgentTuning {
    pub fn from_global() -> Self {
        Self {
            pause_poll_interval: CONFIG.pause_poll_interval,
            pause_max_ticks: CONFIG.pause_max_ticks,
            iteration_delay: CONFIG.iteration_delay,
            context_margin: CONFIG.context_margin,
        }
    }
}

pub struct RemediationAgent {
    store: SessionStore,
    ledger: Arc<ChangeLedger>,
    analyzer: Arc<dyn Analyzer>,
    fixer: FixGenerator,
    mutator: Arc<FileMutator>,
    tuning: AgentTuning,
}

impl RemediationAgent {
    pub fn new(
        store: SessionStore,
        ledger: Arc<ChangeLedger>,
        analyzer: Arc<dyn Analyzer>,
        fixer: FixGenerator,
        mutator: Arc<FileMutator>,
        tuning: AgentTuning,
    ) -> Self {
        Self {
            store,
            ledger,
            analyzer,
            fixer,
            mutator,
            tuning,
        }
    }

    /// Drive the session to a terminal state. Every error escaping the loop
    /// funnels into status=failed with the captured message.
    pub async fn run(&self, session_id: &str, scan_paths: Vec<String>) {
        if let Err(e) = self.run_inner(session_id, &scan_paths).await {
            error!(session_id, error = %e, "Agent loop failed");
            if let Err(persist) = self.store.set_failed(session_id, &e.to_string()).await {
                error!(session_id, error = %persist, "Could not persist failure status");
            }
            self.ledger
                .record_log(
                    session_id,
                    LogType::Error,
                    &format!("Agent failed: {e}"),
                    None,
                )
                .await;
        }
    }

    async fn run_inner(&self, session_id: &str, scan_paths: &[String]) -> anyhow::Result<()> {
        let started = self
            .store
            .transition(
                session_id,
                &[
                    SessionStatus::Idle,
                    SessionStatus::Paused,
                    SessionStatus::Running,
                ],
                SessionStatus::Running,
            )
            .await?;
        if !started {
            let current = self.store.get(session_id).await?;
            anyhow::ensure!(current.is_some(), "session {session_id} not found");
            info!(session_id, "Session already terminal, nothing to do");
            return Ok(());
        }

        self.ledger
            .record_log(session_id, LogType::Info, "Remediation agent started", None)
            .await;

        loop {
            // Re-read so externally-issued control actions are observed.
            let session = self
                .store
                .get(session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("session {session_id} disappeared"))?;

            match session.status {
                SessionStatus::Stopped => {
                    self.ledger
                        .record_log(session_id, LogType::Info, "Stopped by request", None)
                        .await;
                    return Ok(());
                }
                SessionStatus::Paused => {
                    if !self.wait_while_paused(session_id).await? {
                        return Ok(());
                    }
                    continue;
                }
                status if status.is_terminal() => return Ok(()),
                _ => {}
            }

            if session.current_iteration >= session.max_iterations {
                break;
            }

            self.store.increment_iteration(session_id).await?;
            let iteration = session.current_iteration + 1;
            self.ledger
                .record_log(
                    session_id,
                    LogType::Info,
                    &format!(
                        "Starting iteration {iteration}/{}",
                        session.max_iterations
                    ),
                    None,
                )
                .await;

            // A scan failure is fatal for the session; it is not retried.
            let request = ScanRequest {
                level: Some(session.analysis_level),
                paths: scan_paths.to_vec(),
            };
            let outcome = self
                .analyzer
                .scan(&request)
                .await
                .map_err(|e| anyhow::anyhow!("static analysis failed: {e}"))?;

            self.store
                .record_scan(session_id, outcome.issues.len() as u64)
                .await?;
            self.ledger
                .record_log(
                    session_id,
                    LogType::ScanComplete,
                    &format!(
                        "Scan finished: {} issue(s) across {} file(s)",
                        outcome.issues.len(),
                        outcome.summary.files_scanned
                    ),
                    Some(serde_json::json!({
                        "iteration": iteration,
                        "issues": outcome.issues.len(),
                        "files_scanned": outcome.summary.files_scanned,
                        "total_errors": outcome.summary.total_errors,
                        "files_with_errors": outcome.summary.files_with_errors,
                    })),
                )
                .await;

            if outcome.issues.is_empty() {
                self.ledger
                    .record_log(
                        session_id,
                        LogType::Success,
                        "No issues found, codebase is clean",
                        None,
                    )
                    .await;
                // Also completes over a concurrent pause: the work is done.
                self.store
                    .transition(
                        session_id,
                        &[SessionStatus::Running, SessionStatus::Paused],
                        SessionStatus::Completed,
                    )
                    .await?;
                return Ok(());
            }

            // Issues are processed strictly in tool order; they are
            // independent, so one failure never aborts the iteration.
            let mut fixed = 0u64;
            for issue in &outcome.issues {
                if self.process_issue(&session, issue).await {
                    fixed += 1;
                }
            }
            self.store.record_fixed(session_id, fixed).await?;

            if fixed == 0 {
                warn!(session_id, issues = outcome.issues.len(), "Unproductive iteration");
                self.ledger
                    .record_log(
                        session_id,
                        LogType::Warning,
                        "No fixes applied this iteration; the remaining issues may not be auto-fixable",
                        Some(serde_json::json!({
                            "iteration": iteration,
                            "issues": outcome.issues.len(),
                            "fixed": 0,
                        })),
                    )
                    .await;
            }

            tokio::time::sleep(self.tuning.iteration_delay).await;
        }

        // Iteration budget exhausted: a soft success, not a failure.
        self.ledger
            .record_log(
                session_id,
                LogType::Info,
                "Reached iteration limit without full convergence",
                None,
            )
            .await;
        self.store
            .transition(
                session_id,
                &[SessionStatus::Running, SessionStatus::Paused],
                SessionStatus::Completed,
            )
            .await?;
        Ok(())
    }

    /// Block while paused, polling the session row. Returns false when the
    /// session ended (stop observed, or the paused-too-long fail-safe fired).
    async fn wait_while_paused(&self, session_id: &str) -> anyhow::Result<bool> {
        for _ in 0..self.tuning.pause_max_ticks {
            tokio::time::sleep(self.tuning.pause_poll_interval).await;
            let session = self
                .store
                .get(session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("session {session_id} disappeared"))?;
            match session.status {
                SessionStatus::Paused => continue,
                SessionStatus::Running => {
                    self.ledger
                        .record_log(session_id, LogType::Info, "Resumed", None)
                        .await;
                    return Ok(true);
                }
                SessionStatus::Stopped => {
                    self.ledger
                        .record_log(session_id, LogType::Info, "Stopped while paused", None)
                        .await;
                    return Ok(false);
                }
                _ => return Ok(false),
            }
        }

        // Fail-safe against an indefinitely hung session.
        self.store
            .transition(session_id, &[SessionStatus::Paused], SessionStatus::Stopped)
            .await?;
        self.ledger
            .record_log(
                session_id,
                LogType::Warning,
                "Paused too long, stopping session",
                None,
            )
            .await;
        Ok(false)
    }

    /// Per-issue pipeline: read, prompt, generate, apply or stage.
    /// Local failures are logged and counted; they never touch session
    /// status.
    async fn process_issue(&self, session: &Session, issue: &Issue) -> bool {
        if issue.file.is_empty() {
            self.ledger
                .record_log(
                    &session.id,
                    LogType::Error,
                    "Issue has no file path and cannot be processed",
                    Some(serde_json::json!({ "message": issue.message })),
                )
                .await;
            return false;
        }

        let issue_data = serde_json::json!({
            "file": issue.file,
            "line": issue.line,
            "message": issue.message,
            "severity": issue.severity.as_str(),
        });

        let content = match self.mutator.read(&issue.file).await {
            Ok(content) => content,
            Err(e) => {
                self.ledger
                    .record_log(
                        &session.id,
                        LogType::Error,
                        &format!("Could not read {}: {e}", issue.file),
                        Some(issue_data),
                    )
                    .await;
                return false;
            }
        };

        let window = fixer::context_window(&content, issue.line, self.tuning.context_margin);
        let fix = match self
            .fixer
            .generate(&issue.file, &content, issue, &window)
            .await
        {
            Ok(fix) => fix,
            Err(e) => {
                self.ledger
                    .record_log(
                        &session.id,
                        LogType::Warning,
                        &format!("Fix generation failed for {}: {e}", issue.file),
                        Some(issue_data),
                    )
                    .await;
                return false;
            }
        };

        let summary = match issue.line {
            Some(line) => format!("{} (line {line})", issue.message),
            None => issue.message.clone(),
        };

        if session.auto_apply {
            match self.mutator.write(&issue.file, &fix.content, true).await {
                Ok(outcome) => {
                    self.ledger
                        .record_change(
                            &session.id,
                            &issue.file,
                            &content,
                            &fix.content,
                            ChangeStatus::Applied,
                            outcome.backup_path.as_deref(),
                            &summary,
                        )
                        .await;
                    self.ledger
                        .record_log(
                            &session.id,
                            LogType::FixApplied,
                            &format!("Applied fix to {}", issue.file),
                            Some(serde_json::json!({
                                "file": issue.file,
                                "line": issue.line,
                                "backup": outcome.backup_path.as_ref().map(|p| p.display().to_string()),
                                "tokens_used": fix.tokens_used,
                            })),
                        )
                        .await;
                    true
                }
                Err(e) => {
                    self.ledger
                        .record_log(
                            &session.id,
                            LogType::Error,
                            &format!("Failed to apply fix to {}: {e}", issue.file),
                            Some(issue_data),
                        )
                        .await;
                    false
                }
            }
        } else {
            self.ledger
                .record_change(
                    &session.id,
                    &issue.file,
                    &content,
                    &fix.content,
                    ChangeStatus::Pending,
                    None,
                    &summary,
                )
                .await;
            self.ledger
                .record_log(
                    &session.id,
                    LogType::FixGenerated,
                    &format!("Staged fix for {} (awaiting review)", issue.file),
                    Some(issue_data),
                )
                .await;
            true
        }
    }
}
