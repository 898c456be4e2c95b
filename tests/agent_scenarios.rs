//! End-to-end loop scenarios with stubbed analyzer and collaborator.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify};

use remedian::agent::service::AgentService;
use remedian::agent::store::SessionStore;
use remedian::agent::types::{AgentConfig, SessionStatus};
use remedian::agent::{AgentTuning, RemediationAgent};
use remedian::analysis::{
    Analyzer, Issue, ScanError, ScanOutcome, ScanRequest, ScanSummary, Severity,
};
use remedian::db;
use remedian::file_ops::{FileMutator, MutatorConfig};
use remedian::fixer::FixGenerator;
use remedian::ledger::{ChangeLedger, ChangeStatus, MemoryLogCache};
use remedian::llm::{ChatCollaborator, ChatError, ChatReply, ChatRequest};

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

/// Returns scripted outcomes in order; once the script runs out it repeats
/// `fallback`. Notifies after every scan so tests can synchronize.
struct StubAnalyzer {
    script: Mutex<VecDeque<Result<ScanOutcome, ScanError>>>,
    fallback: ScanOutcome,
    scanned: Notify,
}

impl StubAnalyzer {
    fn new(script: Vec<Result<ScanOutcome, ScanError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: clean_outcome(),
            scanned: Notify::new(),
        }
    }

    fn repeating(fallback: ScanOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            scanned: Notify::new(),
        }
    }
}

#[async_trait]
impl Analyzer for StubAnalyzer {
    async fn scan(&self, _request: &ScanRequest) -> Result<ScanOutcome, ScanError> {
        let result = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()));
        self.scanned.notify_one();
        result
    }
}

struct StubChat {
    reply: String,
}

#[async_trait]
impl ChatCollaborator for StubChat {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatReply, ChatError> {
        Ok(ChatReply {
            message: self.reply.clone(),
            tokens_used: Some(42),
        })
    }
}

struct FailingChat;

#[async_trait]
impl ChatCollaborator for FailingChat {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatReply, ChatError> {
        Err(ChatError("model overloaded".into()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const BUGGY: &str = "<?php\nfunction add($a, $b) {\n    return $a + $c;\n}\n";
const FIXED: &str = "<?php\nfunction add($a, $b) {\n    return $a + $b;\n}\n";

fn clean_outcome() -> ScanOutcome {
    ScanOutcome {
        issues: Vec::new(),
        summary: ScanSummary {
            files_scanned: 3,
            total_errors: 0,
            files_with_errors: 0,
        },
    }
}

fn dirty_outcome(file: &str) -> ScanOutcome {
    ScanOutcome {
        issues: vec![Issue {
            file: file.to_string(),
            line: Some(3),
            message: "Undefined variable: $c".to_string(),
            identifier: Some("variable.undefined".to_string()),
            tip: None,
            severity: Severity::Medium,
        }],
        summary: ScanSummary {
            files_scanned: 3,
            total_errors: 1,
            files_with_errors: 1,
        },
    }
}

struct Harness {
    root: TempDir,
    store: SessionStore,
    ledger: Arc<ChangeLedger>,
    mutator: Arc<FileMutator>,
    agent: Arc<RemediationAgent>,
}

impl Harness {
    async fn new(analyzer: Arc<dyn Analyzer>, chat: Arc<dyn ChatCollaborator>) -> Self {
        Self::with_tuning(analyzer, chat, test_tuning()).await
    }

    async fn with_tuning(
        analyzer: Arc<dyn Analyzer>,
        chat: Arc<dyn ChatCollaborator>,
        tuning: AgentTuning,
    ) -> Self {
        let root = TempDir::new().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        db::init_schema(&pool).await.unwrap();

        let store = SessionStore::new(pool.clone());
        let ledger = Arc::new(ChangeLedger::new(
            pool,
            Arc::new(MemoryLogCache::new()),
            Duration::from_secs(60),
        ));
        let mutator = Arc::new(FileMutator::new(MutatorConfig {
            root: root.path().to_path_buf(),
            backup_dir: root.path().join(".remedian/backups"),
            allowed_extensions: vec!["php".to_string()],
            denied_dirs: vec!["vendor".to_string()],
            syntax_check: None,
        }));
        let fixer = FixGenerator::new(chat);
        let agent = Arc::new(RemediationAgent::new(
            store.clone(),
            ledger.clone(),
            analyzer,
            fixer,
            mutator.clone(),
            tuning,
        ));

        Self {
            root,
            store,
            ledger,
            mutator,
            agent,
        }
    }

    fn seed_file(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn start(&self, config: AgentConfig) -> String {
        self.store.create_session(&config).await.unwrap().id
    }

    async fn status(&self, id: &str) -> SessionStatus {
        self.store.get(id).await.unwrap().unwrap().status
    }

    async fn log_messages(&self, id: &str) -> Vec<String> {
        self.ledger
            .recent_logs(id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }
}

fn test_tuning() -> AgentTuning {
    AgentTuning {
        pause_poll_interval: Duration::from_millis(10),
        pause_max_ticks: 100,
        iteration_delay: Duration::from_millis(5),
        context_margin: 5,
    }
}

fn fenced_reply(code: &str) -> String {
    format!("Here is the corrected file:\n```php\n{code}```\n")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_first_scan_completes_immediately() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![Ok(clean_outcome())]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;

    let id = h.start(AgentConfig::new(1, 5)).await;
    h.agent.run(&id, Vec::new()).await;

    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.current_iteration, 1);
    assert_eq!(session.total_scans, 1);
    assert_eq!(session.total_issues_found, 0);
    assert_eq!(session.total_issues_fixed, 0);

    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("clean")));
}

#[tokio::test]
async fn auto_apply_fixes_and_converges() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![
        Ok(dirty_outcome("src/app.php")),
        Ok(clean_outcome()),
    ]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;
    let file = h.seed_file("src/app.php", BUGGY);

    let id = h
        .start(AgentConfig::new(5, 5).with_auto_apply(true))
        .await;
    h.agent.run(&id, Vec::new()).await;

    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.current_iteration, 2);
    assert_eq!(session.total_scans, 2);
    assert_eq!(session.total_issues_found, 1);
    assert_eq!(session.total_issues_fixed, 1);

    // The fix landed on disk and the original was backed up.
    assert_eq!(std::fs::read_to_string(&file).unwrap(), FIXED);
    let changes = h.ledger.changes(&id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].status, ChangeStatus::Applied);
    assert_eq!(changes[0].original_content, BUGGY);
    let backup = changes[0].backup_path.as_deref().unwrap();
    assert_eq!(std::fs::read_to_string(backup).unwrap(), BUGGY);
}

#[tokio::test]
async fn staged_fix_leaves_file_untouched_until_approved() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![
        Ok(dirty_outcome("src/app.php")),
        Ok(clean_outcome()),
    ]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;
    let file = h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 5)).await;
    h.agent.run(&id, Vec::new()).await;

    assert_eq!(h.status(&id).await, SessionStatus::Completed);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), BUGGY);

    let pending = h.ledger.pending_changes(&id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].new_content, FIXED);

    // Approval through the service applies the staged content with backup.
    let service = AgentService::new(
        h.store.clone(),
        h.ledger.clone(),
        h.mutator.clone(),
        h.agent.clone(),
    );
    service.approve_change(pending[0].id).await.unwrap();
    assert_eq!(std::fs::read_to_string(&file).unwrap(), FIXED);

    let change = h.ledger.get_change(pending[0].id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Applied);
    let backup = change.backup_path.as_deref().unwrap();
    assert_eq!(std::fs::read_to_string(backup).unwrap(), BUGGY);

    // And reverting restores the original.
    service.revert_change(change.id).await.unwrap();
    assert_eq!(std::fs::read_to_string(&file).unwrap(), BUGGY);
}

#[tokio::test]
async fn rejected_change_never_touches_disk() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![
        Ok(dirty_outcome("src/app.php")),
        Ok(clean_outcome()),
    ]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;
    let file = h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 5)).await;
    h.agent.run(&id, Vec::new()).await;

    let pending = h.ledger.pending_changes(&id).await.unwrap();
    let service = AgentService::new(
        h.store.clone(),
        h.ledger.clone(),
        h.mutator.clone(),
        h.agent.clone(),
    );
    service.reject_change(pending[0].id).await.unwrap();

    assert_eq!(std::fs::read_to_string(&file).unwrap(), BUGGY);
    assert!(h.ledger.pending_changes(&id).await.unwrap().is_empty());

    // A rejected change cannot be approved afterwards.
    assert!(service.approve_change(pending[0].id).await.is_err());
}

#[tokio::test]
async fn scan_failure_fails_the_session() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![Err(ScanError::Tool {
        code: 255,
        stderr: "memory exhausted".to_string(),
    })]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;

    let id = h.start(AgentConfig::new(1, 5)).await;
    h.agent.run(&id, Vec::new()).await;

    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let error = session.error_message.unwrap();
    assert!(error.contains("memory exhausted"), "got: {error}");

    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("Agent failed")));
}

#[tokio::test]
async fn nothing_scanned_is_fatal_not_clean() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![Err(ScanError::NothingScanned)]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;

    let id = h.start(AgentConfig::new(1, 5)).await;
    h.agent.run(&id, Vec::new()).await;

    assert_eq!(h.status(&id).await, SessionStatus::Failed);
}

#[tokio::test]
async fn pause_then_stop_ends_the_session() {
    let analyzer = Arc::new(StubAnalyzer::repeating(dirty_outcome("src/app.php")));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer.clone(), chat).await;
    h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 100)).await;
    let agent = h.agent.clone();
    let run_id = id.clone();
    let task = tokio::spawn(async move { agent.run(&run_id, Vec::new()).await });

    analyzer.scanned.notified().await;
    assert!(
        h.store
            .transition(&id, &[SessionStatus::Running], SessionStatus::Paused)
            .await
            .unwrap()
    );

    // The loop must hold position while paused.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.status(&id).await, SessionStatus::Paused);

    assert!(
        h.store
            .transition(&id, &[SessionStatus::Paused], SessionStatus::Stopped)
            .await
            .unwrap()
    );
    task.await.unwrap();

    assert_eq!(h.status(&id).await, SessionStatus::Stopped);
    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("Stopped while paused")));
}

#[tokio::test]
async fn pause_resume_continues_the_loop() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![
        Ok(dirty_outcome("src/app.php")),
        Ok(clean_outcome()),
    ]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer.clone(), chat).await;
    h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 5)).await;
    let agent = h.agent.clone();
    let run_id = id.clone();
    let task = tokio::spawn(async move { agent.run(&run_id, Vec::new()).await });

    analyzer.scanned.notified().await;
    h.store
        .transition(&id, &[SessionStatus::Running], SessionStatus::Paused)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.store
        .transition(&id, &[SessionStatus::Paused], SessionStatus::Running)
        .await
        .unwrap();
    task.await.unwrap();

    // After resuming, the second (clean) scan converged the session.
    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_scans, 2);
}

#[tokio::test]
async fn paused_too_long_forces_stop() {
    let analyzer = Arc::new(StubAnalyzer::repeating(dirty_outcome("src/app.php")));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let tuning = AgentTuning {
        pause_max_ticks: 3,
        ..test_tuning()
    };
    let h = Harness::with_tuning(analyzer.clone(), chat, tuning).await;
    h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 100)).await;
    let agent = h.agent.clone();
    let run_id = id.clone();
    let task = tokio::spawn(async move { agent.run(&run_id, Vec::new()).await });

    analyzer.scanned.notified().await;
    h.store
        .transition(&id, &[SessionStatus::Running], SessionStatus::Paused)
        .await
        .unwrap();
    task.await.unwrap();

    assert_eq!(h.status(&id).await, SessionStatus::Stopped);
    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("Paused too long")));
}

#[tokio::test]
async fn iteration_limit_completes_softly() {
    let analyzer = Arc::new(StubAnalyzer::repeating(dirty_outcome("src/app.php")));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;
    h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 3)).await;
    h.agent.run(&id, Vec::new()).await;

    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.current_iteration, 3);
    assert_eq!(session.total_scans, 3);
    assert_eq!(session.total_issues_found, 3);

    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("iteration limit")));

    // One staged fix per iteration.
    assert_eq!(h.ledger.pending_changes(&id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn fix_generation_failure_is_local_and_logged() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![
        Ok(dirty_outcome("src/app.php")),
        Ok(clean_outcome()),
    ]));
    let h = Harness::new(analyzer, Arc::new(FailingChat)).await;
    let file = h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 5).with_auto_apply(true)).await;
    h.agent.run(&id, Vec::new()).await;

    // The session survives; the failed fix is only a warning.
    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_issues_fixed, 0);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), BUGGY);

    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("Fix generation failed")));
    assert!(
        messages
            .iter()
            .any(|m| m.contains("No fixes applied this iteration"))
    );
}

#[tokio::test]
async fn unusable_reply_stages_nothing() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![
        Ok(dirty_outcome("src/app.php")),
        Ok(clean_outcome()),
    ]));
    // Short, unfenced, no source marker: nothing extractable.
    let chat = Arc::new(StubChat {
        reply: "I cannot fix this.".to_string(),
    });
    let h = Harness::new(analyzer, chat).await;
    let file = h.seed_file("src/app.php", BUGGY);

    let id = h.start(AgentConfig::new(5, 5)).await;
    h.agent.run(&id, Vec::new()).await;

    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_issues_fixed, 0);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), BUGGY);
    assert!(h.ledger.pending_changes(&id).await.unwrap().is_empty());

    let messages = h.log_messages(&id).await;
    assert!(
        messages
            .iter()
            .any(|m| m.contains("Fix generation failed") && m.contains("extract"))
    );
}

#[tokio::test]
async fn fileless_issue_is_skipped_with_an_error_log() {
    let mut outcome = dirty_outcome("src/app.php");
    outcome.issues[0].file = String::new();
    let analyzer = Arc::new(StubAnalyzer::new(vec![Ok(outcome), Ok(clean_outcome())]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;

    let id = h.start(AgentConfig::new(5, 5).with_auto_apply(true)).await;
    h.agent.run(&id, Vec::new()).await;

    let session = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_issues_fixed, 0);

    let messages = h.log_messages(&id).await;
    assert!(messages.iter().any(|m| m.contains("no file path")));
}

#[tokio::test]
async fn service_start_runs_to_completion() {
    let analyzer = Arc::new(StubAnalyzer::new(vec![Ok(clean_outcome())]));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer, chat).await;
    let service = AgentService::new(
        h.store.clone(),
        h.ledger.clone(),
        h.mutator.clone(),
        h.agent.clone(),
    );

    let id = service.start(AgentConfig::new(1, 5)).await.unwrap();
    let session = service.wait(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(!service.is_active(&id).await);
    assert!(service.last_log(&id).await.is_some());
}

#[tokio::test]
async fn stop_request_is_observed_between_iterations() {
    let analyzer = Arc::new(StubAnalyzer::repeating(dirty_outcome("src/app.php")));
    let chat = Arc::new(StubChat {
        reply: fenced_reply(FIXED),
    });
    let h = Harness::new(analyzer.clone(), chat).await;
    h.seed_file("src/app.php", BUGGY);
    let service = AgentService::new(
        h.store.clone(),
        h.ledger.clone(),
        h.mutator.clone(),
        h.agent.clone(),
    );

    let id = service
        .start(AgentConfig::new(5, 1000).with_auto_apply(false))
        .await
        .unwrap();
    analyzer.scanned.notified().await;
    assert!(service.stop(&id).await.unwrap());

    let session = service.wait(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert!(session.current_iteration < 1000);
}
