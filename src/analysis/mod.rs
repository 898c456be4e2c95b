//! Static-analysis runner
//!
//! Locates and invokes the external analysis tool as a subprocess, resolves
//! configuration precedence (request > tool config file > built-in default),
//! and normalizes its output into structured issues.

pub mod parser;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CONFIG;

// ============================================================================
// Findings
// ============================================================================

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// One static-analysis finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Source-tree-relative file path; empty when the tool reported a
    /// finding without a file (such findings cannot be processed)
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
    pub identifier: Option<String>,
    pub tip: Option<String>,
    pub severity: Severity,
}

/// Summary counters from one scan
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub files_scanned: u64,
    pub total_errors: u64,
    pub files_with_errors: u64,
}

/// Normalized result of one scan
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub issues: Vec<Issue>,
    pub summary: ScanSummary,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("analysis tool not found: {0}")]
    ToolMissing(String),
    #[error("no valid scan paths (nothing to analyze)")]
    NoValidPaths,
    #[error("tool scanned zero files; refusing to treat this as a clean result")]
    NothingScanned,
    #[error("analysis tool failed with exit code {code}: {stderr}")]
    Tool { code: i32, stderr: String },
    #[error("analysis tool timed out after {0}s")]
    Timeout(u64),
    #[error("could not parse tool output: {0}")]
    Parse(String),
    #[error("failed to invoke analysis tool: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Analyzer seam
// ============================================================================

/// Scan parameters resolved by the caller; unset fields fall back to the
/// tool's own config file and then to built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub level: Option<u8>,
    pub paths: Vec<String>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutcome, ScanError>;
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Tool binary: a path (checked as-is, then relative to the root) or a
    /// bare name probed on PATH
    pub binary: String,
    /// Source tree the tool runs against
    pub project_root: PathBuf,
    /// Config files probed in order inside the root
    pub config_candidates: Vec<String>,
    /// Fallback paths when neither the request nor the tool config name any
    pub default_paths: Vec<String>,
    /// Fallback strictness level
    pub minimum_level: u8,
    pub timeout_secs: u64,
    pub memory_limit: Option<String>,
    pub baseline: Option<String>,
    /// Extensions counted when deciding whether anything was scanned
    pub source_extensions: Vec<String>,
}

impl AnalyzerConfig {
    /// Build from the global config for the given source tree.
    pub fn from_global(project_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: CONFIG.tool_binary.clone(),
            project_root: project_root.into(),
            config_candidates: CONFIG.tool_config_candidates.clone(),
            default_paths: CONFIG.default_scan_paths.clone(),
            minimum_level: CONFIG.minimum_level,
            timeout_secs: CONFIG.scan_timeout_secs,
            memory_limit: CONFIG.tool_memory_limit.clone(),
            baseline: CONFIG.tool_baseline.clone(),
            source_extensions: CONFIG.allowed_extensions.clone(),
        }
    }
}

/// Invokes the static-analysis tool and normalizes its output.
pub struct AnalysisRunner {
    config: AnalyzerConfig,
}

impl AnalysisRunner {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Resolve the tool executable, failing fast with a descriptive error.
    fn resolve_binary(&self) -> Result<PathBuf, ScanError> {
        let bin = Path::new(&self.config.binary);

        if bin.components().count() > 1 {
            if bin.is_file() {
                return Ok(bin.to_path_buf());
            }
            let in_root = self.config.project_root.join(bin);
            if in_root.is_file() {
                return Ok(in_root);
            }
            return Err(ScanError::ToolMissing(format!(
                "{} (not found as given or under {})",
                self.config.binary,
                self.config.project_root.display()
            )));
        }

        // Bare name: probe PATH
        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(bin);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        Err(ScanError::ToolMissing(format!(
            "{} (not on PATH; set REMEDIAN_TOOL_BINARY)",
            self.config.binary
        )))
    }

    /// Probe the tool's own config file for `level:` and `paths:` entries.
    ///
    /// A light line scan, deliberately not a full config-language parser:
    /// discovered values only fill gaps the caller left, and the tool itself
    /// still reads its config.
    fn discover_tool_config(&self) -> (Option<u8>, Vec<String>, Option<PathBuf>) {
        for candidate in &self.config.config_candidates {
            let path = self.config.project_root.join(candidate);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };

            let mut level = None;
            let mut paths = Vec::new();
            let mut in_paths = false;
            for line in content.lines() {
                let trimmed = line.trim();
                if let Some(rest) = trimmed.strip_prefix("level:") {
                    level = rest.trim().parse().ok();
                    in_paths = false;
                } else if trimmed == "paths:" {
                    in_paths = true;
                } else if in_paths {
                    if let Some(entry) = trimmed.strip_prefix("- ") {
                        paths.push(entry.trim().trim_matches('\'').trim_matches('"').to_string());
                    } else if !trimmed.is_empty() && !trimmed.starts_with('-') {
                        in_paths = false;
                    }
                }
            }

            debug!(config = %path.display(), ?level, ?paths, "Discovered tool config");
            return (level, paths, Some(path));
        }
        (None, Vec::new(), None)
    }

    /// Keep only paths that exist under the project root.
    fn validate_paths(&self, paths: &[String]) -> Vec<PathBuf> {
        paths
            .iter()
            .map(|p| self.config.project_root.join(p))
            .filter(|p| p.exists())
            .collect()
    }

    /// Count source files under the given paths; the basis for telling
    /// "clean scan" apart from "nothing was scanned".
    fn count_source_files(&self, paths: &[PathBuf]) -> u64 {
        let mut count = 0u64;
        for path in paths {
            if path.is_file() {
                count += 1;
                continue;
            }
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let ext = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("");
                if self.config.source_extensions.iter().any(|a| a == ext) {
                    count += 1;
                }
            }
        }
        count
    }
}

#[async_trait]
impl Analyzer for AnalysisRunner {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutcome, ScanError> {
        let binary = self.resolve_binary()?;
        let (config_level, config_paths, config_file) = self.discover_tool_config();

        // Precedence: explicit request > tool config > built-in defaults
        let level = request
            .level
            .or(config_level)
            .unwrap_or(self.config.minimum_level);
        let raw_paths = if !request.paths.is_empty() {
            request.paths.clone()
        } else if !config_paths.is_empty() {
            config_paths
        } else {
            self.config.default_paths.clone()
        };

        let paths = self.validate_paths(&raw_paths);
        if paths.is_empty() {
            return Err(ScanError::NoValidPaths);
        }
        let discovered_files = self.count_source_files(&paths);

        let mut cmd = Command::new(&binary);
        cmd.arg("analyse")
            .arg("--error-format=json")
            .arg("--no-progress")
            .arg("--level")
            .arg(level.to_string());
        if let Some(ref cfg) = config_file {
            cmd.arg("--configuration").arg(cfg);
        }
        if let Some(ref limit) = self.config.memory_limit {
            cmd.arg("--memory-limit").arg(limit);
        }
        if let Some(ref baseline) = self.config.baseline {
            cmd.arg("--baseline").arg(baseline);
        }
        for path in &paths {
            cmd.arg(path);
        }
        cmd.current_dir(&self.config.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            tool = %binary.display(),
            level,
            paths = paths.len(),
            "Invoking static-analysis tool"
        );

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ScanError::Timeout(self.config.timeout_secs)),
        };

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // 0 = clean, 1 = issues found (normal); anything else is a tool failure
        if code != 0 && code != 1 {
            return Err(ScanError::Tool {
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        let outcome = match parser::parse_json_report(&stdout, &self.config.project_root) {
            Some(report) => {
                let files_scanned = report.files_scanned.unwrap_or(discovered_files);
                let files_with_errors = report.files_with_errors;
                let total_errors = report
                    .total_errors
                    .unwrap_or(report.issues.len() as u64);
                ScanOutcome {
                    issues: report.issues,
                    summary: ScanSummary {
                        files_scanned,
                        total_errors,
                        files_with_errors,
                    },
                }
            }
            None => {
                // Structured channel absent or mangled: line-oriented fallback
                let issues = parser::parse_text_report(&stdout, &self.config.project_root);
                if issues.is_empty() && code == 1 {
                    return Err(ScanError::Parse(
                        "tool reported findings but output was not parseable".to_string(),
                    ));
                }
                warn!("Structured output unavailable, used text fallback");
                let files_with_errors = parser::distinct_files(&issues);
                let total_errors = issues.len() as u64;
                ScanOutcome {
                    issues,
                    summary: ScanSummary {
                        files_scanned: discovered_files,
                        total_errors,
                        files_with_errors,
                    },
                }
            }
        };

        // Zero issues because nothing was scanned is a hard error, not a
        // clean result. A report that still carries findings is kept even
        // when its file total is zero.
        if outcome.summary.files_scanned == 0 && outcome.issues.is_empty() {
            return Err(ScanError::NothingScanned);
        }

        debug!(
            issues = outcome.issues.len(),
            files = outcome.summary.files_scanned,
            "Scan complete"
        );
        Ok(outcome)
    }
}
