//! Safe file mutation
//!
//! Validates paths against an allow/deny policy, backs up existing targets,
//! syntax-checks proposed content through an isolated temporary file, and
//! commits with a temp-file + rename write. A failed commit after a backup
//! restores the backup; a failed syntax check never touches the target.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::CONFIG;

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("path rejected by policy: {0}")]
    Policy(String),
    #[error("syntax check failed: {message}")]
    Syntax {
        message: String,
        line: Option<u32>,
        excerpt: String,
    },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl MutationError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result of a successful write
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Backup location when the target pre-existed and backup was requested
    pub backup_path: Option<PathBuf>,
}

/// A single line-oriented edit: replace the content of `line` (1-based)
#[derive(Debug, Clone)]
pub struct LineEdit {
    pub line: u32,
    /// Expected current content; a mismatch is warned about, not fatal
    pub expected: Option<String>,
    pub replacement: String,
}

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// The permitted source tree; nothing outside it is ever written
    pub root: PathBuf,
    /// Backup directory (created on demand; backups are additive)
    pub backup_dir: PathBuf,
    /// Writable file extensions
    pub allowed_extensions: Vec<String>,
    /// Directory names/prefixes that must never be written into
    pub denied_dirs: Vec<String>,
    /// Syntax checker invocation; `{file}` is replaced with the temp file.
    /// None disables the check.
    pub syntax_check: Option<Vec<String>>,
}

impl MutatorConfig {
    pub fn from_global(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let backup_dir = root.join(&CONFIG.backup_dir);
        Self {
            root,
            backup_dir,
            allowed_extensions: CONFIG.allowed_extensions.clone(),
            denied_dirs: CONFIG.denied_dirs.clone(),
            syntax_check: if CONFIG.syntax_check_cmd.is_empty() {
                None
            } else {
                Some(CONFIG.syntax_check_cmd.clone())
            },
        }
    }
}

pub struct FileMutator {
    config: MutatorConfig,
}

impl FileMutator {
    pub fn new(config: MutatorConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Enforce the path policy and resolve to an absolute path.
    /// Runs before any I/O.
    fn resolve(&self, path: &str) -> Result<PathBuf, MutationError> {
        let normalized = path.replace('\\', "/");

        // Absolute paths are accepted only when they already point inside
        // the root. The comparison is component-aware: a sibling directory
        // whose name merely extends the root's is outside the tree.
        let candidate = Path::new(&normalized);
        let rel = if candidate.is_absolute() {
            match candidate.strip_prefix(&self.config.root) {
                Ok(inside) => inside.to_string_lossy().replace('\\', "/"),
                Err(_) => {
                    return Err(MutationError::Policy(format!(
                        "absolute path outside the source tree: {path}"
                    )));
                }
            }
        } else {
            normalized.clone()
        };

        if rel.is_empty() {
            return Err(MutationError::Policy("empty path".to_string()));
        }
        if rel.split('/').any(|c| c == "..") {
            return Err(MutationError::Policy(format!(
                "path traversal rejected: {path}"
            )));
        }

        for denied in &self.config.denied_dirs {
            let d = denied.trim_matches('/');
            if rel == d || rel.starts_with(&format!("{d}/")) || rel.contains(&format!("/{d}/")) {
                return Err(MutationError::Policy(format!(
                    "path inside denied directory '{denied}': {path}"
                )));
            }
        }

        let ext = Path::new(&rel)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if !self.config.allowed_extensions.iter().any(|a| a == ext) {
            return Err(MutationError::Policy(format!(
                "extension '{ext}' not in the allow-list: {path}"
            )));
        }

        Ok(self.config.root.join(rel))
    }

    /// Read a file's current content (policy-checked).
    pub async fn read(&self, path: &str) -> Result<String, MutationError> {
        let abs = self.resolve(path)?;
        match tokio::fs::read_to_string(&abs).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MutationError::NotFound(path.to_string()))
            }
            Err(e) => Err(MutationError::io(&abs, e)),
        }
    }

    /// Validate, back up, syntax-check, and atomically write `content`.
    pub async fn write(
        &self,
        path: &str,
        content: &str,
        backup: bool,
    ) -> Result<WriteOutcome, MutationError> {
        let abs = self.resolve(path)?;

        // Syntax check the proposed content before anything touches disk
        // at the target location.
        self.syntax_check(&abs, content).await?;

        let existed = abs.exists();
        let backup_path = if backup && existed {
            Some(self.take_backup(path, &abs).await?)
        } else {
            None
        };

        if let Err(e) = write_atomic(&abs, content.as_bytes()).await {
            // Never leave a partially-written target behind a taken backup.
            if let Some(ref bak) = backup_path {
                if let Err(restore_err) = tokio::fs::copy(bak, &abs).await {
                    warn!(
                        backup = %bak.display(),
                        error = %restore_err,
                        "Restore after failed write also failed"
                    );
                } else {
                    info!(file = path, "Restored backup after failed write");
                }
            }
            return Err(MutationError::io(&abs, e));
        }

        debug!(file = path, backed_up = backup_path.is_some(), "File written");
        Ok(WriteOutcome { backup_path })
    }

    /// Apply line edits in descending line order (so earlier edits don't
    /// shift later targets), then delegate to `write` for validation and
    /// persistence.
    pub async fn apply_patch(
        &self,
        path: &str,
        edits: Vec<LineEdit>,
    ) -> Result<WriteOutcome, MutationError> {
        let content = self.read(path).await?;
        let had_trailing_newline = content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();

        let mut edits = edits;
        edits.sort_by(|a, b| b.line.cmp(&a.line));

        for edit in &edits {
            let idx = edit.line.saturating_sub(1) as usize;
            if idx >= lines.len() {
                warn!(
                    file = path,
                    line = edit.line,
                    "Edit beyond end of file, skipped"
                );
                continue;
            }
            if let Some(ref expected) = edit.expected {
                if lines[idx].trim() != expected.trim() {
                    warn!(
                        file = path,
                        line = edit.line,
                        "Expected line content does not match, applying anyway"
                    );
                }
            }
            lines[idx] = edit.replacement.clone();
        }

        let mut new_content = lines.join("\n");
        if had_trailing_newline {
            new_content.push('\n');
        }
        self.write(path, &new_content, true).await
    }

    /// Restore a backup over the target path.
    pub async fn restore(&self, backup_path: &Path, path: &str) -> Result<(), MutationError> {
        let abs = self.resolve(path)?;
        tokio::fs::copy(backup_path, &abs)
            .await
            .map_err(|e| MutationError::io(&abs, e))?;
        info!(file = path, backup = %backup_path.display(), "Backup restored");
        Ok(())
    }

    /// Copy the current target to a timestamped backup location.
    /// Backups are additive; an occupied name gets a counter suffix.
    async fn take_backup(&self, rel: &str, abs: &Path) -> Result<PathBuf, MutationError> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let flat = rel.replace('/', "_");
        let mut candidate = self.config.backup_dir.join(format!("{flat}.{stamp}.bak"));
        let mut counter = 1;
        while candidate.exists() {
            candidate = self
                .config
                .backup_dir
                .join(format!("{flat}.{stamp}.{counter}.bak"));
            counter += 1;
        }

        tokio::fs::create_dir_all(&self.config.backup_dir)
            .await
            .map_err(|e| MutationError::io(&self.config.backup_dir, e))?;
        tokio::fs::copy(abs, &candidate)
            .await
            .map_err(|e| MutationError::io(&candidate, e))?;
        debug!(file = rel, backup = %candidate.display(), "Backup taken");
        Ok(candidate)
    }

    /// Run the configured syntax checker against the proposed content in an
    /// isolated temp file. An error aborts the write.
    async fn syntax_check(&self, target: &Path, content: &str) -> Result<(), MutationError> {
        let Some(ref cmd) = self.config.syntax_check else {
            return Ok(());
        };
        if cmd.is_empty() {
            return Ok(());
        }

        let tmp_dir = self.config.backup_dir.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| MutationError::io(&tmp_dir, e))?;

        let ext = target
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("tmp");
        let tmp_file = tmp_dir.join(format!(
            "check.{}.{}.{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros(),
            ext
        ));
        tokio::fs::write(&tmp_file, content)
            .await
            .map_err(|e| MutationError::io(&tmp_file, e))?;

        let tmp_str = tmp_file.to_string_lossy();
        let program = cmd[0].replace("{file}", &tmp_str);
        let args: Vec<String> = cmd[1..]
            .iter()
            .map(|a| a.replace("{file}", &tmp_str))
            .collect();

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let _ = tokio::fs::remove_file(&tmp_file).await;

        let output = output.map_err(|e| MutationError::io(Path::new(&program), e))?;
        if output.status.success() {
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        let line = parse_error_line(&combined);
        Err(MutationError::Syntax {
            message: combined.trim().to_string(),
            line,
            excerpt: excerpt(content, line),
        })
    }
}

/// Temp-file + rename write with parent-directory creation; mirrors
/// existing permissions on Unix.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let pid = std::process::id();
        let mut tmp = path.to_path_buf();
        let suffix = format!("tmp.{pid}.{ts}");
        let new_ext = match path.extension().and_then(|e| e.to_str()) {
            Some(orig) => format!("{orig}.{suffix}"),
            None => suffix,
        };
        tmp.set_extension(new_ext);
        tmp
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            let mode = meta.permissions().mode();
            let _ = tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode))
                .await;
        } else {
            let _ = tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o644))
                .await;
        }
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    tokio::fs::rename(&temp_path, &path).await?;
    Ok(())
}

/// Pull a line number out of checker output ("... on line 3", "...:3").
fn parse_error_line(output: &str) -> Option<u32> {
    if let Some(pos) = output.rfind("line ") {
        let digits: String = output[pos + 5..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(n) = digits.parse() {
            return Some(n);
        }
    }
    // Fallback: last ":<digits>" occurrence
    for part in output.rsplit(':') {
        let trimmed = part.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            return trimmed.parse().ok();
        }
    }
    None
}

/// A small context excerpt around the offending line of the proposed content.
fn excerpt(content: &str, line: Option<u32>) -> String {
    let Some(line) = line else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let center = (line as usize).clamp(1, lines.len());
    let start = center.saturating_sub(3);
    let end = (center + 2).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, l)| format!("{:>4} | {}", start + i + 1, l))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mutator(dir: &TempDir, syntax_check: Option<Vec<String>>) -> FileMutator {
        FileMutator::new(MutatorConfig {
            root: dir.path().to_path_buf(),
            backup_dir: dir.path().join(".backups"),
            allowed_extensions: vec!["php".to_string(), "src".to_string()],
            denied_dirs: vec!["vendor".to_string(), ".git".to_string(), ".backups".to_string()],
            syntax_check,
        })
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let m = mutator(&dir, None);
        let content = "<?php\necho 'hello';\n";
        m.write("src/a.php", content, true).await.unwrap();
        assert_eq!(m.read("src/a.php").await.unwrap(), content);
    }

    #[tokio::test]
    async fn traversal_and_denied_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let m = mutator(&dir, None);
        for bad in [
            "../outside.php",
            "src/../../etc/passwd.php",
            "vendor/lib.php",
            "src/vendor/lib.php",
            "/etc/evil.php",
            "notes.txt",
        ] {
            let err = m.write(bad, "x", false).await.unwrap_err();
            assert!(matches!(err, MutationError::Policy(_)), "{bad}: {err}");
        }
    }

    #[tokio::test]
    async fn sibling_directory_extending_the_root_name_is_outside() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        let m = FileMutator::new(MutatorConfig {
            root: root.clone(),
            backup_dir: root.join(".backups"),
            allowed_extensions: vec!["php".to_string()],
            denied_dirs: vec![],
            syntax_check: None,
        });

        // `<parent>/project2` shares the root's name as a string prefix but
        // is a different directory entirely.
        let sibling = dir.path().join("project2").join("a.php");
        let err = m
            .write(&sibling.to_string_lossy(), "<?php\n", false)
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Policy(_)), "{err}");
        assert!(!root.join("2").exists());
        assert!(!sibling.exists());

        // An absolute path genuinely inside the root still resolves.
        let inside = root.join("src").join("a.php");
        m.write(&inside.to_string_lossy(), "<?php\n", false)
            .await
            .unwrap();
        assert!(inside.exists());
    }

    #[tokio::test]
    async fn backup_is_taken_for_existing_files_only() {
        let dir = TempDir::new().unwrap();
        let m = mutator(&dir, None);

        let first = m.write("src/a.php", "v1\n", true).await.unwrap();
        assert!(first.backup_path.is_none());

        let second = m.write("src/a.php", "v2\n", true).await.unwrap();
        let backup = second.backup_path.expect("backup for pre-existing file");
        assert!(backup.exists());
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "v1\n");
        assert_eq!(m.read("src/a.php").await.unwrap(), "v2\n");
    }

    #[tokio::test]
    async fn failed_syntax_check_leaves_file_unchanged() {
        let dir = TempDir::new().unwrap();
        let failing = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'Parse error: unexpected token on line 2' >&2; exit 1".to_string(),
        ];
        let ok = mutator(&dir, None);
        ok.write("src/a.php", "original\n", false).await.unwrap();

        let m = mutator(&dir, Some(failing));
        let err = m.write("src/a.php", "broken content\n", true).await.unwrap_err();
        match err {
            MutationError::Syntax { line, ref message, .. } => {
                assert_eq!(line, Some(2));
                assert!(message.contains("Parse error"));
            }
            other => panic!("expected syntax error, got {other}"),
        }
        assert_eq!(ok.read("src/a.php").await.unwrap(), "original\n");
    }

    #[tokio::test]
    async fn passing_syntax_check_commits_the_write() {
        let dir = TempDir::new().unwrap();
        let m = mutator(&dir, Some(vec!["true".to_string()]));
        m.write("src/a.php", "ok\n", false).await.unwrap();
        assert_eq!(m.read("src/a.php").await.unwrap(), "ok\n");
    }

    #[tokio::test]
    async fn restore_reinstates_backup_content() {
        let dir = TempDir::new().unwrap();
        let m = mutator(&dir, None);
        m.write("src/a.php", "v1\n", true).await.unwrap();
        let outcome = m.write("src/a.php", "v2\n", true).await.unwrap();
        let backup = outcome.backup_path.unwrap();
        m.restore(&backup, "src/a.php").await.unwrap();
        assert_eq!(m.read("src/a.php").await.unwrap(), "v1\n");
    }

    #[tokio::test]
    async fn patch_applies_in_descending_order() {
        let dir = TempDir::new().unwrap();
        let m = mutator(&dir, None);
        m.write("src/a.php", "one\ntwo\nthree\n", true).await.unwrap();

        m.apply_patch(
            "src/a.php",
            vec![
                LineEdit {
                    line: 1,
                    expected: Some("one".to_string()),
                    replacement: "ONE".to_string(),
                },
                LineEdit {
                    line: 3,
                    expected: Some("wrong expectation".to_string()),
                    replacement: "THREE".to_string(),
                },
            ],
        )
        .await
        .unwrap();

        assert_eq!(m.read("src/a.php").await.unwrap(), "ONE\ntwo\nTHREE\n");
    }

    #[test]
    fn error_line_parsing() {
        assert_eq!(
            parse_error_line("PHP Parse error: unexpected ';' in /tmp/x.php on line 3"),
            Some(3)
        );
        assert_eq!(parse_error_line("src/a.php:17"), Some(17));
        assert_eq!(parse_error_line("no line info"), None);
    }
}
