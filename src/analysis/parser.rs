//! Tool output normalization
//!
//! The tool's primary channel is a JSON report, but deprecation notices and
//! other diagnostics can precede it on stdout. The report is located with a
//! string-aware balanced-brace scan over candidate object starts; a
//! line-oriented text parser serves as the fallback.

use std::collections::HashSet;
use std::path::Path;

use super::{Issue, Severity};

/// Report extracted from the tool's JSON channel
#[derive(Debug, Default)]
pub struct ParsedReport {
    pub issues: Vec<Issue>,
    pub files_scanned: Option<u64>,
    pub total_errors: Option<u64>,
    pub files_with_errors: u64,
}

/// Locate and parse the report object in possibly-noisy stdout.
pub fn parse_json_report(stdout: &str, root: &Path) -> Option<ParsedReport> {
    let value = extract_report_object(stdout)?;

    let mut report = ParsedReport::default();

    if let Some(totals) = value.get("totals") {
        report.files_scanned = totals.get("files").and_then(|v| v.as_u64());
        report.total_errors = totals
            .get("errors")
            .and_then(|v| v.as_u64())
            .zip(totals.get("file_errors").and_then(|v| v.as_u64()))
            .map(|(e, fe)| e + fe)
            .or_else(|| totals.get("file_errors").and_then(|v| v.as_u64()))
            .or_else(|| totals.get("errors").and_then(|v| v.as_u64()));
    }

    if let Some(files) = value.get("files").and_then(|v| v.as_object()) {
        report.files_with_errors = files.len() as u64;
        for (file, entry) in files {
            let rel = relativize(file, root);
            let Some(messages) = entry.get("messages").and_then(|v| v.as_array()) else {
                continue;
            };
            for msg in messages {
                report.issues.push(Issue {
                    file: rel.clone(),
                    line: msg.get("line").and_then(|v| v.as_u64()).map(|l| l as u32),
                    message: msg
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    identifier: msg
                        .get("identifier")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    tip: msg.get("tip").and_then(|v| v.as_str()).map(|s| s.to_string()),
                    severity: msg
                        .get("severity")
                        .and_then(|v| v.as_str())
                        .and_then(Severity::from_str)
                        .unwrap_or_default(),
                });
            }
        }
    }

    // Tool-level errors have no file path; they surface as unprocessable
    // issues and fail individually downstream.
    if let Some(errors) = value.get("errors").and_then(|v| v.as_array()) {
        for err in errors {
            if let Some(message) = err.as_str() {
                report.issues.push(Issue {
                    file: String::new(),
                    line: None,
                    message: message.to_string(),
                    identifier: None,
                    tip: None,
                    severity: Severity::High,
                });
            }
        }
    }

    Some(report)
}

/// Extract the report object embedded in the text.
///
/// Candidate start positions are `{"` occurrences, tried in order; each is
/// closed with a string-aware balanced-brace scan and handed to serde. The
/// earliest candidate wins so that objects nested inside the report are not
/// mistaken for it; JSON-shaped noise is filtered by requiring at least one
/// of the report's known keys.
fn extract_report_object(text: &str) -> Option<serde_json::Value> {
    for (start, _) in text.match_indices("{\"") {
        if let Some(end) = find_balanced_end(&text[start..]) {
            let candidate = &text[start..start + end];
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                if value.get("totals").is_some() || value.get("files").is_some() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Return the byte offset one past the brace that closes the object opening
/// at offset 0, honoring string literals and escapes.
fn find_balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Fallback parser for the tool's plain-text table output.
///
/// Pattern: an indented absolute file path on its own line, followed by
/// indented `<line-number> <message>` lines.
pub fn parse_text_report(stdout: &str, root: &Path) -> Vec<Issue> {
    let mut issues = Vec::new();
    let mut current_file: Option<String> = None;

    for line in stdout.lines() {
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if indented && trimmed.starts_with('/') {
            current_file = Some(relativize(trimmed, root));
            continue;
        }

        if indented {
            if let Some(ref file) = current_file {
                let mut parts = trimmed.splitn(2, char::is_whitespace);
                if let (Some(num), Some(rest)) = (parts.next(), parts.next()) {
                    if let Ok(line_no) = num.parse::<u32>() {
                        issues.push(Issue {
                            file: file.clone(),
                            line: Some(line_no),
                            message: rest.trim().to_string(),
                            identifier: None,
                            tip: None,
                            severity: Severity::default(),
                        });
                    }
                }
            }
        } else {
            current_file = None;
        }
    }

    issues
}

/// Number of distinct files carrying at least one issue.
pub fn distinct_files(issues: &[Issue]) -> u64 {
    issues
        .iter()
        .filter(|i| !i.file.is_empty())
        .map(|i| i.file.as_str())
        .collect::<HashSet<_>>()
        .len() as u64
}

fn relativize(path: &str, root: &Path) -> String {
    Path::new(path)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}
