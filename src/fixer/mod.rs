//! Fix generation
//!
//! Builds a deterministic remediation prompt from an issue plus surrounding
//! file context, delegates to the chat collaborator, and extracts a
//! candidate full-file replacement from the reply.

use std::sync::Arc;
use tracing::debug;

use crate::analysis::Issue;
use crate::llm::{ChatCollaborator, ChatRequest};

const SYSTEM_PROMPT: &str = "You are an automated code-remediation assistant. \
You receive one static-analysis finding and the full content of the affected \
file. Return the complete corrected file in exactly one fenced code block. \
Fix only the reported issue; change nothing else. Do not add commentary \
outside the code block.";

/// Minimum reply length for the no-fence fallback to even be considered.
const FALLBACK_MIN_LEN: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum FixError {
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("could not extract fixed code from the reply")]
    NoCode,
}

/// A candidate full-file replacement
#[derive(Debug, Clone)]
pub struct GeneratedFix {
    pub content: String,
    pub tokens_used: Option<u32>,
}

pub struct FixGenerator {
    collaborator: Arc<dyn ChatCollaborator>,
    /// Markers that identify a bare reply as source code when no fence is
    /// present (e.g. the language's file opener)
    file_markers: Vec<String>,
}

impl FixGenerator {
    pub fn new(collaborator: Arc<dyn ChatCollaborator>) -> Self {
        Self {
            collaborator,
            file_markers: vec!["<?php".to_string()],
        }
    }

    pub fn with_file_markers(mut self, markers: Vec<String>) -> Self {
        self.file_markers = markers;
        self
    }

    /// Ask the collaborator for a corrected version of the whole file.
    pub async fn generate(
        &self,
        file_path: &str,
        file_content: &str,
        issue: &Issue,
        context_snippet: &str,
    ) -> Result<GeneratedFix, FixError> {
        let prompt = build_prompt(file_path, file_content, issue, context_snippet);
        debug!(file = file_path, prompt_len = prompt.len(), "Requesting fix");

        let reply = self
            .collaborator
            .chat(ChatRequest::new(prompt).with_system(SYSTEM_PROMPT))
            .await
            .map_err(|e| FixError::Collaborator(e.0))?;

        let content = extract_code(&reply.message, &self.file_markers).ok_or(FixError::NoCode)?;
        Ok(GeneratedFix {
            content,
            tokens_used: reply.tokens_used,
        })
    }
}

/// Deterministic prompt assembly: identical inputs produce identical prompts.
fn build_prompt(file_path: &str, file_content: &str, issue: &Issue, context_snippet: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("File: {file_path}\n"));
    match issue.line {
        Some(line) => prompt.push_str(&format!("Line: {line}\n")),
        None => prompt.push_str("Line: unknown\n"),
    }
    prompt.push_str(&format!("Issue: {}\n", issue.message));
    if let Some(ref id) = issue.identifier {
        prompt.push_str(&format!("Rule: {id}\n"));
    }
    if let Some(ref tip) = issue.tip {
        prompt.push_str(&format!("Tip: {tip}\n"));
    }
    prompt.push_str("\nContext around the reported line:\n```\n");
    prompt.push_str(context_snippet);
    if !context_snippet.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str("```\n\nFull file content:\n```\n");
    prompt.push_str(file_content);
    if !file_content.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str("```\n\nReturn the complete corrected file in one fenced code block. Change nothing besides the fix for the reported issue.\n");
    prompt
}

/// Compute a bounded context window around a line, clamped to file bounds.
/// Lines are 1-based; a missing line yields the head of the file.
pub fn context_window(content: &str, line: Option<u32>, margin: u32) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let center = line.unwrap_or(1).max(1) as usize;
    let start = center.saturating_sub(margin as usize + 1);
    let end = (center + margin as usize).min(lines.len());
    lines[start.min(lines.len() - 1)..end].join("\n")
}

/// Pull source code out of a collaborator reply.
///
/// Prefers the first fenced code block. A bare reply is accepted only when
/// it is non-trivially long and carries an unambiguous source-file marker;
/// anything else is rejected rather than guessed at.
fn extract_code(reply: &str, file_markers: &[String]) -> Option<String> {
    if let Some(start) = reply.find("```") {
        let after = &reply[start + 3..];
        if let Some(nl) = after.find('\n') {
            let body = &after[nl + 1..];
            let block = match body.find("```") {
                Some(end) => &body[..end],
                // Truncated reply: take what is there rather than dropping
                // an otherwise well-formed block
                None => body,
            };
            let trimmed = block.trim_end();
            if !trimmed.is_empty() {
                let mut code = trimmed.to_string();
                code.push('\n');
                return Some(code);
            }
        }
    }

    let trimmed = reply.trim();
    if trimmed.len() >= FALLBACK_MIN_LEN && file_markers.iter().any(|m| trimmed.contains(m.as_str()))
    {
        let mut code = trimmed.trim_end().to_string();
        code.push('\n');
        return Some(code);
    }

    None
}
