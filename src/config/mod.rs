// src/config/mod.rs
// Runtime configuration loaded from the environment (with .env support).

use once_cell::sync::Lazy;
use std::time::Duration;

/// Global configuration handle. Loads `.env` once, then reads the
/// environment with per-field defaults.
pub static CONFIG: Lazy<RemedianConfig> = Lazy::new(RemedianConfig::from_env);

#[derive(Debug, Clone)]
pub struct RemedianConfig {
    // ── Database
    pub database_url: String,

    // ── Static-analysis tool
    pub tool_binary: String,
    pub tool_config_candidates: Vec<String>,
    pub default_scan_paths: Vec<String>,
    pub minimum_level: u8,
    pub scan_timeout_secs: u64,
    pub tool_memory_limit: Option<String>,
    pub tool_baseline: Option<String>,

    // ── Language-model collaborator
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_timeout_secs: u64,

    // ── File mutation policy
    pub backup_dir: String,
    pub allowed_extensions: Vec<String>,
    pub denied_dirs: Vec<String>,
    pub syntax_check_cmd: Vec<String>,

    // ── Agent loop tuning
    pub default_max_iterations: u32,
    pub auto_apply: bool,
    pub context_margin: u32,
    pub pause_poll_interval: Duration,
    pub pause_max_ticks: u32,
    pub iteration_delay: Duration,
    pub last_log_ttl: Duration,
}

impl RemedianConfig {
    pub fn from_env() -> Self {
        // Best-effort: a missing .env is fine.
        let _ = dotenvy::dotenv();

        Self {
            database_url: env_or("REMEDIAN_DATABASE_URL", "sqlite://remedian.db?mode=rwc"),

            tool_binary: env_or("REMEDIAN_TOOL_BINARY", "phpstan"),
            tool_config_candidates: env_list(
                "REMEDIAN_TOOL_CONFIG_CANDIDATES",
                &["phpstan.neon", "phpstan.neon.dist", "phpstan.dist.neon"],
            ),
            default_scan_paths: env_list("REMEDIAN_SCAN_PATHS", &["src"]),
            minimum_level: env_parse("REMEDIAN_MINIMUM_LEVEL", 1u8),
            scan_timeout_secs: env_parse("REMEDIAN_SCAN_TIMEOUT", 300u64),
            tool_memory_limit: std::env::var("REMEDIAN_TOOL_MEMORY_LIMIT").ok(),
            tool_baseline: std::env::var("REMEDIAN_TOOL_BASELINE").ok(),

            llm_base_url: env_or("REMEDIAN_LLM_BASE_URL", "https://api.anthropic.com"),
            llm_api_key: env_or("ANTHROPIC_API_KEY", ""),
            llm_model: env_or("REMEDIAN_LLM_MODEL", "claude-sonnet-4-0"),
            llm_max_tokens: env_parse("REMEDIAN_LLM_MAX_TOKENS", 8192u32),
            llm_timeout_secs: env_parse("REMEDIAN_LLM_TIMEOUT", 120u64),

            backup_dir: env_or("REMEDIAN_BACKUP_DIR", ".remedian/backups"),
            allowed_extensions: env_list("REMEDIAN_ALLOWED_EXTENSIONS", &["php", "phtml"]),
            denied_dirs: env_list(
                "REMEDIAN_DENIED_DIRS",
                &[
                    "vendor",
                    "node_modules",
                    ".git",
                    "storage",
                    "bootstrap/cache",
                    "public",
                    "dist",
                    "build",
                    ".remedian",
                ],
            ),
            syntax_check_cmd: env_list("REMEDIAN_SYNTAX_CHECK_CMD", &["php", "-l", "{file}"]),

            default_max_iterations: env_parse("REMEDIAN_MAX_ITERATIONS", 5u32),
            auto_apply: env_parse("REMEDIAN_AUTO_APPLY", false),
            context_margin: env_parse("REMEDIAN_CONTEXT_MARGIN", 20u32),
            pause_poll_interval: Duration::from_millis(env_parse(
                "REMEDIAN_PAUSE_POLL_MS",
                1000u64,
            )),
            pause_max_ticks: env_parse("REMEDIAN_PAUSE_MAX_TICKS", 300u32),
            iteration_delay: Duration::from_millis(env_parse("REMEDIAN_ITERATION_DELAY_MS", 500u64)),
            last_log_ttl: Duration::from_secs(env_parse("REMEDIAN_LAST_LOG_TTL", 60u64)),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}
