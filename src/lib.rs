// src/lib.rs

pub mod agent;
pub mod analysis;
pub mod config;
pub mod db;
pub mod file_ops;
pub mod fixer;
pub mod ledger;
pub mod llm;

pub use agent::service::AgentService;
pub use agent::types::{AgentConfig, Session, SessionStatus};
