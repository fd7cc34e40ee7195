//! I/O helpers for orchestrator commands.

pub mod atomic;
pub mod backlog_store;
pub mod completer;
pub mod config;
pub mod events;
pub mod init;
pub mod locks;
pub mod process;
pub mod prompt;
pub mod snapshot;
pub mod sprint_log;
pub mod stack;
pub mod verify;
pub mod workspace;
