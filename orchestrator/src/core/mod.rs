//! Deterministic, pure logic shared by the orchestrator stages.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (agent replies, breakdowns, file specs) and return deterministic
//! outputs suitable for tests. The one seam is [`conversation::Completer`],
//! which callers implement over a real or scripted completion service.

pub mod breakdown;
pub mod code_check;
pub mod context;
pub mod contract;
pub mod conversation;
pub mod extract;
pub mod files;
pub mod imports;
pub mod repair;
pub mod retry;
pub mod test_report;
pub mod types;
