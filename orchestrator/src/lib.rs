//! Sprint execution orchestrator.
//!
//! Turns backlog stories into validated, tested source changes by driving three
//! text-producing agents (architect, developer, verifier) through a fixed
//! pipeline inside an isolated per-project workspace. The crate keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (extraction, repair, breakdown
//!   validation, contracts, content checks, retry). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem layout, snapshots,
//!   subprocesses, prompts, completion backend, events).
//! - **[`agents`]**: One wrapper per agent role, built on the retry controller.
//!
//! [`sprint`] coordinates them; [`backlog`] is the story model it updates.

pub mod agents;
pub mod backlog;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod sprint;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
