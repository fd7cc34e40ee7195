//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `sprint`, every processed story finished `done`.
pub const OK: i32 = 0;
/// Invalid input, layout, config, or an infrastructure failure.
pub const INVALID: i32 = 1;
/// `extract` found no structured record, or a named project/snapshot is missing.
pub const NOT_FOUND: i32 = 2;
/// `sprint` completed but at least one story failed; `check-breakdown` rejected the record.
pub const STORIES_FAILED: i32 = 3;
/// `sprint` was cancelled between stories.
pub const CANCELLED: i32 = 4;
