//! Backlog load/save helpers with schema + invariant validation.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;

use crate::backlog::Backlog;
use crate::io::atomic::write_json_atomic;

const BACKLOG_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/backlog/v1.schema.json"
));

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(BACKLOG_SCHEMA).expect("bundled backlog schema json");
    validator_for(&schema).expect("bundled backlog schema")
});

/// Load and validate a backlog (schema + unique story ids).
pub fn load_backlog(path: &Path) -> Result<Backlog> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read backlog {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse backlog {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate backlog {}", path.display()))?;
    let backlog: Backlog = serde_json::from_value(value)
        .with_context(|| format!("deserialize backlog {}", path.display()))?;
    validate_invariants(&backlog)
        .with_context(|| format!("validate backlog {}", path.display()))?;
    Ok(backlog)
}

/// Write the backlog atomically with stable formatting.
pub fn write_backlog(path: &Path, backlog: &Backlog) -> Result<()> {
    validate_invariants(backlog)?;
    write_json_atomic(path, backlog)
}

fn validate_schema(value: &Value) -> Result<()> {
    if VALIDATOR.is_valid(value) {
        return Ok(());
    }
    let messages = VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(anyhow!(
        "backlog schema validation failed: {}",
        messages.join("; ")
    ))
}

fn validate_invariants(backlog: &Backlog) -> Result<()> {
    let mut seen = BTreeSet::new();
    for story in &backlog.stories {
        if !seen.insert(story.id.as_str()) {
            return Err(anyhow!("duplicate story id '{}'", story.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{Story, StoryResult, VerificationSummary};
    use crate::core::types::{FailureCategory, StoryStatus, VerificationFailure};

    #[test]
    fn write_then_load_keeps_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("backlog.json");
        let mut backlog = Backlog::new("demo");
        backlog.add_story(Story::new("S-1", "first")).expect("add");
        backlog
            .finish(
                "S-1",
                StoryStatus::Failed,
                StoryResult {
                    category: Some(FailureCategory::Verification),
                    diagnostic: "2 failing".to_string(),
                    verification: Some(VerificationSummary {
                        attempted: 3,
                        passed: 1,
                        failed: 2,
                        reason: Some(VerificationFailure::Failures),
                    }),
                },
            )
            .expect("finish");
        write_backlog(&path, &backlog).expect("write");
        assert_eq!(load_backlog(&path).expect("load"), backlog);
    }

    #[test]
    fn unknown_status_fails_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("backlog.json");
        fs::write(
            &path,
            r#"{"project":"demo","stories":[{"id":"S-1","description":"d","status":"blocked"}]}"#,
        )
        .expect("write");
        let err = load_backlog(&path).expect_err("schema");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn duplicate_ids_fail_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("backlog.json");
        fs::write(
            &path,
            r#"{"project":"demo","stories":[
                {"id":"S-1","description":"a","status":"pending"},
                {"id":"S-1","description":"b","status":"done"}
            ]}"#,
        )
        .expect("write");
        let err = load_backlog(&path).expect_err("duplicate");
        assert!(format!("{err:#}").contains("duplicate story id"));
    }
}
