//! Project stack metadata (`stack.json`), recorded by the first breakdown that declares one.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::types::StackMetadata;
use crate::io::atomic::write_json_atomic;

/// Load stack metadata, `None` when the project has not recorded one yet.
pub fn load_stack(path: &Path) -> Result<Option<StackMetadata>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read stack {}", path.display()))?;
    let stack: StackMetadata = serde_json::from_str(&contents)
        .with_context(|| format!("parse stack {}", path.display()))?;
    Ok((!stack.is_empty()).then_some(stack))
}

/// Persist `stack` unless metadata already exists. Returns whether it was written.
pub fn record_stack_once(path: &Path, stack: &StackMetadata) -> Result<bool> {
    if stack.is_empty() {
        return Ok(false);
    }
    if load_stack(path)?.is_some() {
        debug!(path = %path.display(), "stack already recorded");
        return Ok(false);
    }
    write_json_atomic(path, stack)?;
    info!(backend = ?stack.backend, test_framework = ?stack.test_framework, "recorded project stack");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(backend: &str) -> StackMetadata {
        StackMetadata {
            backend: Some(backend.to_string()),
            ..StackMetadata::default()
        }
    }

    #[test]
    fn first_declared_stack_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stack.json");
        assert_eq!(load_stack(&path).expect("load"), None);
        assert!(!record_stack_once(&path, &StackMetadata::default()).expect("empty"));
        assert!(record_stack_once(&path, &stack("express")).expect("first"));
        assert!(!record_stack_once(&path, &stack("flask")).expect("second"));
        assert_eq!(load_stack(&path).expect("load"), Some(stack("express")));
    }
}
