//! Per-story context threaded through every stage.

use crate::core::types::FailureCategory;

/// Identity of the story being processed plus the diagnostics collected so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryContext {
    pub project: String,
    pub sprint_id: u32,
    pub story_id: String,
    diagnostics: Vec<String>,
}

impl StoryContext {
    pub fn new(project: impl Into<String>, sprint_id: u32, story_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            sprint_id,
            story_id: story_id.into(),
            diagnostics: Vec::new(),
        }
    }

    pub fn note(&mut self, diagnostic: impl Into<String>) {
        self.diagnostics.push(diagnostic.into());
    }

    pub fn note_all<I, S>(&mut self, stage: &str, diagnostics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for diagnostic in diagnostics {
            self.note(format!("{stage}: {}", diagnostic.as_ref()));
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn last_diagnostic(&self) -> Option<&str> {
        self.diagnostics.last().map(String::as_str)
    }

    /// `project/sprint-N/story` for log lines.
    pub fn label(&self) -> String {
        format!("{}/sprint-{}/{}", self.project, self.sprint_id, self.story_id)
    }
}

/// A stage failure that ends the story but not the sprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryFailure {
    pub category: FailureCategory,
    pub diagnostic: String,
}

impl StoryFailure {
    pub fn new(category: FailureCategory, diagnostic: impl Into<String>) -> Self {
        Self {
            category,
            diagnostic: diagnostic.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_accumulate_in_order() {
        let mut ctx = StoryContext::new("demo", 2, "S-1");
        ctx.note("first");
        ctx.note_all("architect", ["a", "b"]);
        assert_eq!(ctx.diagnostics().len(), 3);
        assert_eq!(ctx.last_diagnostic(), Some("architect: b"));
        assert_eq!(ctx.label(), "demo/sprint-2/S-1");
    }
}
