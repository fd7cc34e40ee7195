use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::types::{FailureCategory, StoryStatus, VerificationFailure, VerificationResult};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backlog {
    pub project: String,
    #[serde(default)]
    pub stories: Vec<Story>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Story {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StoryResult>,
}

/// Outcome recorded on a story when it reaches a terminal status.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoryResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    #[serde(default)]
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSummary>,
}

/// Verification counts without the raw output (which lives in the sprint log).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationSummary {
    pub attempted: u32,
    pub passed: u32,
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerificationFailure>,
}

impl From<&VerificationResult> for VerificationSummary {
    fn from(result: &VerificationResult) -> Self {
        Self {
            attempted: result.attempted,
            passed: result.passed,
            failed: result.failed,
            reason: result.reason,
        }
    }
}

impl Story {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: description.into(),
            acceptance_criteria: Vec::new(),
            status: StoryStatus::Pending,
            result: None,
        }
    }

    /// Title when present, otherwise the description.
    pub fn headline(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(&self.description)
    }
}

impl Backlog {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            stories: Vec::new(),
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|story| story.id == id)
    }

    pub fn add_story(&mut self, story: Story) -> Result<()> {
        if story.id.trim().is_empty() {
            bail!("story id must not be empty");
        }
        if self.story(&story.id).is_some() {
            bail!("story '{}' already exists", story.id);
        }
        self.stories.push(story);
        Ok(())
    }

    /// Stories a sprint should process, in backlog order.
    pub fn schedulable(&self) -> impl Iterator<Item = &Story> {
        self.stories.iter().filter(|story| !story.status.is_terminal())
    }

    pub fn set_status(&mut self, id: &str, status: StoryStatus) -> Result<()> {
        let Some(story) = self.story_mut(id) else {
            bail!("story '{id}' not found in backlog");
        };
        story.status = status;
        if !status.is_terminal() {
            story.result = None;
        }
        Ok(())
    }

    pub fn finish(&mut self, id: &str, status: StoryStatus, result: StoryResult) -> Result<()> {
        if !status.is_terminal() {
            bail!("finish requires a terminal status (got {})", status.as_str());
        }
        let Some(story) = self.story_mut(id) else {
            bail!("story '{id}' not found in backlog");
        };
        story.status = status;
        story.result = Some(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_story_ids_are_rejected() {
        let mut backlog = Backlog::new("demo");
        backlog.add_story(Story::new("S-1", "first")).expect("add");
        let err = backlog
            .add_story(Story::new("S-1", "again"))
            .expect_err("duplicate");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn schedulable_skips_terminal_stories() {
        let mut backlog = Backlog::new("demo");
        for id in ["S-1", "S-2", "S-3"] {
            backlog.add_story(Story::new(id, id)).expect("add");
        }
        backlog
            .finish(
                "S-1",
                StoryStatus::Done,
                StoryResult {
                    category: None,
                    diagnostic: String::new(),
                    verification: None,
                },
            )
            .expect("finish");
        backlog.set_status("S-2", StoryStatus::Coding).expect("status");
        let ids: Vec<_> = backlog.schedulable().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["S-2", "S-3"]);
    }

    #[test]
    fn restarting_a_story_clears_its_result() {
        let mut backlog = Backlog::new("demo");
        backlog.add_story(Story::new("S-1", "first")).expect("add");
        backlog
            .finish(
                "S-1",
                StoryStatus::Failed,
                StoryResult {
                    category: Some(FailureCategory::Parse),
                    diagnostic: "no record".to_string(),
                    verification: None,
                },
            )
            .expect("finish");
        backlog
            .set_status("S-1", StoryStatus::Breakdown)
            .expect("status");
        assert_eq!(backlog.story("S-1").expect("story").result, None);
        assert!(backlog.finish("S-1", StoryStatus::Coding, StoryResult {
            category: None,
            diagnostic: String::new(),
            verification: None,
        })
        .is_err());
    }
}
