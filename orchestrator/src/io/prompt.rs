//! Prompt builders for the architect, developer and verification agents.
//!
//! Templates mark each block with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go
//! first and the last remaining section is truncated if that is not enough.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::backlog::Story;
use crate::core::types::{FileSpec, StackMetadata, Task, TaskBreakdown};

const ARCHITECT_TEMPLATE: &str = include_str!("prompts/architect.md");
const DEVELOPER_TEMPLATE: &str = include_str!("prompts/developer.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const VERIFIER_TEMPLATE: &str = include_str!("prompts/verifier.md");
const MISSING_TASKS_TEMPLATE: &str = include_str!("prompts/missing_tasks.md");

const SEPARATOR: &str = "\n\n";

/// Drop order when over budget: least useful context first.
const DROP_ORDER: &[&str] = &["workspace", "design", "previous", "stack", "existing"];

/// Agent roles with their own persona file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Architect,
    Developer,
    Verifier,
}

impl Persona {
    pub const ALL: [Persona; 3] = [Persona::Architect, Persona::Developer, Persona::Verifier];

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Architect => "architect",
            Persona::Developer => "developer",
            Persona::Verifier => "verifier",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.md", self.as_str())
    }

    /// Built-in system instructions used when the project has no persona file.
    pub fn fallback(self) -> &'static str {
        match self {
            Persona::Architect => {
                "You are a software architect. Break stories into small, ordered implementation tasks."
            }
            Persona::Developer => {
                "You are a senior developer. Write complete, working files exactly as requested."
            }
            Persona::Verifier => {
                "You are a test engineer. Write focused automated tests for the acceptance criteria."
            }
        }
    }
}

/// Read `<personas_dir>/<role>.md`, falling back to the built-in text when the
/// file is missing or blank.
pub fn load_persona(personas_dir: &Path, persona: Persona) -> Result<String> {
    let path = personas_dir.join(persona.file_name());
    if !path.exists() {
        debug!(persona = persona.as_str(), "persona file missing; using fallback");
        return Ok(persona.fallback().to_string());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read persona {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(persona.fallback().to_string());
    }
    Ok(contents)
}

pub struct ArchitectInputs<'a> {
    pub story: &'a Story,
    pub stack: Option<&'a StackMetadata>,
    pub design: Option<&'a str>,
    pub workspace_files: &'a [String],
}

pub struct DeveloperInputs<'a> {
    pub story: &'a Story,
    pub breakdown: &'a TaskBreakdown,
    pub task: &'a Task,
    pub allowed_files: Vec<String>,
    pub allowed_deps: Vec<String>,
    /// Current contents of the files the task modifies.
    pub existing: &'a [FileSpec],
    /// One line per task already finished in this story.
    pub completed: &'a [String],
}

pub struct FixInputs<'a> {
    pub story: &'a Story,
    pub allowed_files: Vec<String>,
    pub allowed_deps: Vec<String>,
    pub files: &'a [FileSpec],
    pub output: &'a str,
}

pub struct VerifierInputs<'a> {
    pub story: &'a Story,
    pub stack: Option<&'a StackMetadata>,
    pub files: &'a [FileSpec],
}

#[derive(Serialize)]
struct StoryView<'a> {
    id: &'a str,
    title: Option<&'a str>,
    description: &'a str,
    acceptance_criteria: &'a [String],
}

impl<'a> From<&'a Story> for StoryView<'a> {
    fn from(story: &'a Story) -> Self {
        Self {
            id: &story.id,
            title: story.title.as_deref(),
            description: story.description.trim(),
            acceptance_criteria: &story.acceptance_criteria,
        }
    }
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("architect", ARCHITECT_TEMPLATE),
            ("developer", DEVELOPER_TEMPLATE),
            ("fix", FIX_TEMPLATE),
            ("verifier", VERIFIER_TEMPLATE),
            ("missing_tasks", MISSING_TASKS_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled prompt template should be valid");
        }
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
    });

    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    if rendered_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if rendered_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other = rendered_len(sections) - sections.last().map_or(0, |s| s.content.len());
    if let Some(last) = sections.last_mut() {
        let allowed = budget.saturating_sub(other);
        if last.content.len() > allowed {
            let before_len = last.content.len();
            let marker = "\n[truncated]";
            let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
            last.content.truncate(keep);
            if allowed > marker.len() {
                last.content.push_str(marker);
            }
            debug!(
                section = last.key,
                before_len,
                after_len = last.content.len(),
                "truncated section for budget"
            );
        }
    }
}

/// Length after joining with blank lines.
fn rendered_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SEPARATOR.len() * sections.len().saturating_sub(1)
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Renders agent prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    fn finish(&self, rendered: String) -> String {
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }

    pub fn architect(&self, input: &ArchitectInputs<'_>) -> Result<String> {
        let rendered = ENGINE.render(
            "architect",
            context! {
                story => StoryView::from(input.story),
                stack => input.stack.filter(|stack| !stack.is_empty()),
                design => input.design.map(str::trim).filter(|s| !s.is_empty()),
                workspace_files => input.workspace_files,
            },
        )?;
        Ok(self.finish(rendered))
    }

    pub fn developer(&self, input: &DeveloperInputs<'_>) -> Result<String> {
        let breakdown = input.breakdown;
        let rendered = ENGINE.render(
            "developer",
            context! {
                story => StoryView::from(input.story),
                task => input.task,
                allowed_files => &input.allowed_files,
                allowed_deps => &input.allowed_deps,
                stack => breakdown.tech_stack.as_ref().filter(|stack| !stack.is_empty()),
                conventions => &breakdown.conventions,
                notes => Some(breakdown.technical_notes.trim()).filter(|s| !s.is_empty()),
                completed => input.completed,
                existing => input.existing,
            },
        )?;
        Ok(self.finish(rendered))
    }

    pub fn fix(&self, input: &FixInputs<'_>) -> Result<String> {
        let rendered = ENGINE.render(
            "fix",
            context! {
                story => StoryView::from(input.story),
                allowed_files => &input.allowed_files,
                allowed_deps => &input.allowed_deps,
                files => input.files,
                output => input.output.trim(),
            },
        )?;
        Ok(self.finish(rendered))
    }

    pub fn verifier(&self, input: &VerifierInputs<'_>) -> Result<String> {
        let stack = input.stack.filter(|stack| !stack.is_empty());
        let rendered = ENGINE.render(
            "verifier",
            context! {
                story => StoryView::from(input.story),
                stack => stack,
                test_framework => stack.and_then(|s| s.test_framework.as_deref()),
                files => input.files,
            },
        )?;
        Ok(self.finish(rendered))
    }

    /// Follow-up message asking the architect for tasks it announced but omitted.
    pub fn missing_tasks(
        &self,
        story_id: &str,
        existing_ids: &[String],
        expected: usize,
        actual: usize,
    ) -> Result<String> {
        let rendered = ENGINE.render(
            "missing_tasks",
            context! {
                story_id => story_id,
                existing_ids => existing_ids,
                expected => expected,
                actual => actual,
            },
        )?;
        Ok(self.finish(rendered))
    }
}
