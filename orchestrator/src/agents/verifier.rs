//! Verifier agent: writes test files for the story's implementation.

use anyhow::Result;
use tracing::instrument;

use crate::core::context::StoryContext;
use crate::core::conversation::{Completer, Conversation};
use crate::core::retry::RetryPolicy;
use crate::core::types::FileSpec;
use crate::io::prompt::{PromptBuilder, VerifierInputs};

use super::{StageOutcome, Surface, generate_files};

/// Only recognized test files are accepted. The dependency contract is not
/// enforced here; test tooling imports are expected.
#[derive(Debug, Clone)]
pub struct VerifierAgent {
    persona: String,
    prompts: PromptBuilder,
    policy: RetryPolicy,
}

impl VerifierAgent {
    pub fn new(persona: impl Into<String>, prompt_budget_bytes: usize, policy: RetryPolicy) -> Self {
        Self {
            persona: persona.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
            policy,
        }
    }

    #[instrument(skip_all, fields(story = %ctx.story_id))]
    pub fn write_tests<C: Completer + ?Sized>(
        &self,
        completer: &C,
        ctx: &mut StoryContext,
        inputs: &VerifierInputs<'_>,
    ) -> Result<StageOutcome<Vec<FileSpec>>> {
        let prompt = self.prompts.verifier(inputs)?;
        let mut conversation = Conversation::new(self.persona.clone(), prompt);
        generate_files(
            completer,
            ctx,
            "test_writing",
            &mut conversation,
            self.policy,
            &Surface::TestsOnly,
        )
    }
}
