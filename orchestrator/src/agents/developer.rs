//! Developer agent: one task (or one fix round) in, contract-checked files out.

use anyhow::Result;
use tracing::instrument;

use crate::core::context::StoryContext;
use crate::core::contract::{ArchitecturalContract, Baseline};
use crate::core::conversation::{Completer, Conversation};
use crate::core::retry::RetryPolicy;
use crate::core::types::FileSpec;
use crate::io::prompt::{DeveloperInputs, FixInputs, PromptBuilder};

use super::{StageOutcome, Surface, generate_files};

#[derive(Debug, Clone)]
pub struct DeveloperAgent {
    persona: String,
    prompts: PromptBuilder,
    policy: RetryPolicy,
    contract_feedback: bool,
}

impl DeveloperAgent {
    /// With `contract_feedback` off, a contract violation fails the task
    /// immediately instead of being fed back.
    pub fn new(
        persona: impl Into<String>,
        prompt_budget_bytes: usize,
        policy: RetryPolicy,
        contract_feedback: bool,
    ) -> Self {
        Self {
            persona: persona.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
            policy,
            contract_feedback,
        }
    }

    #[instrument(skip_all, fields(story = %ctx.story_id, task = %inputs.task.task_id))]
    pub fn implement_task<C: Completer + ?Sized>(
        &self,
        completer: &C,
        ctx: &mut StoryContext,
        inputs: &DeveloperInputs<'_>,
        contract: &ArchitecturalContract,
        baseline: &Baseline,
    ) -> Result<StageOutcome<Vec<FileSpec>>> {
        let prompt = self.prompts.developer(inputs)?;
        let stage = format!("coding {}", inputs.task.task_id);
        self.generate(completer, ctx, &stage, prompt, contract, baseline)
    }

    /// Fix round after failed verification: the prompt carries the test output.
    #[instrument(skip_all, fields(story = %ctx.story_id))]
    pub fn fix_story<C: Completer + ?Sized>(
        &self,
        completer: &C,
        ctx: &mut StoryContext,
        inputs: &FixInputs<'_>,
        contract: &ArchitecturalContract,
        baseline: &Baseline,
    ) -> Result<StageOutcome<Vec<FileSpec>>> {
        let prompt = self.prompts.fix(inputs)?;
        self.generate(completer, ctx, "fix", prompt, contract, baseline)
    }

    fn generate<C: Completer + ?Sized>(
        &self,
        completer: &C,
        ctx: &mut StoryContext,
        stage: &str,
        prompt: String,
        contract: &ArchitecturalContract,
        baseline: &Baseline,
    ) -> Result<StageOutcome<Vec<FileSpec>>> {
        let mut conversation = Conversation::new(self.persona.clone(), prompt);
        let surface = Surface::Contract {
            contract,
            baseline,
            feedback: self.contract_feedback,
        };
        generate_files(completer, ctx, stage, &mut conversation, self.policy, &surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::Story;
    use crate::core::types::{FailureCategory, StageResult, Task, TaskBreakdown};
    use crate::test_support::{ScriptedCompleter, files_json};

    struct Fixture {
        story: Story,
        breakdown: TaskBreakdown,
        baseline: Baseline,
    }

    impl Fixture {
        fn new() -> Self {
            let task = Task {
                task_id: "S-1-T01".to_string(),
                description: "add the users route".to_string(),
                files_to_create: vec!["src/users.js".to_string()],
                ..Task::default()
            };
            Self {
                story: Story::new("S-1", "Users can register"),
                breakdown: TaskBreakdown {
                    story_id: "S-1".to_string(),
                    tasks: vec![task],
                    ..TaskBreakdown::default()
                },
                baseline: Baseline::default(),
            }
        }

        fn run(
            &self,
            agent: &DeveloperAgent,
            completer: &ScriptedCompleter,
        ) -> (StageOutcome<Vec<FileSpec>>, StoryContext) {
            let contract = ArchitecturalContract::build(&self.baseline, &self.breakdown);
            let inputs = DeveloperInputs {
                story: &self.story,
                breakdown: &self.breakdown,
                task: &self.breakdown.tasks[0],
                allowed_files: contract.allowed_files().iter().cloned().collect(),
                allowed_deps: contract.allowed_deps().iter().cloned().collect(),
                existing: &[],
                completed: &[],
            };
            let mut ctx = StoryContext::new("demo", 1, "S-1");
            let outcome = agent
                .implement_task(completer, &mut ctx, &inputs, &contract, &self.baseline)
                .expect("implement");
            (outcome, ctx)
        }
    }

    fn agent(contract_feedback: bool) -> DeveloperAgent {
        DeveloperAgent::new("developer", 50_000, RetryPolicy::new(3), contract_feedback)
    }

    #[test]
    fn declared_file_is_accepted() {
        let completer = ScriptedCompleter::new([files_json(&[(
            "src/users.js",
            "module.exports = { list: () => [] };\n",
        )])]);
        let (outcome, _) = Fixture::new().run(&agent(true), &completer);
        let StageResult::Valid(files) = outcome.result else {
            panic!("expected valid files");
        };
        assert_eq!(files[0].path, "src/users.js");
    }

    #[test]
    fn undeclared_file_is_fed_back_when_enabled() {
        let completer = ScriptedCompleter::new([
            files_json(&[("src/admin.js", "module.exports = {};\n")]),
            files_json(&[("src/users.js", "module.exports = {};\n")]),
        ]);
        let (outcome, _) = Fixture::new().run(&agent(true), &completer);
        assert!(outcome.result.is_usable());
        assert_eq!(outcome.attempts, 2);
        let feedback = &completer.conversations()[1].messages[2].content;
        assert!(feedback.contains("src/admin.js"));
    }

    #[test]
    fn undeclared_dependency_aborts_without_feedback() {
        let completer = ScriptedCompleter::new([files_json(&[(
            "src/users.js",
            "const lodash = require('lodash');\nmodule.exports = {};\n",
        )])]);
        let (outcome, ctx) = Fixture::new().run(&agent(false), &completer);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.category, Some(FailureCategory::Contract));
        assert!(ctx.last_diagnostic().is_some_and(|d| d.contains("lodash")));
    }

    #[test]
    fn syntax_errors_exhaust_into_content_validation() {
        let broken = files_json(&[("src/users.js", "function broken( {\n")]);
        let completer = ScriptedCompleter::new([broken.clone(), broken.clone(), broken]);
        let (outcome, _) = Fixture::new().run(&agent(true), &completer);
        assert!(!outcome.result.is_usable());
        assert_eq!(outcome.category, Some(FailureCategory::ContentValidation));
        let failure = outcome.failure().expect("failure");
        assert!(failure.diagnostic.contains("src/users.js"));
    }

    #[test]
    fn category_follows_the_kept_diagnostic() {
        let completer = ScriptedCompleter::new([
            files_json(&[("src/admin.js", "module.exports = {};\n")]),
            "sorry, cannot comply".to_string(),
            "still no".to_string(),
        ]);
        let (outcome, _) = Fixture::new().run(&agent(true), &completer);
        let failure = outcome.failure().expect("failure");
        assert_eq!(failure.category, FailureCategory::Contract);
        assert!(failure.diagnostic.contains("src/admin.js"));
    }

    #[test]
    fn later_unparseable_reply_without_files_reports_parse() {
        let completer = ScriptedCompleter::new([r#"{"files": []}"#, "nothing", "nothing"]);
        let (outcome, _) = Fixture::new().run(&agent(true), &completer);
        assert_eq!(outcome.category, Some(FailureCategory::Parse));
        assert!(
            outcome
                .failure()
                .is_some_and(|failure| failure.diagnostic.contains("no JSON record"))
        );
    }

    #[test]
    fn empty_file_list_is_a_shape_failure() {
        let completer = ScriptedCompleter::new([r#"{"files": []}"#; 3]);
        let (outcome, _) = Fixture::new().run(&agent(true), &completer);
        assert_eq!(outcome.category, Some(FailureCategory::Shape));
        completer.assert_drained();
    }
}
