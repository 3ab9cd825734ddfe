//! Prompt templates and placeholder rendering.
//!
//! Each step has a system/user template pair. Templates can be overridden
//! per file from a prompts directory; otherwise the built-in defaults
//! apply. Rendering substitutes `{name}` placeholders from the provided
//! context and leaves unresolved placeholders literally in place, so new
//! optional fields never break older templates.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::errors::GenerateError;
use crate::step::Step;

/// Placeholder context for one render.
pub type PromptContext = BTreeMap<&'static str, String>;

const EPIC_SYSTEM: &str = "You are a product analyst. Given rough epic notes, produce a single \
refined epic object as JSON with fields: title, goal, scope. Output JSON only.";
const EPIC_USER: &str = "Trace: {trace_id}\nMeta: {meta_json}\n\nEpic draft:\n{epic_json}\n\n\
Refine the epic. {redo_hint}";

const FEATURES_SYSTEM: &str = "You are a product analyst decomposing an epic into features. \
Output JSON only, in the form {\"features\": [{\"id\": \"F-1\", \"name\": ..., \
\"description\": ...}]}. Keep 3-8 features.";
const FEATURES_USER: &str = "Epic:\n{epic_json}\n\nDerive the feature list. {redo_hint}";

const STORIES_SYSTEM: &str = "You are an agile analyst writing user stories. Output JSON only, \
in the form {\"user_stories\": [{\"id\": \"US-1\", \"feature_id\": ..., \"title\": ..., \
\"acceptance_criteria\": [...]}]}.";
const STORIES_USER: &str = "Epic:\n{epic_json}\n\nFeatures:\n{features_json}\n\n\
Write user stories covering every feature. {redo_hint}";

const TEST_PLAN_SYSTEM: &str = "You are a QA lead writing a test plan. Output a single JSON \
object with fields: scope, in_scope, out_of_scope, test_types, environments, entry_criteria, \
exit_criteria, risks.";
const TEST_PLAN_USER: &str = "Epic:\n{epic_json}\n\nFeatures:\n{features_json}\n\n\
Stories:\n{stories_json}\n\nWrite the test plan. {redo_hint}";

const TEST_CASES_SYSTEM: &str = "You are a QA engineer writing structured test cases. Output \
JSON only, wrapped as {\"test_cases\": [...]}. Each case needs: id, story_id, title, priority, \
preconditions, steps, expected, test_data (an object).";
const TEST_CASES_USER: &str = "Story {story_id}:\n{story_json}\n\nParent feature:\n\
{feature_json}\n\nTest plan:\n{test_plan_json}\n\nWrite test cases for this story only. \
{redo_hint}";

const AUTOMATED_TESTS_SYSTEM: &str = "You are a test automation engineer writing Playwright \
TypeScript tests. Output only TypeScript code, no markdown fences.";
const AUTOMATED_TESTS_USER: &str = "Story {story_id}:\n{story_json}\n\nParent feature:\n\
{feature_json}\n\nTest plan:\n{test_plan_json}\n\nTest cases:\n{test_cases_json}\n\n\
Implement every test case above as Playwright tests wrapped in one describe block. {redo_hint}";

fn default_pair(step: Step) -> (&'static str, &'static str) {
    match step {
        Step::Epic => (EPIC_SYSTEM, EPIC_USER),
        Step::Features => (FEATURES_SYSTEM, FEATURES_USER),
        Step::Stories => (STORIES_SYSTEM, STORIES_USER),
        Step::TestPlan => (TEST_PLAN_SYSTEM, TEST_PLAN_USER),
        Step::TestCases => (TEST_CASES_SYSTEM, TEST_CASES_USER),
        Step::AutomatedTests => (AUTOMATED_TESTS_SYSTEM, AUTOMATED_TESTS_USER),
    }
}

/// Per-step system/user prompt template pairs.
pub struct PromptLibrary {
    prompts_dir: Option<PathBuf>,
}

impl PromptLibrary {
    /// Built-in templates only.
    pub fn builtin() -> PromptLibrary {
        PromptLibrary { prompts_dir: None }
    }

    /// Templates overridable from `dir` (falling back per file to the
    /// built-in defaults when a file is absent).
    pub fn from_dir(dir: PathBuf) -> PromptLibrary {
        PromptLibrary {
            prompts_dir: Some(dir),
        }
    }

    /// Load the (system, user) template pair for a step.
    pub fn load(&self, step: Step) -> Result<(String, String), GenerateError> {
        let (system_name, user_name) = step.prompt_files();
        let (system_default, user_default) = default_pair(step);
        Ok((
            self.load_one(system_name, system_default)?,
            self.load_one(user_name, user_default)?,
        ))
    }

    fn load_one(&self, name: &str, default: &str) -> Result<String, GenerateError> {
        if let Some(dir) = &self.prompts_dir {
            let path = dir.join(name);
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|source| {
                    GenerateError::PromptLoad {
                        name: name.to_string(),
                        source,
                    }
                });
            }
        }
        Ok(default.to_string())
    }
}

/// Substitute `{name}` placeholders from `ctx`. A placeholder is a braced
/// run of identifier characters; anything else (including JSON braces in
/// the template text) passes through untouched, as do placeholders with
/// no value in the context.
pub fn render(template: &str, ctx: &PromptContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail[1..].find(['{', '}']) {
            Some(rel) if tail[1..].as_bytes()[rel] == b'}' => {
                let name = &tail[1..1 + rel];
                let is_ident = !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                match (is_ident, ctx.get(name)) {
                    (true, Some(value)) => {
                        out.push_str(value);
                        rest = &tail[rel + 2..];
                    }
                    _ => {
                        out.push_str(&tail[..rel + 2]);
                        rest = &tail[rel + 2..];
                    }
                }
            }
            _ => {
                // unbalanced or nested opener: emit the brace literally
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
