//! Draft generation per step via the generative backend.
//!
//! One call covers EPIC/FEATURES/STORIES/TEST_PLAN. The two heaviest
//! steps are batched per story to bound response size and localize
//! retries: TEST_CASES issues one JSON call per story and merges the
//! normalized sequences; AUTOMATED_TESTS groups confirmed test cases by
//! story and merges one text block per group. Transient backend failures
//! are retried with capped exponential backoff; malformed JSON responses
//! are salvaged by balanced-substring extraction before giving up.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::artifact::{Artifact, TestCase, normalize_case_objects};
use crate::backend::{CompletionRequest, GenerationBackend, response_content};
use crate::distill::{
    MAX_EPIC_CHARS, MAX_FEATURES_CHARS, MAX_SINGLE_FEATURE_CHARS, MAX_SINGLE_STORY_CHARS,
    MAX_SINGLE_TESTCASES_CHARS, MAX_SINGLE_TESTPLAN_CHARS, MAX_STORIES_CHARS,
    MAX_TESTCASES_CHARS, MAX_TESTPLAN_CHARS, clip_value, distill_features, distill_stories,
    distill_test_cases, feature_digest, plan_digest, story_digest, story_id_of,
};
use crate::errors::{BackendError, GenerateError};
use crate::prompts::{PromptContext, PromptLibrary, render};
use crate::step::Step;
use crate::store::TraceState;
use crate::util::extract_first_json;

/// Hard cap on generated test cases per story.
pub const MAX_TESTCASES_PER_STORY: usize = 6;

/// Per-story automated-test generation parameters.
const AUTOMATION_MAX_TOKENS_PER_STORY: u32 = 3200;
const AUTOMATION_TEMPERATURE: f32 = 0.1;

/// Test case generation runs cold with a raised output budget.
const TESTCASES_TEMPERATURE: f32 = 0.0;
const TESTCASES_MIN_TOKENS: u32 = 2048;

/// On the per-story path, raise the output budget after this many failed
/// attempts to reduce the chance of truncation on retry.
const ESCALATE_AFTER_ATTEMPT: u32 = 3;
const ESCALATION_STEP_TOKENS: u32 = 512;
const ESCALATION_CAP_TOKENS: u32 = 4096;

const BACKOFF_MULTIPLIER: f64 = 1.7;

/// Separator between per-story blocks in the merged test file.
pub const SECTION_SEPARATOR: &str = "\n\n// ------------------------------\n\n";

/// Confirmed upstream artifacts available as generation context.
pub type ConfirmedMap = BTreeMap<Step, Artifact>;

/// Capped exponential backoff for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl RetryPolicy {
    pub fn json_default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 6,
            base_delay_secs: 2.0,
            max_delay_secs: 30.0,
        }
    }

    pub fn text_default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_secs: 2.0,
            max_delay_secs: 25.0,
        }
    }

    /// Sleep before retrying a failed `attempt` (1-based). A
    /// server-suggested delay wins; otherwise the base delay grows by
    /// 1.7x per attempt up to the cap.
    pub fn delay_secs(&self, attempt: u32, retry_after: Option<f64>) -> f64 {
        retry_after.unwrap_or_else(|| {
            (self.base_delay_secs * BACKOFF_MULTIPLIER.powi(attempt as i32 - 1))
                .min(self.max_delay_secs)
        })
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_retry: RetryPolicy,
    pub text_retry: RetryPolicy,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            temperature: 0.2,
            max_tokens: 2048,
            json_retry: RetryPolicy::json_default(),
            text_retry: RetryPolicy::text_default(),
        }
    }
}

/// Which JSON call path is running; controls token budget, temperature
/// and retry-time escalation.
#[derive(Debug, Clone, Copy, PartialEq)]
enum JsonCall {
    Default,
    TestCases,
    TestCasesPerStory,
}

/// Produces a draft artifact for a step from confirmed upstream context.
pub struct StepGenerator<B> {
    backend: B,
    prompts: PromptLibrary,
    config: GeneratorConfig,
}

impl<B: GenerationBackend> StepGenerator<B> {
    pub fn new(backend: B, prompts: PromptLibrary, config: GeneratorConfig) -> StepGenerator<B> {
        StepGenerator {
            backend,
            prompts,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Generate the draft artifact for `step`.
    pub fn generate_step(
        &self,
        step: Step,
        state: &TraceState,
        confirmed: &ConfirmedMap,
        redo_hint: Option<&str>,
    ) -> Result<Artifact, GenerateError> {
        let (system, user_template) = self.prompts.load(step)?;
        let base_ctx = self.base_context(state, confirmed, redo_hint);

        match step {
            Step::TestCases => {
                self.generate_test_cases_batched(&system, &user_template, confirmed, &base_ctx)
            }
            Step::AutomatedTests => {
                self.generate_automated_tests_batched(&system, &user_template, confirmed, &base_ctx)
            }
            _ => {
                let user = render(&user_template, &base_ctx);
                let value = self.call_json(&system, &user, JsonCall::Default)?;
                Ok(Artifact::ingest(step, value))
            }
        }
    }

    // ---------------- Context building ----------------

    fn base_context(
        &self,
        state: &TraceState,
        confirmed: &ConfirmedMap,
        redo_hint: Option<&str>,
    ) -> PromptContext {
        let epic = match confirmed.get(&Step::Epic) {
            Some(Artifact::Epic(v)) => v.clone(),
            _ => Value::Null,
        };
        let features = match confirmed.get(&Step::Features) {
            Some(Artifact::Features(items)) => distill_features(items),
            _ => Value::Null,
        };
        let stories = match confirmed.get(&Step::Stories) {
            Some(Artifact::Stories(items)) => distill_stories(items),
            _ => Value::Null,
        };
        let plan = match confirmed.get(&Step::TestPlan) {
            Some(Artifact::TestPlan(v)) => plan_digest(v),
            _ => Value::Null,
        };
        let cases = match confirmed.get(&Step::TestCases) {
            Some(Artifact::TestCases(cases)) => distill_test_cases(cases),
            _ => Value::Null,
        };

        let mut ctx = PromptContext::new();
        ctx.insert("trace_id", state.trace_id.clone());
        ctx.insert(
            "meta_json",
            serde_json::to_string(&state.meta).unwrap_or_else(|_| "{}".to_string()),
        );
        ctx.insert("redo_hint", redo_hint.unwrap_or("").to_string());
        ctx.insert("epic_json", clip_value(&epic, MAX_EPIC_CHARS));
        ctx.insert("features_json", clip_value(&features, MAX_FEATURES_CHARS));
        ctx.insert("stories_json", clip_value(&stories, MAX_STORIES_CHARS));
        ctx.insert("test_plan_json", clip_value(&plan, MAX_TESTPLAN_CHARS));
        ctx.insert("test_cases_json", clip_value(&cases, MAX_TESTCASES_CHARS));
        ctx
    }

    // ---------------- TEST_CASES: batched per story ----------------

    fn generate_test_cases_batched(
        &self,
        system: &str,
        user_template: &str,
        confirmed: &ConfirmedMap,
        base_ctx: &PromptContext,
    ) -> Result<Artifact, GenerateError> {
        let stories: &[Value] = match confirmed.get(&Step::Stories) {
            Some(Artifact::Stories(items)) if !items.is_empty() => items,
            // No stories to batch over: one whole-step call.
            _ => {
                let user = render(user_template, base_ctx);
                let value = self.call_json(system, &user, JsonCall::TestCases)?;
                return Ok(Artifact::ingest(Step::TestCases, value));
            }
        };

        let feature_map = feature_map(confirmed);
        let plan_text = match confirmed.get(&Step::TestPlan) {
            Some(Artifact::TestPlan(v)) => clip_value(&plan_digest(v), MAX_SINGLE_TESTPLAN_CHARS),
            _ => "null".to_string(),
        };

        let mut all_cases: Vec<TestCase> = Vec::new();

        for (idx, story) in stories.iter().enumerate() {
            let position = idx + 1;
            let sid = story_id_of(story, position);

            let mut digest = story_digest(story);
            digest["id"] = Value::String(sid.clone());

            let feature_json = story
                .get("feature_id")
                .filter(|v| !v.is_null())
                .and_then(|fid| feature_map.get(&value_key(fid)))
                .map(|f| clip_value(f, MAX_SINGLE_FEATURE_CHARS))
                .unwrap_or_default();

            let mut ctx = base_ctx.clone();
            ctx.insert("story_id", sid.clone());
            ctx.insert("story_json", clip_value(&digest, MAX_SINGLE_STORY_CHARS));
            ctx.insert("feature_json", feature_json);
            ctx.insert("test_plan_json", plan_text.clone());

            let mut user = render(user_template, &ctx);
            if !user_template.contains("{story_json}") {
                user = single_story_guard(&user, &ctx["story_json"]);
            }

            let value = self.call_json(system, &user, JsonCall::TestCasesPerStory)?;

            let mut cases: Vec<TestCase> = normalize_case_objects(value)
                .iter()
                .enumerate()
                .map(|(i, raw)| TestCase::normalize(raw, &sid, i + 1))
                .collect();
            cases.truncate(MAX_TESTCASES_PER_STORY);

            debug!(story = %sid, count = cases.len(), "merged per-story test cases");
            all_cases.extend(cases);
        }

        Ok(Artifact::TestCases(all_cases))
    }

    // ---------------- AUTOMATED_TESTS: batched per story group ----------------

    fn generate_automated_tests_batched(
        &self,
        system: &str,
        user_template: &str,
        confirmed: &ConfirmedMap,
        base_ctx: &PromptContext,
    ) -> Result<Artifact, GenerateError> {
        let cases: &[TestCase] = match confirmed.get(&Step::TestCases) {
            Some(Artifact::TestCases(cases)) if !cases.is_empty() => cases,
            // No confirmed test cases: one whole-step text call.
            _ => {
                let user = render(user_template, base_ctx);
                let text = self.call_text(system, &user, self.config.max_tokens, self.config.temperature)?;
                return Ok(Artifact::AutomatedTests(strip_code_fence(&text)));
            }
        };

        let story_map = story_map(confirmed);
        let feature_map = feature_map(confirmed);
        let plan_text = match confirmed.get(&Step::TestPlan) {
            Some(Artifact::TestPlan(v)) => clip_value(&plan_digest(v), MAX_SINGLE_TESTPLAN_CHARS),
            _ => "null".to_string(),
        };

        let mut sections: Vec<String> = Vec::new();

        for (sid, group) in group_cases_by_story(cases) {
            let story = story_map
                .get(&sid)
                .cloned()
                .unwrap_or_else(|| json!({ "id": sid }));

            let feature_json = story
                .get("feature_id")
                .filter(|v| !v.is_null())
                .and_then(|fid| feature_map.get(&value_key(fid)))
                .map(|f| clip_value(f, MAX_SINGLE_FEATURE_CHARS))
                .unwrap_or_default();

            let group_cases: Vec<TestCase> = group.into_iter().cloned().collect();

            let mut ctx = base_ctx.clone();
            ctx.insert("story_id", sid.clone());
            ctx.insert("story_json", clip_value(&story, MAX_SINGLE_STORY_CHARS));
            ctx.insert("feature_json", feature_json);
            ctx.insert("test_plan_json", plan_text.clone());
            ctx.insert(
                "test_cases_json",
                clip_value(&distill_test_cases(&group_cases), MAX_SINGLE_TESTCASES_CHARS),
            );

            let mut user = render(user_template, &ctx);
            if !user_template.contains("{test_cases_json}") {
                user = single_group_guard(&user, &sid, &ctx["test_cases_json"]);
            }

            let text = self.call_text(
                system,
                &user,
                self.config.max_tokens.max(AUTOMATION_MAX_TOKENS_PER_STORY),
                AUTOMATION_TEMPERATURE,
            )?;
            sections.push(strip_code_fence(&text));
        }

        Ok(Artifact::AutomatedTests(merge_sections(&sections)))
    }

    // ---------------- Backend calls with retry ----------------

    fn call_json(
        &self,
        system: &str,
        user: &str,
        kind: JsonCall,
    ) -> Result<Value, GenerateError> {
        let (mut max_tokens, temperature) = match kind {
            JsonCall::Default => (self.config.max_tokens, self.config.temperature),
            JsonCall::TestCases | JsonCall::TestCasesPerStory => (
                self.config.max_tokens.max(TESTCASES_MIN_TOKENS),
                TESTCASES_TEMPERATURE,
            ),
        };

        let policy = &self.config.json_retry;
        let mut last_err: Option<BackendError> = None;

        for attempt in 1..=policy.max_attempts {
            let request = CompletionRequest {
                system_prompt: system.to_string(),
                user_prompt: user.to_string(),
                max_tokens,
                temperature,
                json_object: true,
            };

            match self.backend.complete_raw(&request) {
                Ok(raw) => {
                    let content = response_content(&raw);
                    return salvage_json(&content);
                }
                Err(err) if err.is_transient() => {
                    let delay = policy.delay_secs(attempt, err.retry_after());
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_secs = delay,
                        error = %err,
                        "transient backend failure, backing off"
                    );
                    last_err = Some(err);
                    if attempt < policy.max_attempts {
                        sleep_secs(delay);
                        if kind == JsonCall::TestCasesPerStory && attempt >= ESCALATE_AFTER_ATTEMPT
                        {
                            max_tokens =
                                (max_tokens + ESCALATION_STEP_TOKENS).min(ESCALATION_CAP_TOKENS);
                        }
                    }
                }
                Err(err) => return Err(GenerateError::Backend(err)),
            }
        }

        Err(GenerateError::AttemptsExhausted {
            attempts: policy.max_attempts,
            last: last_err.unwrap_or_else(|| BackendError::Fatal("no attempts made".into())),
        })
    }

    fn call_text(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerateError> {
        let policy = &self.config.text_retry;
        let mut last_err: Option<BackendError> = None;

        for attempt in 1..=policy.max_attempts {
            let request = CompletionRequest {
                system_prompt: system.to_string(),
                user_prompt: user.to_string(),
                max_tokens,
                temperature,
                json_object: false,
            };

            match self.backend.complete_text(&request) {
                Ok(text) => return Ok(text),
                Err(err) if err.is_transient() => {
                    let delay = policy.delay_secs(attempt, err.retry_after());
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_secs = delay,
                        error = %err,
                        "transient backend failure, backing off"
                    );
                    last_err = Some(err);
                    if attempt < policy.max_attempts {
                        sleep_secs(delay);
                    }
                }
                Err(err) => return Err(GenerateError::Backend(err)),
            }
        }

        Err(GenerateError::AttemptsExhausted {
            attempts: policy.max_attempts,
            last: last_err.unwrap_or_else(|| BackendError::Fatal("no attempts made".into())),
        })
    }
}

fn sleep_secs(secs: f64) {
    if secs > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(secs));
    }
}

/// Parse backend content tolerantly: direct parse first, then the first
/// balanced JSON substring, else a content-format failure with a bounded
/// preview.
pub fn salvage_json(text: &str) -> Result<Value, GenerateError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    if let Some(candidate) = extract_first_json(trimmed)
        && let Ok(value) = serde_json::from_str(candidate)
    {
        return Ok(value);
    }
    Err(GenerateError::content_format(trimmed))
}

/// Stable-ordered story groups: order follows first appearance in the
/// case list. Never reorders or deduplicates beyond grouping.
pub fn group_cases_by_story(cases: &[TestCase]) -> Vec<(String, Vec<&TestCase>)> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: BTreeMap<String, Vec<&TestCase>> = BTreeMap::new();

    for case in cases {
        let sid = normalize_story_id(&case.story_id);
        if !grouped.contains_key(&sid) {
            order.push(sid.clone());
        }
        grouped.entry(sid).or_default().push(case);
    }

    order
        .into_iter()
        .map(|sid| {
            let group = grouped.remove(&sid).unwrap_or_default();
            (sid, group)
        })
        .collect()
}

fn normalize_story_id(s: &str) -> String {
    let t = s.trim();
    if t.is_empty() {
        "UNKNOWN".to_string()
    } else {
        t.to_string()
    }
}

/// Remove a surrounding markdown code fence, keeping the inner code.
pub fn strip_code_fence(text: &str) -> String {
    let t = text.trim();
    if !t.starts_with("```") {
        return t.to_string();
    }
    let mut lines: Vec<&str> = t.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Merge per-story code blocks into one file with a header comment and a
/// visible separator between blocks, in group order.
pub fn merge_sections(sections: &[String]) -> String {
    let cleaned: Vec<&str> = sections
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if cleaned.is_empty() {
        return String::new();
    }

    let header = "// Generated Playwright tests, merged from per-story batches.\n\
                  // Batching bounds each generation call to one story.\n\n";
    format!("{header}{}\n", cleaned.join(SECTION_SEPARATOR))
}

fn single_story_guard(user_prompt: &str, story_json: &str) -> String {
    format!(
        "{}\n\n---\nGenerate test cases ONLY for the following single user story (do not \
         include other stories).\n{story_json}\n\nConstraints:\n- Return JSON only. Wrapper \
         must be {{\"test_cases\":[...]}}.\n- Max {MAX_TESTCASES_PER_STORY} test cases.\n- Each \
         test case must include: id, story_id, title, priority, preconditions, steps, expected, \
         test_data.\n- test_data must be an object.\n",
        user_prompt.trim_end()
    )
}

fn single_group_guard(user_prompt: &str, story_id: &str, test_cases_json: &str) -> String {
    format!(
        "{}\n\n---\nGenerate Playwright TypeScript tests ONLY for story_id = {story_id}.\n\
         Use ONLY the following test cases JSON (do not invent additional cases):\n\
         {test_cases_json}\n\nConstraints:\n- Output ONLY TypeScript code (no markdown \
         fences).\n- Wrap tests in describe('{story_id} ...', () => {{ ... }}).\n- Ensure all \
         test cases in the JSON are implemented.\n",
        user_prompt.trim_end()
    )
}

/// Map of feature id -> feature digest for per-story context lookup.
fn feature_map(confirmed: &ConfirmedMap) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    if let Some(Artifact::Features(items)) = confirmed.get(&Step::Features) {
        for item in items {
            let digest = feature_digest(item);
            if let Some(fid) = digest.get("id").filter(|v| !v.is_null()) {
                map.insert(value_key(fid), digest.clone());
            }
        }
    }
    map
}

/// Map of story id -> story digest for automated-test group context.
fn story_map(confirmed: &ConfirmedMap) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    if let Some(Artifact::Stories(items)) = confirmed.get(&Step::Stories) {
        for (idx, item) in items.iter().enumerate() {
            let sid = story_id_of(item, idx + 1);
            let mut digest = story_digest(item);
            digest["id"] = Value::String(sid.clone());
            map.insert(sid, digest);
        }
    }
    map
}

fn value_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Scripted backend: pops canned results in order and records every
    /// request it sees.
    struct MockBackend {
        responses: RefCell<Vec<Result<String, BackendError>>>,
        requests: RefCell<Vec<CompletionRequest>>,
    }

    impl MockBackend {
        fn new(responses: Vec<Result<String, BackendError>>) -> MockBackend {
            MockBackend {
                responses: RefCell::new(responses),
                requests: RefCell::new(Vec::new()),
            }
        }

        fn next(&self, request: &CompletionRequest) -> Result<String, BackendError> {
            self.requests.borrow_mut().push(request.clone());
            let mut responses = self.responses.borrow_mut();
            if responses.is_empty() {
                return Err(BackendError::Fatal("mock exhausted".into()));
            }
            responses.remove(0)
        }

        fn request_count(&self) -> usize {
            self.requests.borrow().len()
        }
    }

    impl GenerationBackend for &MockBackend {
        fn complete_raw(&self, request: &CompletionRequest) -> Result<Value, BackendError> {
            let content = self.next(request)?;
            Ok(json!({"choices": [{"message": {"content": content}}]}))
        }

        fn complete_text(&self, request: &CompletionRequest) -> Result<String, BackendError> {
            self.next(request)
        }
    }

    fn fast_config() -> GeneratorConfig {
        let zero = |attempts: u32| RetryPolicy {
            max_attempts: attempts,
            base_delay_secs: 0.0,
            max_delay_secs: 0.0,
        };
        GeneratorConfig {
            temperature: 0.2,
            max_tokens: 2048,
            json_retry: zero(6),
            text_retry: zero(5),
        }
    }

    fn generator(backend: &MockBackend) -> StepGenerator<&MockBackend> {
        StepGenerator::new(backend, PromptLibrary::builtin(), fast_config())
    }

    fn state() -> TraceState {
        TraceState {
            trace_id: "demo-1".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            current_step: Some(Step::Epic),
            confirmed: BTreeMap::new(),
            meta: serde_json::Map::new(),
        }
    }

    fn transient(status: u16) -> BackendError {
        BackendError::Http {
            status,
            retry_after: None,
            message: "transient".into(),
        }
    }

    fn confirmed_through_stories() -> ConfirmedMap {
        let mut map = ConfirmedMap::new();
        map.insert(
            Step::Epic,
            Artifact::Epic(json!({"title": "Login", "goal": "Allow sign-in"})),
        );
        map.insert(
            Step::Features,
            Artifact::ingest(
                Step::Features,
                json!({"features": [
                    {"id": "F-1", "name": "Password login", "description": "d1"},
                    {"id": "F-2", "name": "Password reset", "description": "d2"},
                ]}),
            ),
        );
        map.insert(
            Step::Stories,
            Artifact::ingest(
                Step::Stories,
                json!({"user_stories": [
                    {"id": "US-1", "feature_id": "F-1", "title": "login ok"},
                    {"id": "US-2", "feature_id": "F-1", "title": "login bad password"},
                    {"id": "US-3", "feature_id": "F-2", "title": "reset email"},
                ]}),
            ),
        );
        map.insert(
            Step::TestPlan,
            Artifact::TestPlan(json!({"scope": "login", "risks": []})),
        );
        map
    }

    #[test]
    fn test_retry_policy_growth_and_cap() {
        let policy = RetryPolicy::json_default();
        assert_eq!(policy.delay_secs(1, None), 2.0);
        assert!((policy.delay_secs(2, None) - 3.4).abs() < 1e-9);
        assert_eq!(policy.delay_secs(20, None), 30.0);
    }

    #[test]
    fn test_retry_policy_honors_server_delay() {
        let policy = RetryPolicy::json_default();
        assert_eq!(policy.delay_secs(1, Some(7.5)), 7.5);
    }

    #[test]
    fn test_default_path_single_call_ingests_result() {
        let backend = MockBackend::new(vec![Ok(
            r#"{"features": [{"id": "F-1", "name": "a"}]}"#.to_string()
        )]);
        let generate = generator(&backend);
        let mut confirmed = ConfirmedMap::new();
        confirmed.insert(Step::Epic, Artifact::Epic(json!({"title": "t"})));

        let draft = generate
            .generate_step(Step::Features, &state(), &confirmed, None)
            .unwrap();

        assert_eq!(backend.request_count(), 1);
        assert_eq!(draft.item_count(), Some(1));
    }

    #[test]
    fn test_redo_hint_flows_into_prompt() {
        let backend = MockBackend::new(vec![Ok("{\"features\": []}".to_string())]);
        let generate = generator(&backend);
        let confirmed = ConfirmedMap::new();

        generate
            .generate_step(Step::Features, &state(), &confirmed, Some("more edge cases"))
            .unwrap();

        let requests = backend.requests.borrow();
        assert!(requests[0].user_prompt.contains("more edge cases"));
    }

    #[test]
    fn test_salvage_json_direct_and_embedded() {
        assert_eq!(salvage_json(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        let noisy = "Sure, here it is:\n{\"a\": [1, 2]}\nLet me know!";
        assert_eq!(salvage_json(noisy).unwrap(), json!({"a": [1, 2]}));
    }

    #[test]
    fn test_salvage_json_failure_is_content_format() {
        let err = salvage_json("I cannot answer that.").unwrap_err();
        assert!(matches!(err, GenerateError::ContentFormat { .. }));
    }

    #[test]
    fn test_transient_errors_retried_until_success() {
        let backend = MockBackend::new(vec![
            Err(transient(429)),
            Err(transient(503)),
            Ok("{\"features\": []}".to_string()),
        ]);
        let generate = generator(&backend);

        let draft = generate
            .generate_step(Step::Features, &state(), &ConfirmedMap::new(), None)
            .unwrap();
        assert_eq!(backend.request_count(), 3);
        assert_eq!(draft.item_count(), Some(0));
    }

    #[test]
    fn test_permanent_error_propagates_without_retry() {
        let backend = MockBackend::new(vec![Err(BackendError::Fatal("no auth".into()))]);
        let generate = generator(&backend);

        let err = generate
            .generate_step(Step::Features, &state(), &ConfirmedMap::new(), None)
            .unwrap_err();
        assert_eq!(backend.request_count(), 1);
        assert!(matches!(err, GenerateError::Backend(_)));
    }

    #[test]
    fn test_attempt_ceiling_raises_terminal_failure_with_last_error() {
        let backend = MockBackend::new(vec![
            Err(transient(500)),
            Err(transient(500)),
            Err(transient(500)),
            Err(transient(500)),
            Err(transient(500)),
            Err(transient(502)),
        ]);
        let generate = generator(&backend);

        let err = generate
            .generate_step(Step::Features, &state(), &ConfirmedMap::new(), None)
            .unwrap_err();
        assert_eq!(backend.request_count(), 6);
        match err {
            GenerateError::AttemptsExhausted { attempts, last } => {
                assert_eq!(attempts, 6);
                assert!(last.to_string().contains("502"));
            }
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_test_cases_one_call_per_story_in_order() {
        let per_story = |sid: &str| {
            Ok(format!(
                r#"{{"test_cases": [{{"id": "TC-{sid}-1", "story_id": "{sid}", "title": "t", "steps": "one step"}}]}}"#
            ))
        };
        let backend = MockBackend::new(vec![
            per_story("US-1"),
            per_story("US-2"),
            per_story("US-3"),
        ]);
        let generate = generator(&backend);
        let confirmed = confirmed_through_stories();

        let draft = generate
            .generate_step(Step::TestCases, &state(), &confirmed, None)
            .unwrap();

        assert_eq!(backend.request_count(), 3);
        match &draft {
            Artifact::TestCases(cases) => {
                assert_eq!(cases.len(), 3);
                let sids: Vec<&str> = cases.iter().map(|c| c.story_id.as_str()).collect();
                assert_eq!(sids, vec!["US-1", "US-2", "US-3"]);
                // string step coerced to a one-element sequence
                assert_eq!(cases[0].steps, vec!["one step"]);
            }
            other => panic!("expected TestCases, got {other:?}"),
        }

        // each request carried its own story context only
        let requests = backend.requests.borrow();
        assert!(requests[0].user_prompt.contains("US-1"));
        assert!(!requests[0].user_prompt.contains("login bad password"));
        assert!(requests[1].user_prompt.contains("US-2"));
        assert!(requests.iter().all(|r| r.json_object));
    }

    #[test]
    fn test_test_cases_caps_per_story_sequence() {
        let many: Vec<Value> = (0..10).map(|i| json!({"id": format!("TC-{i}")})).collect();
        let backend = MockBackend::new(vec![
            Ok(json!({ "test_cases": many }).to_string()),
            Ok(r#"{"test_cases": []}"#.to_string()),
            Ok(r#"{"test_cases": []}"#.to_string()),
        ]);
        let generate = generator(&backend);
        let confirmed = confirmed_through_stories();

        let draft = generate
            .generate_step(Step::TestCases, &state(), &confirmed, None)
            .unwrap();
        assert_eq!(draft.item_count(), Some(MAX_TESTCASES_PER_STORY));
    }

    #[test]
    fn test_test_cases_without_stories_falls_back_to_single_call() {
        let backend = MockBackend::new(vec![Ok(
            r#"{"test_cases": [{"id": "TC-1", "steps": ["s"]}]}"#.to_string()
        )]);
        let generate = generator(&backend);
        let confirmed = ConfirmedMap::new();

        let draft = generate
            .generate_step(Step::TestCases, &state(), &confirmed, None)
            .unwrap();
        assert_eq!(backend.request_count(), 1);
        assert_eq!(draft.item_count(), Some(1));
    }

    #[test]
    fn test_per_story_escalates_output_budget_on_late_retries() {
        let backend = MockBackend::new(vec![
            Err(transient(429)),
            Err(transient(429)),
            Err(transient(429)),
            Err(transient(429)),
            Ok(r#"{"test_cases": []}"#.to_string()),
            Ok(r#"{"test_cases": []}"#.to_string()),
            Ok(r#"{"test_cases": []}"#.to_string()),
        ]);
        let generate = generator(&backend);
        let confirmed = confirmed_through_stories();

        generate
            .generate_step(Step::TestCases, &state(), &confirmed, None)
            .unwrap();

        let budgets: Vec<u32> = backend.requests.borrow().iter().map(|r| r.max_tokens).collect();
        // attempts 1-3 at the base budget; +512 after attempts 3 and 4
        assert_eq!(&budgets[..5], &[2048, 2048, 2048, 2560, 3072]);
        // fresh story starts back at the base budget
        assert_eq!(budgets[5], 2048);
    }

    fn confirmed_with_cases() -> ConfirmedMap {
        let mut map = confirmed_through_stories();
        let cases = vec![
            TestCase::normalize(&json!({"id": "TC-1", "story_id": "US-1"}), "US-1", 1),
            TestCase::normalize(&json!({"id": "TC-2", "story_id": "US-2"}), "US-2", 1),
            TestCase::normalize(&json!({"id": "TC-3", "story_id": "US-1"}), "US-1", 2),
            TestCase::normalize(&json!({"id": "TC-4", "story_id": "US-3"}), "US-3", 1),
        ];
        map.insert(Step::TestCases, Artifact::TestCases(cases));
        map
    }

    #[test]
    fn test_automated_tests_groups_by_first_appearance() {
        let backend = MockBackend::new(vec![
            Ok("```typescript\ndescribe('US-1', () => {});\n```".to_string()),
            Ok("describe('US-2', () => {});".to_string()),
            Ok("describe('US-3', () => {});".to_string()),
        ]);
        let generate = generator(&backend);
        let confirmed = confirmed_with_cases();

        let draft = generate
            .generate_step(Step::AutomatedTests, &state(), &confirmed, None)
            .unwrap();

        // 4 cases but only 3 story groups -> 3 calls
        assert_eq!(backend.request_count(), 3);
        let text = draft.as_text().unwrap();
        // fence stripped, order preserved, separator between blocks
        assert!(!text.contains("```"));
        let p1 = text.find("describe('US-1'").unwrap();
        let p2 = text.find("describe('US-2'").unwrap();
        let p3 = text.find("describe('US-3'").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert_eq!(text.matches(SECTION_SEPARATOR.trim_matches('\n')).count(), 2);

        let requests = backend.requests.borrow();
        assert!(requests.iter().all(|r| !r.json_object));
        assert!(requests.iter().all(|r| r.max_tokens >= 3200));
        // the US-1 call carries both of its cases
        assert!(requests[0].user_prompt.contains("TC-1"));
        assert!(requests[0].user_prompt.contains("TC-3"));
        assert!(!requests[0].user_prompt.contains("TC-2"));
    }

    #[test]
    fn test_automated_tests_without_cases_falls_back_to_text_call() {
        let backend = MockBackend::new(vec![Ok("// fallback file".to_string())]);
        let generate = generator(&backend);
        let confirmed = confirmed_through_stories();

        let draft = generate
            .generate_step(Step::AutomatedTests, &state(), &confirmed, None)
            .unwrap();
        assert_eq!(backend.request_count(), 1);
        assert_eq!(draft.as_text(), Some("// fallback file"));
    }

    #[test]
    fn test_group_cases_by_story_is_deterministic() {
        let case = |id: &str, sid: &str| TestCase::normalize(&json!({"id": id, "story_id": sid}), sid, 1);
        let cases = vec![
            case("a", "US-2"),
            case("b", "US-1"),
            case("c", "US-2"),
            case("d", ""),
        ];
        let groups = group_cases_by_story(&cases);
        let order: Vec<&str> = groups.iter().map(|(sid, _)| sid.as_str()).collect();
        assert_eq!(order, vec!["US-2", "US-1", "UNKNOWN"]);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("plain code"), "plain code");
        assert_eq!(strip_code_fence("```\ncode\n```"), "code");
        assert_eq!(strip_code_fence("```typescript\ncode here\n```"), "code here");
        assert_eq!(strip_code_fence("```\nunclosed fence"), "unclosed fence");
    }

    #[test]
    fn test_merge_sections_skips_empty_blocks() {
        let merged = merge_sections(&["a".to_string(), "  ".to_string(), "b".to_string()]);
        assert!(merged.starts_with("//"));
        assert_eq!(merged.matches("------------------------------").count(), 1);
        assert!(merged.ends_with("b\n"));
        assert_eq!(merge_sections(&[]), "");
    }
}
