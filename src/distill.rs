//! Distillation of confirmed artifacts into bounded prompt context.
//!
//! Each structured step type gets a field projection keeping only the
//! id/title/description-class fields downstream prompts need, tolerant of
//! historical key-name variants. Projected structures are serialized and
//! clipped to a fixed character budget; clipping always yields a valid
//! UTF-8 prefix with a trailing ellipsis marker.

use serde_json::{Value, json};

use crate::artifact::TestCase;
use crate::util::clip_chars;

// Whole-step context budgets (chars).
pub const MAX_EPIC_CHARS: usize = 1800;
pub const MAX_FEATURES_CHARS: usize = 2500;
pub const MAX_STORIES_CHARS: usize = 2800;
pub const MAX_TESTPLAN_CHARS: usize = 2500;
pub const MAX_TESTCASES_CHARS: usize = 3500;

// Per-item context budgets for the batched paths (smaller, except test
// cases where automation prompts need more room).
pub const MAX_SINGLE_STORY_CHARS: usize = 1400;
pub const MAX_SINGLE_FEATURE_CHARS: usize = 1200;
pub const MAX_SINGLE_TESTPLAN_CHARS: usize = 1400;
pub const MAX_SINGLE_TESTCASES_CHARS: usize = 4500;

fn field(obj: &Value, keys: &[&str]) -> Value {
    for key in keys {
        if let Some(v) = obj.get(*key)
            && !v.is_null()
        {
            return v.clone();
        }
    }
    Value::Null
}

/// Project one feature down to id/name/description.
pub fn feature_digest(feature: &Value) -> Value {
    json!({
        "id": field(feature, &["id", "feature_id"]),
        "name": field(feature, &["name", "title"]),
        "description": field(feature, &["description", "summary"]),
    })
}

/// Project one story down to id/feature_id/title/acceptance criteria.
pub fn story_digest(story: &Value) -> Value {
    json!({
        "id": field(story, &["id", "story_id"]),
        "feature_id": field(story, &["feature_id"]),
        "title": field(story, &["title", "name"]),
        "acceptance_criteria": field(story, &["acceptance_criteria", "ac"]),
    })
}

/// The story's id, synthesizing `US-{position}` when absent.
pub fn story_id_of(story: &Value, position: usize) -> String {
    match field(story, &["id", "story_id"]) {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Null => format!("US-{position}"),
        other => other.to_string(),
    }
}

/// Project a test plan down to its planning fields.
pub fn plan_digest(plan: &Value) -> Value {
    if !plan.is_object() {
        return plan.clone();
    }
    json!({
        "scope": field(plan, &["scope"]),
        "in_scope": field(plan, &["in_scope"]),
        "out_of_scope": field(plan, &["out_of_scope"]),
        "test_types": field(plan, &["test_types"]),
        "environments": field(plan, &["environments"]),
        "entry_criteria": field(plan, &["entry_criteria"]),
        "exit_criteria": field(plan, &["exit_criteria"]),
        "risks": field(plan, &["risks"]),
    })
}

pub fn distill_features(features: &[Value]) -> Value {
    Value::Array(features.iter().map(feature_digest).collect())
}

pub fn distill_stories(stories: &[Value]) -> Value {
    Value::Array(stories.iter().map(story_digest).collect())
}

/// Test cases are already normalized; distillation is their full
/// structured form.
pub fn distill_test_cases(cases: &[TestCase]) -> Value {
    serde_json::to_value(cases).unwrap_or(Value::Null)
}

/// Serialize a value as pretty JSON clipped to `max_chars` characters.
pub fn clip_value(value: &Value, max_chars: usize) -> String {
    let s = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    clip_chars(s.trim(), max_chars)
}
