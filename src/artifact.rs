//! Artifact shapes and their normalization boundary.
//!
//! Backends and older trace directories produce loosely shaped data:
//! sometimes a bare list, sometimes a wrapped object, with several
//! historical key-name variants. `Artifact::ingest` is the single place
//! where that variance is resolved into a closed tagged union; everything
//! downstream (distillation, review editing, freezing) works on the
//! normalized shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::step::Step;

/// Wrapper keys historically used for feature lists.
pub const FEATURE_LIST_KEYS: [&str; 3] = ["features", "items", "data"];
/// Wrapper keys historically used for story lists.
pub const STORY_LIST_KEYS: [&str; 4] = ["user_stories", "stories", "items", "data"];
/// Wrapper keys historically used for test case lists.
pub const CASE_LIST_KEYS: [&str; 4] = ["test_cases", "cases", "items", "data"];

/// Priority assigned when the backend omits one.
pub const DEFAULT_TEST_PRIORITY: &str = "P2";

/// A confirmed or draft artifact for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Epic(Value),
    Features(Vec<Value>),
    Stories(Vec<Value>),
    TestPlan(Value),
    TestCases(Vec<TestCase>),
    AutomatedTests(String),
}

/// One structured test case, normalized per the pipeline invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub story_id: String,
    pub title: String,
    pub priority: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected: Vec<String>,
    #[serde(default)]
    pub test_data: Map<String, Value>,
}

impl TestCase {
    /// Normalize a raw backend object into a test case.
    ///
    /// `story_id` is the owning story; `position` is the 1-based index
    /// within that story's sequence, used to synthesize missing fields.
    pub fn normalize(raw: &Value, story_id: &str, position: usize) -> TestCase {
        let obj = raw.as_object();
        let get = |key: &str| obj.and_then(|o| o.get(key));

        let story_id = get("story_id")
            .and_then(nonempty_string)
            .unwrap_or_else(|| story_id.to_string());

        let id = get("id")
            .and_then(nonempty_string)
            .unwrap_or_else(|| format!("TC-{story_id}-{position}"));

        let title = get("title")
            .and_then(nonempty_string)
            .unwrap_or_else(|| format!("Test case for {story_id} #{position}"));

        let priority = get("priority")
            .and_then(nonempty_string)
            .unwrap_or_else(|| DEFAULT_TEST_PRIORITY.to_string());

        TestCase {
            id,
            story_id,
            title,
            priority,
            preconditions: coerce_string_list(get("preconditions")),
            steps: coerce_string_list(get("steps")),
            expected: coerce_string_list(get("expected")),
            test_data: coerce_object(get("test_data")),
        }
    }

    /// A minimal case appended by a review `add` command.
    pub fn titled(title: &str, position: usize) -> TestCase {
        TestCase {
            id: format!("TC-UNKNOWN-{position}"),
            story_id: "UNKNOWN".to_string(),
            title: title.to_string(),
            priority: DEFAULT_TEST_PRIORITY.to_string(),
            preconditions: Vec::new(),
            steps: Vec::new(),
            expected: Vec::new(),
            test_data: Map::new(),
        }
    }
}

/// Coerce a field into an ordered sequence of strings.
/// Absent -> empty; a single string -> one element; non-string list
/// members are stringified.
fn coerce_string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(other) => vec![value_to_string(other)],
    }
}

/// Coerce a field into a key/value object.
/// A list becomes `{"items": [...]}`, a scalar becomes `{"value": ...}`.
fn coerce_object(v: Option<&Value>) -> Map<String, Value> {
    match v {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(Value::Array(items)) => {
            let mut m = Map::new();
            m.insert("items".to_string(), Value::Array(items.clone()));
            m
        }
        Some(other) => {
            let mut m = Map::new();
            m.insert("value".to_string(), Value::String(value_to_string(other)));
            m
        }
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn nonempty_string(v: &Value) -> Option<String> {
    let s = value_to_string(v);
    let s = s.trim();
    (!s.is_empty() && !v.is_null()).then(|| s.to_string())
}

/// Unwrap `{"<key>": [...]}` into the inner list, trying each candidate
/// key in order. A bare list passes through; anything else becomes a
/// one-item list.
pub fn unwrap_list(value: Value, key_candidates: &[&str]) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(ref obj) => {
            for key in key_candidates {
                if let Some(Value::Array(items)) = obj.get(*key) {
                    return items.clone();
                }
            }
            vec![value]
        }
        other => vec![other],
    }
}

/// Normalize a raw backend result into a test case sequence for one
/// story: unwraps common wrapper keys, treats a single bare case object
/// as a one-item sequence, and drops non-object members.
pub fn normalize_case_objects(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.into_iter().filter(|v| v.is_object()).collect(),
        Value::Object(ref obj) => {
            for key in CASE_LIST_KEYS {
                if let Some(Value::Array(items)) = obj.get(key) {
                    return items.iter().filter(|v| v.is_object()).cloned().collect();
                }
            }
            // A single bare test case object counts as a one-item sequence.
            if obj.contains_key("id") && (obj.contains_key("steps") || obj.contains_key("expected"))
            {
                return vec![value];
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

impl Artifact {
    /// Normalize a raw JSON value into the artifact shape for `step`.
    pub fn ingest(step: Step, value: Value) -> Artifact {
        match step {
            Step::Epic => Artifact::Epic(value),
            Step::Features => Artifact::Features(unwrap_list(value, &FEATURE_LIST_KEYS)),
            Step::Stories => Artifact::Stories(unwrap_list(value, &STORY_LIST_KEYS)),
            Step::TestPlan => Artifact::TestPlan(value),
            Step::TestCases => {
                let cases = normalize_case_objects(value)
                    .iter()
                    .enumerate()
                    .map(|(i, raw)| TestCase::normalize(raw, "UNKNOWN", i + 1))
                    .collect();
                Artifact::TestCases(cases)
            }
            Step::AutomatedTests => match value {
                Value::String(text) => Artifact::AutomatedTests(text),
                other => Artifact::AutomatedTests(other.to_string()),
            },
        }
    }

    /// The step this artifact belongs to.
    pub fn step(&self) -> Step {
        match self {
            Artifact::Epic(_) => Step::Epic,
            Artifact::Features(_) => Step::Features,
            Artifact::Stories(_) => Step::Stories,
            Artifact::TestPlan(_) => Step::TestPlan,
            Artifact::TestCases(_) => Step::TestCases,
            Artifact::AutomatedTests(_) => Step::AutomatedTests,
        }
    }

    /// Canonical JSON form for persistence. List artifacts are written
    /// wrapped under their stable key so older readers keep working.
    /// `None` for the raw-text automated tests artifact.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Artifact::Epic(v) | Artifact::TestPlan(v) => Some(v.clone()),
            Artifact::Features(items) => Some(json!({ "features": items })),
            Artifact::Stories(items) => Some(json!({ "user_stories": items })),
            Artifact::TestCases(cases) => Some(json!({ "test_cases": cases })),
            Artifact::AutomatedTests(_) => None,
        }
    }

    /// Raw text form, for the automated tests artifact only.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Artifact::AutomatedTests(text) => Some(text),
            _ => None,
        }
    }

    /// Number of list items, or `None` for non-list artifacts.
    pub fn item_count(&self) -> Option<usize> {
        match self {
            Artifact::Features(items) | Artifact::Stories(items) => Some(items.len()),
            Artifact::TestCases(cases) => Some(cases.len()),
            _ => None,
        }
    }

    /// Whether review edit commands apply to this artifact.
    pub fn is_list(&self) -> bool {
        self.item_count().is_some()
    }

    /// Display titles for list items, 1-based to match the review grammar.
    pub fn display_lines(&self) -> Vec<String> {
        match self {
            Artifact::Features(items) | Artifact::Stories(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}. {}", i + 1, item_title(item, i + 1)))
                .collect(),
            Artifact::TestCases(cases) => cases
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{}. [{}] {} ({})", i + 1, c.id, c.title, c.priority))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Keep exactly the given 1-based indices, in the order given.
    /// Out-of-range indices are skipped silently. Returns how many items
    /// remain, or an error when the artifact is not a list.
    pub fn keep(&mut self, indices: &[usize]) -> Result<usize, String> {
        fn select<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
            indices
                .iter()
                .filter_map(|&i| (i >= 1).then(|| items.get(i - 1)).flatten())
                .cloned()
                .collect()
        }
        match self {
            Artifact::Features(items) | Artifact::Stories(items) => {
                *items = select(items, indices);
                Ok(items.len())
            }
            Artifact::TestCases(cases) => {
                *cases = select(cases, indices);
                Ok(cases.len())
            }
            _ => Err("this artifact is not a list".to_string()),
        }
    }

    /// Remove exactly one item by 1-based index.
    pub fn drop_one(&mut self, index: usize) -> Result<(), String> {
        fn remove<T>(items: &mut Vec<T>, index: usize) -> Result<(), String> {
            if index < 1 || index > items.len() {
                return Err("index out of range".to_string());
            }
            items.remove(index - 1);
            Ok(())
        }
        match self {
            Artifact::Features(items) | Artifact::Stories(items) => remove(items, index),
            Artifact::TestCases(cases) => remove(cases, index),
            _ => Err("this artifact is not a list".to_string()),
        }
    }

    /// Set the display name of the item at a 1-based index. Prefers an
    /// existing `name` field, then `title`, else creates `name`.
    pub fn rename(&mut self, index: usize, new_name: &str) -> Result<(), String> {
        match self {
            Artifact::Features(items) | Artifact::Stories(items) => {
                let item = items
                    .get_mut(index.wrapping_sub(1))
                    .ok_or("index out of range")?;
                match item {
                    Value::Object(obj) => {
                        let key = if !obj.contains_key("name") && obj.contains_key("title") {
                            "title"
                        } else {
                            "name"
                        };
                        obj.insert(key.to_string(), Value::String(new_name.to_string()));
                    }
                    other => *other = Value::String(new_name.to_string()),
                }
                Ok(())
            }
            Artifact::TestCases(cases) => {
                let case = cases
                    .get_mut(index.wrapping_sub(1))
                    .ok_or("index out of range")?;
                case.title = new_name.to_string();
                Ok(())
            }
            _ => Err("this artifact is not a list".to_string()),
        }
    }

    /// Append a new item titled `name`.
    pub fn add(&mut self, name: &str) -> Result<(), String> {
        match self {
            Artifact::Features(items) | Artifact::Stories(items) => {
                items.push(json!({ "name": name }));
                Ok(())
            }
            Artifact::TestCases(cases) => {
                let position = cases.len() + 1;
                cases.push(TestCase::titled(name, position));
                Ok(())
            }
            _ => Err("this artifact is not a list".to_string()),
        }
    }
}

/// Display title for a raw list item: `name`, then `title`, then `id`,
/// then a positional placeholder.
fn item_title(item: &Value, position: usize) -> String {
    if let Some(obj) = item.as_object() {
        for key in ["name", "title", "id"] {
            if let Some(v) = obj.get(key)
                && let Some(s) = nonempty_string(v)
            {
                return s;
            }
        }
        return format!("item-{position}");
    }
    value_to_string(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_features_unwraps_wrapper_variants() {
        for key in ["features", "items", "data"] {
            let value = json!({ key: [{"name": "login"}, {"name": "signup"}] });
            let art = Artifact::ingest(Step::Features, value);
            assert_eq!(art.item_count(), Some(2));
        }
    }

    #[test]
    fn test_ingest_accepts_bare_list() {
        let art = Artifact::ingest(Step::Stories, json!([{"title": "s1"}]));
        assert_eq!(art.item_count(), Some(1));
    }

    #[test]
    fn test_ingest_stories_accepts_user_stories_key() {
        let art = Artifact::ingest(Step::Stories, json!({"user_stories": [{}, {}, {}]}));
        assert_eq!(art.item_count(), Some(3));
    }

    #[test]
    fn test_ingest_wraps_single_object_as_one_item_list() {
        let art = Artifact::ingest(Step::Features, json!({"name": "only one"}));
        assert_eq!(art.item_count(), Some(1));
    }

    #[test]
    fn test_ingest_automated_tests_from_string() {
        let art = Artifact::ingest(Step::AutomatedTests, json!("describe('x', ...)"));
        assert_eq!(art.as_text(), Some("describe('x', ...)"));
    }

    #[test]
    fn test_normalize_case_single_bare_object() {
        let cases = normalize_case_objects(json!({"id": "TC-1", "steps": ["go"]}));
        assert_eq!(cases.len(), 1);
    }

    #[test]
    fn test_normalize_case_object_without_case_fields_is_dropped() {
        let cases = normalize_case_objects(json!({"note": "not a case"}));
        assert!(cases.is_empty());
    }

    #[test]
    fn test_normalize_case_drops_non_objects() {
        let cases = normalize_case_objects(json!({"test_cases": [{"id": "a"}, "junk", 3]}));
        assert_eq!(cases.len(), 1);
    }

    #[test]
    fn test_test_case_defaults_are_synthesized() {
        let tc = TestCase::normalize(&json!({}), "US-1", 2);
        assert_eq!(tc.id, "TC-US-1-2");
        assert_eq!(tc.story_id, "US-1");
        assert_eq!(tc.priority, DEFAULT_TEST_PRIORITY);
        assert_eq!(tc.title, "Test case for US-1 #2");
        assert!(tc.steps.is_empty());
        assert!(tc.test_data.is_empty());
    }

    #[test]
    fn test_test_case_string_steps_become_one_element_list() {
        let tc = TestCase::normalize(&json!({"steps": "click the button"}), "US-1", 1);
        assert_eq!(tc.steps, vec!["click the button"]);
    }

    #[test]
    fn test_test_case_list_fields_stringify_members() {
        let tc = TestCase::normalize(&json!({"expected": ["ok", 200]}), "US-1", 1);
        assert_eq!(tc.expected, vec!["ok", "200"]);
    }

    #[test]
    fn test_test_case_test_data_coercions() {
        let list = TestCase::normalize(&json!({"test_data": [1, 2]}), "US-1", 1);
        assert_eq!(list.test_data.get("items"), Some(&json!([1, 2])));

        let scalar = TestCase::normalize(&json!({"test_data": "admin"}), "US-1", 1);
        assert_eq!(scalar.test_data.get("value"), Some(&json!("admin")));

        let obj = TestCase::normalize(&json!({"test_data": {"user": "a"}}), "US-1", 1);
        assert_eq!(obj.test_data.get("user"), Some(&json!("a")));
    }

    #[test]
    fn test_test_case_keeps_own_story_id() {
        let tc = TestCase::normalize(&json!({"story_id": "US-9"}), "US-1", 1);
        assert_eq!(tc.story_id, "US-9");
    }

    #[test]
    fn test_keep_reorders_and_skips_out_of_range() {
        let mut art = Artifact::ingest(
            Step::Features,
            json!([{"name": "a"}, {"name": "b"}, {"name": "c"}]),
        );
        let kept = art.keep(&[2, 1, 9]).unwrap();
        assert_eq!(kept, 2);
        assert_eq!(art.display_lines(), vec!["1. b", "2. a"]);
    }

    #[test]
    fn test_drop_rejects_out_of_range() {
        let mut art = Artifact::ingest(Step::Features, json!([{"name": "a"}]));
        assert!(art.drop_one(2).is_err());
        assert!(art.drop_one(0).is_err());
        art.drop_one(1).unwrap();
        assert_eq!(art.item_count(), Some(0));
    }

    #[test]
    fn test_rename_prefers_name_then_title_then_creates_name() {
        let mut art = Artifact::ingest(
            Step::Features,
            json!([{"name": "old"}, {"title": "old"}, {"id": "f3"}]),
        );
        art.rename(1, "new-a").unwrap();
        art.rename(2, "new-b").unwrap();
        art.rename(3, "new-c").unwrap();
        match &art {
            Artifact::Features(items) => {
                assert_eq!(items[0]["name"], "new-a");
                assert_eq!(items[1]["title"], "new-b");
                assert_eq!(items[2]["name"], "new-c");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_rename_test_case_sets_title() {
        let mut art = Artifact::TestCases(vec![TestCase::titled("old", 1)]);
        art.rename(1, "new title").unwrap();
        match &art {
            Artifact::TestCases(cases) => assert_eq!(cases[0].title, "new title"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_add_appends_named_item() {
        let mut art = Artifact::ingest(Step::Features, json!([]));
        art.add("brand new").unwrap();
        assert_eq!(art.display_lines(), vec!["1. brand new"]);
    }

    #[test]
    fn test_edits_rejected_on_non_list() {
        let mut art = Artifact::ingest(Step::Epic, json!({"title": "t"}));
        assert!(art.keep(&[1]).is_err());
        assert!(art.add("x").is_err());
        assert!(art.rename(1, "x").is_err());
    }

    #[test]
    fn test_to_value_wraps_lists_under_stable_keys() {
        let features = Artifact::ingest(Step::Features, json!([{"name": "a"}]));
        assert!(features.to_value().unwrap().get("features").is_some());

        let stories = Artifact::ingest(Step::Stories, json!([{"title": "s"}]));
        assert!(stories.to_value().unwrap().get("user_stories").is_some());

        let cases = Artifact::TestCases(vec![TestCase::titled("t", 1)]);
        assert!(cases.to_value().unwrap().get("test_cases").is_some());

        let code = Artifact::AutomatedTests("text".into());
        assert!(code.to_value().is_none());
    }

    #[test]
    fn test_display_title_preference() {
        assert_eq!(item_title(&json!({"name": "n", "title": "t"}), 1), "n");
        assert_eq!(item_title(&json!({"title": "t", "id": "i"}), 1), "t");
        assert_eq!(item_title(&json!({"id": "i"}), 1), "i");
        assert_eq!(item_title(&json!({}), 4), "item-4");
        assert_eq!(item_title(&json!("plain"), 1), "plain");
    }
}
