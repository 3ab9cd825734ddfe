//! Per-trace state persistence and frozen artifact files.
//!
//! One directory per trace under an explicitly configured output root
//! holds `state.json` plus one version-suffixed file per confirmed step.
//! The state document is the single source of truth for resume; every
//! mutation rewrites it with a fresh `updated_at` timestamp.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::Artifact;
use crate::step::Step;

/// The persisted per-trace state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceState {
    pub trace_id: String,
    pub created_at: String,
    pub updated_at: String,
    /// `None` when the stored tag is absent or unrecognized; resume then
    /// falls back to the first unconfirmed step.
    #[serde(default, deserialize_with = "step_tag_tolerant")]
    pub current_step: Option<Step>,
    #[serde(default)]
    pub confirmed: BTreeMap<Step, PathBuf>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// Deserialize a step tag, mapping unknown/invalid tags to `None`
/// instead of failing the whole state document.
fn step_tag_tolerant<'de, D>(deserializer: D) -> Result<Option<Step>, D::Error>
where
    D: Deserializer<'de>,
{
    let tag: Option<String> = Option::deserialize(deserializer)?;
    Ok(tag.and_then(|t| t.parse().ok()))
}

impl TraceState {
    /// Whether every step of the pipeline has a confirmed artifact.
    pub fn all_confirmed(&self) -> bool {
        Step::ALL.iter().all(|s| self.confirmed.contains_key(s))
    }

    /// The first step with no confirmed artifact, or the last step when
    /// everything is confirmed.
    pub fn first_unconfirmed(&self) -> Step {
        Step::ALL
            .into_iter()
            .find(|s| !self.confirmed.contains_key(s))
            .unwrap_or(Step::AutomatedTests)
    }
}

fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Filesystem store for trace state and frozen artifacts.
pub struct TraceStore {
    out_root: PathBuf,
}

impl TraceStore {
    /// Create a store rooted at `out_root`, creating the directory if
    /// needed. The root is always explicit; there is no process-wide
    /// default location.
    pub fn new(out_root: PathBuf) -> Result<TraceStore> {
        fs::create_dir_all(&out_root).with_context(|| {
            format!("Failed to create output root: {}", out_root.display())
        })?;
        Ok(TraceStore { out_root })
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    pub fn trace_dir(&self, trace_id: &str) -> PathBuf {
        self.out_root.join(trace_id)
    }

    fn state_path(&self, trace_id: &str) -> PathBuf {
        self.trace_dir(trace_id).join("state.json")
    }

    pub fn trace_exists(&self, trace_id: &str) -> bool {
        self.state_path(trace_id).exists()
    }

    /// Create the trace directory and the initial state document.
    /// Callers check `trace_exists` first; an existing state file is
    /// overwritten.
    pub fn create_trace(&self, trace_id: &str, epic_title: Option<&str>) -> Result<TraceState> {
        let trace_dir = self.trace_dir(trace_id);
        fs::create_dir_all(&trace_dir)
            .with_context(|| format!("Failed to create trace directory: {}", trace_dir.display()))?;

        let now = utc_now();
        let mut meta = Map::new();
        if let Some(title) = epic_title {
            meta.insert("epic_title".to_string(), Value::String(title.to_string()));
        }

        let mut state = TraceState {
            trace_id: trace_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
            current_step: Some(Step::Epic),
            confirmed: BTreeMap::new(),
            meta,
        };

        self.save_state(&mut state)?;
        Ok(state)
    }

    pub fn load_state(&self, trace_id: &str) -> Result<TraceState> {
        let path = self.state_path(trace_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let state: TraceState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state JSON: {}", path.display()))?;
        Ok(state)
    }

    /// Persist the state document, refreshing `updated_at`.
    pub fn save_state(&self, state: &mut TraceState) -> Result<()> {
        state.updated_at = utc_now();
        let path = self.state_path(&state.trace_id);
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize trace state")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;
        Ok(())
    }

    /// Version tag for the next freeze of `step`: 1 on first confirm,
    /// always exactly 2 on any re-confirm (later re-confirmations
    /// overwrite the v2 file rather than incrementing further).
    pub fn next_version(state: &TraceState, step: Step) -> u32 {
        if state.confirmed.contains_key(&step) { 2 } else { 1 }
    }

    /// Write the confirmed artifact for its step, record the path, and
    /// advance `current_step` to the first still-unconfirmed step.
    /// Returns the written path.
    pub fn freeze_confirmed(
        &self,
        state: &mut TraceState,
        artifact: &Artifact,
        version: u32,
    ) -> Result<PathBuf> {
        let step = artifact.step();
        let trace_dir = self.trace_dir(&state.trace_id);
        let prefix = step.file_prefix();

        let path = if let Some(text) = artifact.as_text() {
            let path = trace_dir.join(format!("{prefix}.confirmed.v{version}.spec.ts"));
            fs::write(&path, text)
                .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
            path
        } else {
            let value = artifact
                .to_value()
                .context("non-text artifact with no JSON form")?;
            let path = trace_dir.join(format!("{prefix}.confirmed.v{version}.json"));
            let content = serde_json::to_string_pretty(&value)
                .context("Failed to serialize artifact JSON")?;
            fs::write(&path, content)
                .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
            path
        };

        state.confirmed.insert(step, path.clone());
        state.current_step = Some(state.first_unconfirmed());
        self.save_state(state)?;
        Ok(path)
    }

    /// Load the confirmed artifact for `step`, or `None` when the step
    /// has no recorded path or the file no longer exists on disk.
    pub fn get_confirmed(&self, state: &TraceState, step: Step) -> Result<Option<Artifact>> {
        let Some(path) = state.confirmed.get(&step) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_lowercase().as_str(), "ts" | "txt" | "md"));

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact: {}", path.display()))?;

        if is_text {
            Ok(Some(Artifact::AutomatedTests(content)))
        } else {
            let value: Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse artifact JSON: {}", path.display()))?;
            Ok(Some(Artifact::ingest(step, value)))
        }
    }

    /// Remove every step strictly after `target` from `confirmed`,
    /// optionally deleting their files. The only mutation that can move
    /// `current_step` backward.
    pub fn rollback_to(
        &self,
        state: &mut TraceState,
        target: Step,
        delete_files: bool,
    ) -> Result<()> {
        for step in Step::ALL.into_iter().filter(|s| *s > target) {
            if let Some(old_path) = state.confirmed.remove(&step)
                && delete_files
                && old_path.exists()
            {
                fs::remove_file(&old_path).with_context(|| {
                    format!("Failed to delete rolled-back artifact: {}", old_path.display())
                })?;
            }
        }

        state.current_step = Some(if state.confirmed.contains_key(&target) {
            state.first_unconfirmed()
        } else {
            target
        });

        self.save_state(state)?;
        Ok(())
    }
}
