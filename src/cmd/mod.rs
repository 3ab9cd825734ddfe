//! Command bodies for the CLI entry point.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};

use testloom::backend::CommandBackend;
use testloom::engine::{GeneratorConfig, StepGenerator};
use testloom::orchestrator::{Orchestrator, RunOptions};
use testloom::prompts::PromptLibrary;
use testloom::review::{ConsoleReviewer, DEFAULT_MAX_REDO};
use testloom::router;
use testloom::step::Step;
use testloom::store::TraceStore;

/// Run (or resume) the pipeline for one trace.
pub fn cmd_run(
    out_dir: &Path,
    trace_id: &str,
    epic_title: Option<&str>,
    start_step: Option<Step>,
    prompts_dir: Option<&Path>,
) -> Result<()> {
    let store = TraceStore::new(out_dir.to_path_buf())?;
    let prompts = match prompts_dir {
        Some(dir) => PromptLibrary::from_dir(dir.to_path_buf()),
        None => PromptLibrary::builtin(),
    };
    let generator = StepGenerator::new(CommandBackend::new(), prompts, GeneratorConfig::default());
    let reviewer = ConsoleReviewer::new(DEFAULT_MAX_REDO);

    let mut orchestrator = Orchestrator::new(store, generator, reviewer);
    orchestrator.run(&RunOptions {
        trace_id: trace_id.to_string(),
        epic_title: epic_title.map(str::to_string),
        start_step,
    })
}

/// List every trace under the output root with its position.
pub fn cmd_status(out_dir: &Path) -> Result<()> {
    if !out_dir.exists() {
        println!("No traces yet under {}", out_dir.display());
        return Ok(());
    }

    let store = TraceStore::new(out_dir.to_path_buf())?;
    let mut trace_ids: Vec<String> = std::fs::read_dir(out_dir)
        .with_context(|| format!("Failed to read output root: {}", out_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("state.json").exists())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    trace_ids.sort();

    if trace_ids.is_empty() {
        println!("No traces yet under {}", out_dir.display());
        return Ok(());
    }

    for trace_id in trace_ids {
        let state = store.load_state(&trace_id)?;
        let confirmed = Step::ALL
            .iter()
            .filter(|s| state.confirmed.contains_key(s))
            .count();
        let position = if state.all_confirmed() {
            style("complete".to_string()).green()
        } else {
            style(format!("at {}", router::decide_current_step(&state))).cyan()
        };
        println!(
            "{}  {position}  ({confirmed}/{} confirmed, updated {})",
            style(&trace_id).bold(),
            Step::ALL.len(),
            state.updated_at
        );
    }
    Ok(())
}

/// Default output root, overridable per invocation.
pub fn default_out_dir() -> PathBuf {
    PathBuf::from("output")
}
