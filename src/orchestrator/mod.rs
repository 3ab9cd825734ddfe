//! End-to-end run loop: resume or create a trace, decide the current
//! step, produce a draft, review it, then freeze, roll back, regenerate
//! or stop. The epic is collected from the reviewer directly instead of
//! being generated. A redo triggers exactly one inline
//! regenerate-and-re-review cycle; anything other than a confirm on that
//! second review falls back to the outer loop without freezing.

use anyhow::Result;
use console::style;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

use crate::artifact::Artifact;
use crate::backend::GenerationBackend;
use crate::engine::{ConfirmedMap, StepGenerator};
use crate::review::{ReviewOutcome, Reviewer};
use crate::router;
use crate::step::Step;
use crate::store::{TraceState, TraceStore};

/// Parameters for one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub trace_id: String,
    /// Default epic title offered when collecting a fresh epic.
    pub epic_title: Option<String>,
    /// Start directly at this step, subject to prerequisite checks.
    pub start_step: Option<Step>,
}

/// Drives the step pipeline for one trace.
pub struct Orchestrator<B, R> {
    store: TraceStore,
    generator: StepGenerator<B>,
    reviewer: R,
}

impl<B: GenerationBackend, R: Reviewer> Orchestrator<B, R> {
    pub fn new(store: TraceStore, generator: StepGenerator<B>, reviewer: R) -> Orchestrator<B, R> {
        Orchestrator {
            store,
            generator,
            reviewer,
        }
    }

    pub fn generator(&self) -> &StepGenerator<B> {
        &self.generator
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<()> {
        let mut state = self.load_or_create(options)?;

        if let Some(target) = options.start_step {
            let check = router::set_start_step(&mut state, target);
            if check.ok {
                self.store.save_state(&mut state)?;
                info!(step = %target, "starting from requested step");
            } else {
                let missing: Vec<String> =
                    check.missing.iter().map(|s| s.to_string()).collect();
                println!(
                    "{} cannot start at {target}: {} not confirmed yet; resuming at {}",
                    style("!").yellow(),
                    missing.join(", "),
                    router::decide_current_step(&state)
                );
            }
        }

        // Per-step redo counts, carried across regeneration cycles so the
        // ceiling holds; cleared when the step is confirmed.
        let mut redo_counts: BTreeMap<Step, u32> = BTreeMap::new();

        'run: loop {
            if state.all_confirmed() {
                println!("{} every step is confirmed.", style("✓").green());
                break;
            }

            let step = router::decide_current_step(&state);
            let confirmed = self.load_confirmed(&state)?;
            let redo_used = redo_counts.get(&step).copied().unwrap_or(0);

            let draft = self.produce_draft(step, &state, &confirmed, None)?;

            match self.reviewer.review(step, draft, redo_used)? {
                ReviewOutcome::Confirm(artifact) => {
                    self.freeze(&mut state, &artifact)?;
                    redo_counts.remove(&step);
                }
                ReviewOutcome::Back => self.go_back(&mut state)?,
                ReviewOutcome::Quit => break 'run,
                ReviewOutcome::Redo(_, count) => {
                    redo_counts.insert(step, count);
                    let hint = self.reviewer.redo_hint()?;
                    let second =
                        self.produce_draft(step, &state, &confirmed, hint.as_deref())?;

                    // one inline re-review; a non-confirm falls through to
                    // the outer loop without freezing
                    match self.reviewer.review(step, second, count)? {
                        ReviewOutcome::Confirm(artifact) => {
                            self.freeze(&mut state, &artifact)?;
                            redo_counts.remove(&step);
                        }
                        ReviewOutcome::Back => self.go_back(&mut state)?,
                        ReviewOutcome::Quit => break 'run,
                        ReviewOutcome::Redo(_, count) => {
                            redo_counts.insert(step, count);
                        }
                    }
                }
            }
        }

        self.print_summary(&state);
        Ok(())
    }

    fn load_or_create(&self, options: &RunOptions) -> Result<TraceState> {
        if self.store.trace_exists(&options.trace_id) {
            let state = self.store.load_state(&options.trace_id)?;
            println!(
                "{} resuming trace {} at {}",
                style("→").cyan(),
                style(&state.trace_id).bold(),
                router::decide_current_step(&state)
            );
            Ok(state)
        } else {
            let state = self
                .store
                .create_trace(&options.trace_id, options.epic_title.as_deref())?;
            println!(
                "{} created trace {} under {}",
                style("→").cyan(),
                style(&state.trace_id).bold(),
                self.store.trace_dir(&state.trace_id).display()
            );
            Ok(state)
        }
    }

    fn load_confirmed(&self, state: &TraceState) -> Result<ConfirmedMap> {
        let mut confirmed = ConfirmedMap::new();
        for step in Step::ALL {
            if let Some(artifact) = self.store.get_confirmed(state, step)? {
                confirmed.insert(step, artifact);
            }
        }
        Ok(confirmed)
    }

    /// Produce the draft for a step: the epic is collected from the
    /// reviewer while unconfirmed; everything else is generated.
    fn produce_draft(
        &mut self,
        step: Step,
        state: &TraceState,
        confirmed: &ConfirmedMap,
        redo_hint: Option<&str>,
    ) -> Result<Artifact> {
        if step == Step::Epic && !state.confirmed.contains_key(&Step::Epic) {
            let default_title = state
                .meta
                .get("epic_title")
                .and_then(Value::as_str)
                .unwrap_or(&state.trace_id)
                .to_string();
            let epic = self.reviewer.collect_epic(&default_title)?;
            return Ok(Artifact::Epic(epic));
        }

        println!("{} generating {step}...", style("→").cyan());
        let artifact = self
            .generator
            .generate_step(step, state, confirmed, redo_hint)?;
        Ok(artifact)
    }

    fn freeze(&self, state: &mut TraceState, artifact: &Artifact) -> Result<()> {
        let step = artifact.step();
        let version = TraceStore::next_version(state, step);
        let path = self.store.freeze_confirmed(state, artifact, version)?;
        println!(
            "{} froze {step} v{version} at {}",
            style("✓").green(),
            path.display()
        );
        Ok(())
    }

    fn go_back(&self, state: &mut TraceState) -> Result<()> {
        match router::on_back(state) {
            Some(target) => {
                self.store.rollback_to(state, target, false)?;
                println!(
                    "{} rolled back to {target}; next step: {}",
                    style("←").yellow(),
                    router::decide_current_step(state)
                );
            }
            None => println!("{} already at the first step.", style("!").yellow()),
        }
        Ok(())
    }

    fn print_summary(&self, state: &TraceState) {
        println!();
        println!("{}", style("Run summary").bold());
        println!("  trace:   {}", state.trace_id);
        println!("  at step: {}", router::decide_current_step(state));
        for step in Step::ALL {
            match state.confirmed.get(&step) {
                Some(path) => println!("  {} {step}: {}", style("✓").green(), path.display()),
                None => println!("  {} {step}", style("·").dim()),
            }
        }
    }
}
