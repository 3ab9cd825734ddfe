//! Resume and start-from-middle routing over the step sequence.
//!
//! Pure functions over `TraceState`: deciding which step runs next,
//! validating a requested start step against its prerequisites, and
//! computing the rollback target for `back`. Persistence stays with the
//! caller.

use crate::step::Step;
use crate::store::TraceState;

/// Outcome of a start-from-middle prerequisite check.
#[derive(Debug, Clone, PartialEq)]
pub struct StartCheck {
    pub ok: bool,
    /// Unconfirmed prerequisites, in step order. Empty when `ok`.
    pub missing: Vec<Step>,
}

impl StartCheck {
    fn ok() -> StartCheck {
        StartCheck {
            ok: true,
            missing: Vec::new(),
        }
    }
}

/// The step that should run next. The stored `current_step` wins when
/// valid; otherwise the first unconfirmed step, or the last step when
/// everything is confirmed.
pub fn decide_current_step(state: &TraceState) -> Step {
    state.current_step.unwrap_or_else(|| state.first_unconfirmed())
}

/// Whether the run may start directly at `target`: allowed only when
/// every step strictly before it is already confirmed.
pub fn can_start_from(state: &TraceState, target: Step) -> StartCheck {
    let missing: Vec<Step> = target
        .prerequisites()
        .iter()
        .copied()
        .filter(|s| !state.confirmed.contains_key(s))
        .collect();

    if missing.is_empty() {
        StartCheck::ok()
    } else {
        StartCheck { ok: false, missing }
    }
}

/// Overwrite `current_step` with `target` when its prerequisites are
/// satisfied. The caller is responsible for persisting the state.
pub fn set_start_step(state: &mut TraceState, target: Step) -> StartCheck {
    let check = can_start_from(state, target);
    if check.ok {
        state.current_step = Some(target);
    }
    check
}

/// The rollback target for a `back` command: the step immediately before
/// the current one, or `None` at the first step.
pub fn on_back(state: &TraceState) -> Option<Step> {
    decide_current_step(state).prev()
}
