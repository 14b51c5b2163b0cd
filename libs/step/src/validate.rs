//! Commands have to be issued in order, and revert is only possible until finalize starts.

use crate::{Phase, StepError, StepStore};

const REVERT_IN_PROGRESS: &str =
    r#"Revert is in progress. Please continue with "gpupgrade revert"."#;
const FINALIZE_IN_PROGRESS: &str =
    r#"Finalize is in progress. Please continue with "gpupgrade finalize"."#;
const RUN_INITIALIZE_FIRST: &str = r#"Please run "gpupgrade initialize" first."#;
const INITIALIZE_IN_PROGRESS: &str =
    r#"Initialize is in progress. Please continue with "gpupgrade initialize"."#;
const RUN_EXECUTE_FIRST: &str = r#"Please run "gpupgrade execute" first."#;
const INITIALIZE_ALREADY_RUN: &str = r#"Initialize has already been run. Please either continue with "gpupgrade execute" or run "gpupgrade revert"."#;
const REVERT_NOT_POSSIBLE: &str = r#"Finalize is in progress and revert is no longer possible. Please continue with "gpupgrade finalize"."#;

/// Checks that `phase` may run given what the store says has already happened.
///
/// Re-entering a phase that is running or failed is allowed so that it can be resumed.
pub fn validate_phase_order(store: &StepStore, phase: Phase) -> Result<(), StepError> {
    match next_action(store, phase).map_err(StepError::Store)? {
        None => Ok(()),
        Some(next_action) => Err(StepError::OutOfOrder {
            next_action: next_action.to_string(),
        }),
    }
}

fn next_action(store: &StepStore, phase: Phase) -> anyhow::Result<Option<&'static str>> {
    let started = |p| store.has_phase_started(p);
    let completed = |p| store.has_phase_completed(p);

    let action = match phase {
        Phase::Initialize => {
            if started(Phase::Revert)? {
                Some(REVERT_IN_PROGRESS)
            } else if started(Phase::Finalize)? {
                Some(FINALIZE_IN_PROGRESS)
            } else if started(Phase::Execute)? {
                Some(INITIALIZE_ALREADY_RUN)
            } else {
                None
            }
        }
        Phase::Execute => {
            if started(Phase::Revert)? {
                Some(REVERT_IN_PROGRESS)
            } else if !started(Phase::Initialize)? {
                Some(RUN_INITIALIZE_FIRST)
            } else if !completed(Phase::Initialize)? {
                Some(INITIALIZE_IN_PROGRESS)
            } else if started(Phase::Finalize)? {
                Some(FINALIZE_IN_PROGRESS)
            } else {
                None
            }
        }
        Phase::Finalize => {
            if started(Phase::Revert)? {
                Some(REVERT_IN_PROGRESS)
            } else if !completed(Phase::Initialize)? {
                Some(RUN_INITIALIZE_FIRST)
            } else if !completed(Phase::Execute)? {
                Some(RUN_EXECUTE_FIRST)
            } else {
                None
            }
        }
        Phase::Revert => {
            if !started(Phase::Initialize)? {
                Some(RUN_INITIALIZE_FIRST)
            } else if started(Phase::Finalize)? {
                Some(REVERT_NOT_POSSIBLE)
            } else {
                None
            }
        }
        // The data migration scripts may be generated and applied around any phase.
        Phase::Generate | Phase::Apply => None,
    };
    Ok(action)
}
