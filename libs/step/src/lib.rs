//! The step framework: every phase of an upgrade is a [`Step`] made of substeps whose
//! statuses survive crashes in a [`StepStore`], so that rerunning a phase picks up where
//! the previous attempt stopped.

mod console;
mod error;
mod step;
mod store;
mod substep;
mod validate;

pub use console::{format_status, ConsoleStreams, OutStreams};
pub use error::{find_next_action, NextActionError, StepError, SubstepError};
pub use step::{generic_next_action, BeginOptions, Step};
pub use store::{Status, StepStore, STEPS_FILE_NAME};
pub use substep::{Phase, Substep};
pub use validate::validate_phase_order;
