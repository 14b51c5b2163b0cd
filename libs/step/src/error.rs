use crate::Substep;

/// Outcome of a substep body other than plain success.
#[derive(thiserror::Error, Debug)]
pub enum SubstepError {
    /// The substep did not need to do anything. It is recorded as complete and shown as
    /// skipped.
    #[error("skipped")]
    Skip,
    /// The operator chose to quit from a prompt inside the substep.
    #[error("quit")]
    Quit,
    #[error(transparent)]
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for SubstepError {
    fn from(e: anyhow::Error) -> Self {
        SubstepError::Failed(e)
    }
}

impl From<utils::exec::ExecError> for SubstepError {
    fn from(e: utils::exec::ExecError) -> Self {
        SubstepError::Failed(e.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StepError {
    #[error("canceled")]
    UserCanceled,
    #[error("quit")]
    Quit,
    #[error("gpupgrade commands must be run in order")]
    OutOfOrder { next_action: String },
    #[error("substep \"{substep}\": {error:#}")]
    Substep { substep: Substep, error: anyhow::Error },
    /// A substep that ran on the hub. The hub already reported its name and status.
    #[error("{0:#}")]
    Hub(anyhow::Error),
    #[error("step store: {0:#}")]
    Store(anyhow::Error),
    #[error("read confirmation: {0}")]
    Prompt(std::io::Error),
}

impl StepError {
    /// True for the outcomes the operator asked for, which are not reported as errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StepError::UserCanceled | StepError::Quit)
    }

    /// The most specific next action attached to this error, if any.
    pub fn next_action(&self) -> Option<&str> {
        match self {
            StepError::OutOfOrder { next_action } => Some(next_action),
            StepError::Substep { error, .. } | StepError::Hub(error) => {
                find_next_action(error).map(|e| e.next_action.as_str())
            }
            _ => None,
        }
    }
}

/// An error with operator-visible advice on how to proceed.
#[derive(thiserror::Error, Debug)]
#[error("{error:#}")]
pub struct NextActionError {
    pub error: anyhow::Error,
    pub next_action: String,
}

impl NextActionError {
    pub fn new(error: impl Into<anyhow::Error>, next_action: impl Into<String>) -> Self {
        NextActionError {
            error: error.into(),
            next_action: next_action.into(),
        }
    }

    /// The step error this wraps, if it wraps one directly.
    pub fn step_error(&self) -> Option<&StepError> {
        self.error.downcast_ref::<StepError>()
    }
}

/// Finds a [`NextActionError`] anywhere in the chain of `err`.
pub fn find_next_action(err: &anyhow::Error) -> Option<&NextActionError> {
    err.chain().find_map(|e| e.downcast_ref::<NextActionError>())
}
