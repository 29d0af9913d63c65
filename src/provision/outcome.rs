use std::{fmt::Display, path::PathBuf};

use crate::error::FailureClass;

/// Why an optional component ended up degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degradation {
    pub component: &'static str,
    pub class: FailureClass,
    pub detail: String,
    /// Where the captured transcript was persisted, if it could be.
    pub transcript: Option<PathBuf>,
}

impl Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.component, self.class, self.detail)?;
        if let Some(transcript) = &self.transcript {
            write!(f, ", transcript at {transcript:?}")?;
        }
        Ok(())
    }
}

/// Non-fatal result of a step. Fatal results are `Err` in the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Completed(T),
    Degraded { value: T, reason: Degradation },
}

impl<T> StepOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            StepOutcome::Completed(value) | StepOutcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            StepOutcome::Completed(value) | StepOutcome::Degraded { value, .. } => value,
        }
    }

    pub fn degradation(&self) -> Option<&Degradation> {
        match self {
            StepOutcome::Completed(_) => None,
            StepOutcome::Degraded { reason, .. } => Some(reason),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation().is_some()
    }
}
