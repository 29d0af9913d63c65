use thiserror::Error;

/// Exit code used for errors that were never classified.
pub const EXIT_CODE_UNCLASSIFIED: u8 = 1;

/// Classes of failure an operator (or a wrapper script) can tell apart from the exit code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureClass {
    #[error("configuration error")]
    Configuration,

    #[error("provisioning error")]
    Provisioning,

    #[error("interrupted by operator")]
    Cancelled,

    #[error("kernel build toolchain is missing")]
    MissingToolchain,

    #[error("kernel source tree is unavailable")]
    SourceUnavailable,

    #[error("kernel compile failure")]
    CompileFailure,

    #[error("kernel modules install failure")]
    ModuleInstall,

    #[error("no installed kernel found")]
    NoInstalledKernel,

    #[error("driver module build failure")]
    DriverBuild,
}

impl FailureClass {
    pub fn exit_code(self) -> u8 {
        match self {
            FailureClass::Configuration => 2,
            FailureClass::Provisioning => 3,
            FailureClass::Cancelled => 4,
            FailureClass::MissingToolchain => 10,
            FailureClass::CompileFailure => 11,
            FailureClass::ModuleInstall => 12,
            FailureClass::NoInstalledKernel => 13,
            FailureClass::DriverBuild => 14,
            FailureClass::SourceUnavailable => 15,
        }
    }

    /// Whether the workflow may recover from this class through a fallback path.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            FailureClass::MissingToolchain
                | FailureClass::SourceUnavailable
                | FailureClass::CompileFailure
                | FailureClass::ModuleInstall
                | FailureClass::DriverBuild
        )
    }
}

/// Find the failure class attached anywhere in the error's context chain.
pub fn failure_class_of(error: &anyhow::Error) -> Option<FailureClass> {
    error.downcast_ref::<FailureClass>().copied()
}

pub fn exit_code_of(error: &anyhow::Error) -> u8 {
    failure_class_of(error)
        .map(FailureClass::exit_code)
        .unwrap_or(EXIT_CODE_UNCLASSIFIED)
}

/// Tag an error with the [`FailureClass`] it belongs to.
pub trait Classify<T> {
    fn classify(self, class: FailureClass) -> anyhow::Result<T>;
}

impl<T, E> Classify<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn classify(self, class: FailureClass) -> anyhow::Result<T> {
        self.map_err(|e| e.into().context(class))
    }
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use anyhow::{anyhow, Context as _, Result};

    #[test]
    fn test_class_survives_outer_context() -> Result<()> {
        let error = Err::<(), _>(anyhow!("mkfs.btrfs exited with 1"))
            .classify(FailureClass::Provisioning)
            .context("Failed to create filesystem")
            .context("Failed to run filesystem stage")
            .unwrap_err();

        assert_eq!(failure_class_of(&error), Some(FailureClass::Provisioning));
        assert_eq!(exit_code_of(&error), 3);
        Ok(())
    }

    #[test]
    fn test_unclassified_error() {
        let error = anyhow!("something odd");
        assert_eq!(failure_class_of(&error), None);
        assert_eq!(exit_code_of(&error), EXIT_CODE_UNCLASSIFIED);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let classes = [
            FailureClass::Configuration,
            FailureClass::Provisioning,
            FailureClass::Cancelled,
            FailureClass::MissingToolchain,
            FailureClass::SourceUnavailable,
            FailureClass::CompileFailure,
            FailureClass::ModuleInstall,
            FailureClass::NoInstalledKernel,
            FailureClass::DriverBuild,
        ];
        let mut codes = classes.iter().map(|c| c.exit_code()).collect::<Vec<_>>();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), classes.len());
        assert!(!codes.contains(&0));
        assert!(!codes.contains(&EXIT_CODE_UNCLASSIFIED));
    }
}
