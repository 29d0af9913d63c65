use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::{
    error::FailureClass,
    system::{ExecOutput, Invocation},
};

use super::chroot::Chroot;

/// Captured output of every step of a build, kept for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    text: String,
}

impl Transcript {
    pub fn note(&mut self, message: impl AsRef<str>) {
        self.text.push_str("# ");
        self.text.push_str(message.as_ref());
        self.text.push('\n');
    }

    pub fn record(&mut self, invocation: &Invocation, output: &ExecOutput) {
        self.text.push_str(&format!("$ {invocation}\n"));
        self.text.push_str(&String::from_utf8_lossy(&output.stdout));
        self.text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(&format!("[exit code: {}]\n", output.code));
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Run `invocation` inside the chroot, recording it. Failures are tagged with `class`.
    pub async fn step(
        &mut self,
        chroot: &Chroot<'_>,
        invocation: Invocation,
        class: FailureClass,
    ) -> Result<ExecOutput> {
        let wrapped = chroot.wrap(invocation);
        let output = match chroot.system().output(&wrapped).await {
            Ok(output) => output,
            Err(error) => {
                self.note(format!("{wrapped}: {error:#}"));
                return Err(error.context(class));
            }
        };
        self.record(&wrapped, &output);
        output.check(&wrapped).map_err(|error| error.context(class))
    }

    /// Write the transcript to `path` inside the installed system. Returns where it landed, or
    /// `None` if it could not be written.
    pub async fn persist(&self, chroot: &Chroot<'_>, path: &Path) -> Option<PathBuf> {
        let host_path = chroot.host_path(path);
        let system = chroot.system();
        let written = async {
            if let Some(parent) = host_path.parent() {
                system.create_dir_all(parent).await?;
            }
            system.write(&host_path, self.text.as_bytes()).await
        }
        .await;
        match written {
            Ok(()) => Some(path.to_owned()),
            Err(error) => {
                tracing::warn!("Failed to persist transcript to {path:?}: {error:#}");
                None
            }
        }
    }
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::{
        error::failure_class_of,
        provision::chroot::with_chroot,
        system::fake::{failed, FakeSystem},
    };

    #[tokio::test]
    async fn test_step_records_failures() -> Result<()> {
        let system = FakeSystem::new();
        system.on("make", |_, _| failed("error: implicit declaration"));
        let root = Path::new("/mnt");

        let transcript = with_chroot(&system, root, |chroot| async move {
            let mut transcript = Transcript::default();
            transcript.note("building");
            let error = transcript
                .step(&chroot, Invocation::new("make"), FailureClass::CompileFailure)
                .await
                .unwrap_err();
            assert_eq!(failure_class_of(&error), Some(FailureClass::CompileFailure));
            let path = transcript
                .persist(&chroot, Path::new("/var/log/cryptforge/build.log"))
                .await;
            assert_eq!(path, Some(PathBuf::from("/var/log/cryptforge/build.log")));
            Ok::<_, anyhow::Error>(transcript)
        })
        .await?;

        assert_eq!(
            transcript.as_str(),
            "# building\n$ chroot /mnt make\nerror: implicit declaration\n[exit code: 1]\n"
        );
        assert_eq!(
            system.file("/mnt/var/log/cryptforge/build.log").as_deref(),
            Some(transcript.as_str())
        );
        Ok(())
    }
}
