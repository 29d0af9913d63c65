//! Everything the provisioning stages do to the machine goes through [`System`].
//!
//! The host implementation spawns real processes and touches the real filesystem, while tests
//! swap in a scripted in-memory implementation so the orchestration can be exercised without a
//! spare disk.

#[cfg(test)]
pub mod fake;
pub mod host;

use std::{
    ffi::{OsStr, OsString},
    fmt::{Debug, Display},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::fs::cmd::describe_failure;

/// A fully described external command, ready to be handed to a [`System`].
#[derive(Clone)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    stdin: Option<Zeroizing<Vec<u8>>>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: vec![],
            envs: vec![],
            current_dir: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Bytes piped to the command's stdin. They never show up in [`Display`] or [`Debug`] output.
    pub fn stdin(mut self, bytes: &[u8]) -> Self {
        self.stdin = Some(Zeroizing::new(bytes.to_vec()));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(OsString, OsString)] {
        &self.envs
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_ref().map(|bytes| bytes.as_slice())
    }

    /// Prefix this invocation with another program, e.g. `chroot /mnt`.
    pub fn wrapped_by<I, S>(self, program: impl AsRef<OsStr>, prefix_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut wrapped = Invocation::new(program).args(prefix_args);
        wrapped.args.push(self.program);
        wrapped.args.extend(self.args);
        wrapped.envs = self.envs;
        wrapped.current_dir = self.current_dir;
        wrapped.stdin = self.stdin;
        wrapped
    }

    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command_line())
    }
}

impl Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("cmd", &self.command_line())
            .field("envs", &self.envs)
            .field("current_dir", &self.current_dir)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }

    /// Turn a non-zero exit code into an error carrying the command and its output.
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        if !self.success() {
            bail!(
                "Bad exit code{}",
                describe_failure(&invocation.command_line(), &self)
            )
        }
        Ok(self)
    }
}

#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
pub trait System: Clock {
    /// Run a command to completion. Only spawn failures are errors, exit codes are returned as is.
    async fn output(&self, invocation: &Invocation) -> Result<ExecOutput>;

    fn exists(&self, path: &Path) -> bool;

    fn is_block_device(&self, path: &Path) -> bool;

    /// Whether `program` can be found in `PATH`.
    fn find_program(&self, program: &str) -> bool;

    /// Whether someone else holds the device open (mounted, mapped, ...).
    async fn is_in_use(&self, path: &Path) -> Result<bool>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    async fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Names of the entries in a directory, sorted.
    async fn read_dir(&self, path: &Path) -> Result<Vec<String>>;

    async fn copy(&self, from: &Path, to: &Path) -> Result<()>;
}

#[async_trait]
pub trait SystemExt {
    /// Run a command and fail on a non-zero exit code, returning its stdout.
    async fn run(&self, invocation: Invocation) -> Result<Vec<u8>>;

    /// Run a command whose failure does not matter. Failures are only visible in debug logs.
    async fn run_best_effort(&self, invocation: Invocation) -> bool;
}

#[async_trait]
impl<S: System + ?Sized> SystemExt for S {
    async fn run(&self, invocation: Invocation) -> Result<Vec<u8>> {
        let output = self.output(&invocation).await?.check(&invocation)?;
        Ok(output.stdout)
    }

    async fn run_best_effort(&self, invocation: Invocation) -> bool {
        match self
            .output(&invocation)
            .await
            .and_then(|output| output.check(&invocation))
        {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(cmd = %invocation, "Ignoring failure of best-effort command: {error:#}");
                false
            }
        }
    }
}

/// Map an absolute path of the installed system onto the host, below the target root.
pub fn in_root(root: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    root.join(path.strip_prefix("/").unwrap_or(path))
}
