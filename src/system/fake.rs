//! Scripted in-memory [`System`] used by the unit tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{Clock, ExecOutput, Invocation, System};

type Handler = Box<dyn Fn(&Invocation, &mut FakeState) -> ExecOutput + Send + Sync>;

#[derive(Default)]
pub struct FakeState {
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    pub dirs: BTreeSet<PathBuf>,
    pub block_devices: BTreeSet<PathBuf>,
    pub busy: BTreeSet<PathBuf>,
    pub missing_programs: BTreeSet<String>,
    /// Device nodes that show up after the given number of unsuccessful existence probes.
    pub pending: BTreeMap<PathBuf, usize>,
    pub log: Vec<String>,
    pub sleeps: Vec<Duration>,
}

impl FakeState {
    pub fn touch(&mut self, path: impl AsRef<Path>, content: &[u8]) {
        let path = path.as_ref();
        self.add_dir(path.parent().unwrap_or(Path::new("/")));
        self.files.insert(path.to_owned(), content.to_vec());
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        for ancestor in path.as_ref().ancestors() {
            self.dirs.insert(ancestor.to_owned());
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path) || self.block_devices.contains(path)
    }
}

#[derive(Default)]
pub struct FakeSystem {
    state: Mutex<FakeState>,
    handlers: Mutex<Vec<(String, Handler)>>,
}

pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        code: 0,
        stdout: stdout.as_bytes().to_vec(),
        stderr: vec![],
    }
}

pub fn failed(stderr: &str) -> ExecOutput {
    ExecOutput {
        code: 1,
        stdout: vec![],
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// The argument following `flag` in the invocation, if any.
pub fn arg_after(invocation: &Invocation, flag: &str) -> Option<String> {
    let args = invocation.get_args();
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(|arg| arg.to_string_lossy().into_owned())
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every command line containing `pattern`. Later registrations win.
    pub fn on(
        &self,
        pattern: &str,
        handler: impl Fn(&Invocation, &mut FakeState) -> ExecOutput + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .push((pattern.to_owned(), Box::new(handler)));
    }

    pub fn respond(&self, pattern: &str, stdout: &'static str) {
        self.on(pattern, move |_, _| ok(stdout));
    }

    pub fn fail(&self, pattern: &str) {
        self.on(pattern, |_, _| failed("simulated failure"));
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_block_device(&self, path: impl AsRef<Path>) {
        self.with_state(|state| state.block_devices.insert(path.as_ref().to_owned()));
    }

    pub fn appear_after(&self, path: impl AsRef<Path>, probes: usize) {
        self.with_state(|state| state.pending.insert(path.as_ref().to_owned(), probes));
    }

    pub fn touch(&self, path: impl AsRef<Path>, content: &[u8]) {
        self.with_state(|state| state.touch(path, content));
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|state| state.log.clone())
    }

    /// Index of the first recorded command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|cmd| cmd.contains(pattern))
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.with_state(|state| {
            state
                .files
                .get(path.as_ref())
                .map(|content| String::from_utf8_lossy(content).into_owned())
        })
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.with_state(|state| state.sleeps.clone())
    }
}

#[async_trait]
impl Clock for FakeSystem {
    async fn sleep(&self, duration: Duration) {
        self.with_state(|state| state.sleeps.push(duration));
    }
}

#[async_trait]
impl System for FakeSystem {
    async fn output(&self, invocation: &Invocation) -> Result<ExecOutput> {
        let command_line = invocation.command_line();
        let handlers = self.handlers.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.log.push(command_line.clone());
        let output = handlers
            .iter()
            .rev()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, handler)| handler(invocation, &mut state))
            .unwrap_or_default();
        Ok(output)
    }

    fn exists(&self, path: &Path) -> bool {
        self.with_state(|state| {
            if let Some(remaining) = state.pending.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return false;
                }
                state.pending.remove(path);
                state.block_devices.insert(path.to_owned());
                return true;
            }
            state.exists(path)
        })
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.with_state(|state| state.block_devices.contains(path))
    }

    fn find_program(&self, program: &str) -> bool {
        self.with_state(|state| !state.missing_programs.contains(program))
    }

    async fn is_in_use(&self, path: &Path) -> Result<bool> {
        Ok(self.with_state(|state| state.busy.contains(path)))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.with_state(|state| state.add_dir(path));
        Ok(())
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.touch(path, content);
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        self.file(path)
            .ok_or_else(|| anyhow!("No such file: {path:?}"))
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        self.with_state(|state| {
            if !state.dirs.contains(path) {
                return Err(anyhow!("No such directory: {path:?}"));
            }
            let children = state
                .files
                .keys()
                .chain(state.dirs.iter())
                .chain(state.block_devices.iter())
                .filter(|child| child.parent() == Some(path))
                .filter_map(|child| child.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect::<BTreeSet<_>>();
            Ok(children.into_iter().collect())
        })
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        self.with_state(|state| {
            let content = state
                .files
                .get(from)
                .cloned()
                .ok_or_else(|| anyhow!("No such file: {from:?}"))?;
            state.touch(to, &content);
            Ok(())
        })
    }
}
