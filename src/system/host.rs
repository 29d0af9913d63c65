use std::{os::unix::fs::FileTypeExt as _, path::Path, time::Duration};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::{fs::OpenOptions, process::Command};

use crate::fs::cmd::CheckCommandOutput as _;

use super::{Clock, ExecOutput, Invocation, System};

/// The machine this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

#[async_trait]
impl Clock for HostSystem {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

#[async_trait]
impl System for HostSystem {
    async fn output(&self, invocation: &Invocation) -> Result<ExecOutput> {
        let mut command = Command::new(invocation.program());
        command.args(invocation.get_args());
        for (key, value) in invocation.get_envs() {
            command.env(key, value);
        }
        if let Some(dir) = invocation.get_current_dir() {
            command.current_dir(dir);
        }
        command.capture(invocation.get_stdin()).await
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_block_device(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|metadata| metadata.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn find_program(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn is_in_use(&self, path: &Path) -> Result<bool> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.custom_flags(libc::O_EXCL);
        match options.open(path).await {
            Ok(_) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(true),
            Err(e) => Err(e).with_context(|| format!("Failed to open {path:?} exclusively")),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory {path:?}"))
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write file {path:?}"))
    }

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read file {path:?}"))
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = vec![];
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("Failed to list directory {path:?}"))?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("Failed to copy {from:?} to {to:?}"))?;
        Ok(())
    }
}
