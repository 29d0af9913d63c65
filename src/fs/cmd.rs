use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

use crate::system::ExecOutput;

#[async_trait]
pub trait CheckCommandOutput {
    /// Spawn the command, feed `input_bytes` to its stdin if any, and collect its exit code and output.
    ///
    /// A non-zero exit code is not an error here; a failure to spawn or a termination by signal is.
    async fn capture(&mut self, input_bytes: Option<&[u8]>) -> Result<ExecOutput>;
}

#[async_trait]
impl CheckCommandOutput for Command {
    async fn capture(&mut self, input_bytes: Option<&[u8]>) -> Result<ExecOutput> {
        // reset all locale settings for this command
        self.env("LC_ALL", "C");

        tracing::trace!(cmd=?self.as_std(), "run external cmd");

        let output = async {
            if input_bytes.is_some() {
                self.stdin(Stdio::piped());
            } else {
                self.stdin(Stdio::null());
            }
            self.stdout(Stdio::piped());
            self.stderr(Stdio::piped());

            let mut child = self.kill_on_drop(true).spawn()?;

            if let Some(input_bytes) = input_bytes {
                let mut stdin = child.stdin.take().context("No stdin")?;
                stdin.write_all(input_bytes).await?;
                stdin.shutdown().await?;
            }

            child.wait_with_output().await.map_err(anyhow::Error::from)
        }
        .await
        .with_context(|| format!("cmd: {:?}", self.as_std()))
        .context("Failed to execute external command")?;

        let code = output
            .status
            .code()
            .ok_or_else(|| anyhow!("killed by signal"))
            .with_context(|| format!("cmd: {:?}", self.as_std()))?;

        Ok(ExecOutput {
            code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Render the details of a failed command the way operators read them in logs.
pub fn describe_failure(command_line: &str, output: &ExecOutput) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!(
        "\ncmd: {}\nexit code: {}\nstdout: {}\nstderr: {}",
        command_line,
        output.code,
        indent_multi_line(&stdout),
        indent_multi_line(&stderr),
    )
}

fn indent_multi_line(text: &str) -> String {
    let text = text.trim_end();
    if text.contains('\n') {
        format!("(multi-line)\n\t{}", text.replace('\n', "\n\t"))
    } else {
        text.to_owned()
    }
}
