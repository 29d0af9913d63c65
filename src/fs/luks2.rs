use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::{
    config::LuksParams,
    system::{Invocation, System, SystemExt as _},
    types::Passphrase,
};

use super::get_verbose;

pub fn mapper_path(volume: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{}", volume))
}

pub fn is_active(system: &dyn System, volume: &str) -> bool {
    system.exists(&mapper_path(volume))
}

async fn cryptsetup() -> Invocation {
    let invocation = Invocation::new("cryptsetup");
    match get_verbose().await {
        true => invocation.arg("--debug"),
        false => invocation,
    }
}

/// Create a LUKS2 header on `dev`. The passphrase is handed over on stdin, never as an argument.
pub async fn format(
    system: &dyn System,
    dev: &Path,
    params: &LuksParams,
    passphrase: &Passphrase,
) -> Result<()> {
    let invocation = cryptsetup()
        .await
        .args(["luksFormat", "--type", "luks2", "--batch-mode"])
        .args(["--cipher", &params.cipher])
        .args(["--key-size", &params.key_size.to_string()])
        .args(["--hash", &params.hash])
        .args(["--pbkdf", &params.pbkdf])
        .args(["--pbkdf-memory", &params.pbkdf_memory.to_string()])
        .args(["--pbkdf-parallel", &params.pbkdf_parallel.to_string()])
        .args(["--iter-time", &params.iter_time.to_string()])
        .arg("--key-file=-")
        .arg(dev)
        .stdin(passphrase.as_bytes());

    system
        .run(invocation)
        .await
        .with_context(|| format!("Failed to format {dev:?} as LUKS2 volume"))?;
    Ok(())
}

/// Unlock `dev` as `/dev/mapper/<volume>` with discards passed through.
pub async fn open(
    system: &dyn System,
    dev: &Path,
    volume: &str,
    passphrase: &Passphrase,
) -> Result<PathBuf> {
    let invocation = cryptsetup()
        .await
        .args(["open", "--type", "luks2", "--allow-discards", "--key-file=-"])
        .arg(dev)
        .arg(volume)
        .stdin(passphrase.as_bytes());

    system
        .run(invocation)
        .await
        .with_context(|| format!("Failed to setup mapping for volume {volume}"))?;
    Ok(mapper_path(volume))
}
