use std::path::Path;

use anyhow::{Context as _, Result};

use crate::system::{Invocation, System, SystemExt as _};

pub async fn mount(
    system: &dyn System,
    dev: &Path,
    target: &Path,
    options: Option<&str>,
) -> Result<()> {
    let mut invocation = Invocation::new("mount");
    if let Some(options) = options {
        invocation = invocation.args(["-o", options]);
    }
    system
        .run(invocation.arg(dev).arg(target))
        .await
        .with_context(|| format!("Failed to mount {dev:?} on {target:?}"))?;
    Ok(())
}

/// Bind `source` onto `target`. With `recursive`, submounts of `source` come along.
pub async fn bind(system: &dyn System, source: &Path, target: &Path, recursive: bool) -> Result<()> {
    let flag = match recursive {
        true => "--rbind",
        false => "--bind",
    };
    system
        .run(Invocation::new("mount").arg(flag).arg(source).arg(target))
        .await
        .with_context(|| format!("Failed to bind {source:?} to {target:?}"))?;
    Ok(())
}

pub async fn umount(system: &dyn System, target: &Path) -> Result<()> {
    system
        .run(Invocation::new("umount").arg(target))
        .await
        .with_context(|| format!("Failed to umount {target:?}"))?;
    Ok(())
}

/// Lazily detach `target` and everything below it, ignoring failures.
pub async fn umount_recursive_best_effort(system: &dyn System, target: &Path) -> bool {
    system
        .run_best_effort(Invocation::new("umount").args(["-R", "-l"]).arg(target))
        .await
}
