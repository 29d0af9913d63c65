use std::path::Path;

use anyhow::{Context as _, Result};

use crate::{
    system::{Invocation, System, SystemExt as _},
    types::MakeFsType,
};

impl MakeFsType {
    fn to_mkfs_invocation(self, label: &str) -> Invocation {
        match self {
            MakeFsType::Btrfs => Invocation::new("mkfs.btrfs").args(["-f", "-L", label]),
            MakeFsType::Vfat => Invocation::new("mkfs.fat").args(["-F", "32", "-n", label]),
        }
    }
}

/// Create a fresh filesystem on `device_path`, overwriting whatever signature is there.
pub async fn mkfs(
    system: &dyn System,
    device_path: &Path,
    fs_type: MakeFsType,
    label: &str,
) -> Result<()> {
    system
        .run(fs_type.to_mkfs_invocation(label).arg(device_path))
        .await
        .with_context(|| format!("Failed to create {fs_type} filesystem on {device_path:?}"))?;
    Ok(())
}
