use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::{
    error::{Classify as _, FailureClass},
    fs::btrfs,
    system::{in_root, Invocation, System, SystemExt as _},
    types::ByteSize,
};

use super::filesystem::{subvolume, SubvolumeRole};

pub const SWAP_FILE_NAME: &str = "swapfile";

/// A directory whose new files are created without copy-on-write. Swap files can only be
/// allocated through it, so they can never be created before the attribute is in place.
#[derive(Debug)]
pub struct NoCowDir {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapFile {
    /// Path on the host, below the target root.
    pub path: PathBuf,
    pub size: ByteSize,
}

impl NoCowDir {
    pub async fn prepare(system: &dyn System, dir: &Path) -> Result<Self> {
        system.create_dir_all(dir).await?;
        btrfs::disable_cow(system, dir).await?;
        if !btrfs::disable_compression(system, dir).await {
            tracing::debug!("Cannot disable compression on {dir:?}, continuing");
        }
        Ok(Self {
            path: dir.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a swap file of `size` in this directory and write the swap signature.
    pub async fn allocate(&self, system: &dyn System, name: &str, size: ByteSize) -> Result<SwapFile> {
        let path = self.path.join(name);

        // An empty file picks up No_COW from the directory before any extent is written.
        system
            .run(Invocation::new("truncate").args(["-s", "0"]).arg(&path))
            .await
            .with_context(|| format!("Failed to create {path:?}"))?;
        if !btrfs::disable_compression(system, &path).await {
            tracing::debug!("Cannot disable compression on {path:?}, continuing");
        }
        system
            .run(
                Invocation::new("fallocate")
                    .arg("-l")
                    .arg(size.bytes().to_string())
                    .arg(&path),
            )
            .await
            .with_context(|| format!("Failed to allocate {size} for {path:?}"))?;
        system
            .run(Invocation::new("chmod").arg("600").arg(&path))
            .await
            .with_context(|| format!("Failed to restrict permissions of {path:?}"))?;
        system
            .run(Invocation::new("mkswap").arg(&path))
            .await
            .with_context(|| format!("Failed to write swap signature to {path:?}"))?;

        Ok(SwapFile { path, size })
    }
}

/// Create the swap file in the swap-area subvolume mounted below `root`.
pub async fn provision_swap(system: &dyn System, root: &Path, size: ByteSize) -> Result<SwapFile> {
    async {
        let dir = in_root(root, subvolume(SubvolumeRole::SwapArea).mount_point);
        NoCowDir::prepare(system, &dir)
            .await?
            .allocate(system, SWAP_FILE_NAME, size)
            .await
    }
    .await
    .classify(FailureClass::Provisioning)
}

/// Where the swap file lives inside the installed system.
pub fn swap_file_in_target() -> PathBuf {
    Path::new(subvolume(SubvolumeRole::SwapArea).mount_point).join(SWAP_FILE_NAME)
}
