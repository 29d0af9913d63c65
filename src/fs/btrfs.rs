use std::path::Path;

use anyhow::{Context as _, Result};

use crate::system::{Invocation, System, SystemExt as _};

pub async fn subvolume_create(system: &dyn System, path: &Path) -> Result<()> {
    system
        .run(
            Invocation::new("btrfs")
                .args(["subvolume", "create"])
                .arg(path),
        )
        .await
        .with_context(|| format!("Failed to create btrfs subvolume {path:?}"))?;
    Ok(())
}

/// Set the `No_COW` attribute. Only files created afterwards inherit it from a directory.
pub async fn disable_cow(system: &dyn System, path: &Path) -> Result<()> {
    system
        .run(Invocation::new("chattr").arg("+C").arg(path))
        .await
        .with_context(|| format!("Failed to disable copy-on-write on {path:?}"))?;
    Ok(())
}

/// Turn compression off for `path`. Older btrfs-progs lack the `none` value, so this only
/// reports whether it worked.
pub async fn disable_compression(system: &dyn System, path: &Path) -> bool {
    system
        .run_best_effort(
            Invocation::new("btrfs")
                .args(["property", "set"])
                .arg(path)
                .args(["compression", "none"]),
        )
        .await
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::system::fake::FakeSystem;

    #[tokio::test]
    async fn test_disable_compression_is_best_effort() -> Result<()> {
        let system = FakeSystem::new();
        system.fail("btrfs property set");
        assert!(!disable_compression(&system, Path::new("/mnt/swap")).await);

        disable_cow(&system, Path::new("/mnt/swap")).await?;
        subvolume_create(&system, Path::new("/mnt/@home")).await?;
        assert_eq!(
            system.commands(),
            vec![
                "btrfs property set /mnt/swap compression none",
                "chattr +C /mnt/swap",
                "btrfs subvolume create /mnt/@home",
            ]
        );
        Ok(())
    }
}
