use std::path::{Path, PathBuf};

use anyhow::Result;
use strum::AsRefStr;

use crate::{
    error::{Classify as _, FailureClass},
    fs::{btrfs, mkfs::mkfs, mount},
    system::{in_root, System},
    types::MakeFsType,
};

use super::encryption::MappedVolume;

/// Options shared by every subvolume mount.
pub const MOUNT_OPTIONS: &str = "noatime,compress=zstd:3,discard=async,space_cache=v2";

/// Options of the EFI system partition mount.
pub const BOOT_MOUNT_OPTIONS: &str = "umask=0077";

pub const BOOT_MOUNT_POINT: &str = "/boot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SubvolumeRole {
    Root,
    Home,
    Var,
    VarLog,
    VarCache,
    Tmp,
    SwapArea,
    Snapshots,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subvolume {
    pub role: SubvolumeRole,
    pub name: &'static str,
    /// Absolute path inside the installed system.
    pub mount_point: &'static str,
}

impl Subvolume {
    pub fn mount_options(&self) -> String {
        format!("{MOUNT_OPTIONS},subvol={}", self.name)
    }

    fn depth(&self) -> usize {
        Path::new(self.mount_point).components().count()
    }
}

pub const SUBVOLUME_LAYOUT: [Subvolume; 8] = [
    Subvolume {
        role: SubvolumeRole::Root,
        name: "@",
        mount_point: "/",
    },
    Subvolume {
        role: SubvolumeRole::Home,
        name: "@home",
        mount_point: "/home",
    },
    Subvolume {
        role: SubvolumeRole::Var,
        name: "@var",
        mount_point: "/var",
    },
    Subvolume {
        role: SubvolumeRole::VarLog,
        name: "@log",
        mount_point: "/var/log",
    },
    Subvolume {
        role: SubvolumeRole::VarCache,
        name: "@cache",
        mount_point: "/var/cache",
    },
    Subvolume {
        role: SubvolumeRole::Tmp,
        name: "@tmp",
        mount_point: "/tmp",
    },
    Subvolume {
        role: SubvolumeRole::SwapArea,
        name: "@swap",
        mount_point: "/swap",
    },
    Subvolume {
        role: SubvolumeRole::Snapshots,
        name: "@snapshots",
        mount_point: "/.snapshots",
    },
];

pub fn subvolume(role: SubvolumeRole) -> &'static Subvolume {
    SUBVOLUME_LAYOUT
        .iter()
        .find(|subvolume| subvolume.role == role)
        .unwrap_or(&SUBVOLUME_LAYOUT[0])
}

/// Parents before children: a stable sort by mount point depth.
pub fn mount_order(layout: &[Subvolume]) -> Vec<&Subvolume> {
    let mut ordered = layout.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|subvolume| subvolume.depth());
    ordered
}

pub async fn create_filesystem(system: &dyn System, mapped: &MappedVolume, label: &str) -> Result<()> {
    mkfs(system, &mapped.path, MakeFsType::Btrfs, label)
        .await
        .classify(FailureClass::Provisioning)
}

/// Create every subvolume below the top level, which is mounted on `root` only for the duration.
pub async fn create_subvolumes(
    system: &dyn System,
    mapped: &MappedVolume,
    root: &Path,
    layout: &[Subvolume],
) -> Result<()> {
    async {
        system.create_dir_all(root).await?;
        mount::mount(system, &mapped.path, root, None).await?;
        for subvolume in layout {
            btrfs::subvolume_create(system, &root.join(subvolume.name)).await?;
        }
        mount::umount(system, root).await
    }
    .await
    .classify(FailureClass::Provisioning)
}

/// Mount the subvolume tree on `root`. Each mount point directory is created right before its
/// mount, so directories nested inside an already mounted parent land on that parent.
pub async fn mount_all(
    system: &dyn System,
    mapped: &MappedVolume,
    root: &Path,
    layout: &[Subvolume],
) -> Result<Vec<PathBuf>> {
    let mut mounted = vec![];
    for subvolume in mount_order(layout) {
        let target = in_root(root, subvolume.mount_point);
        async {
            system.create_dir_all(&target).await?;
            mount::mount(
                system,
                &mapped.path,
                &target,
                Some(&subvolume.mount_options()),
            )
            .await
        }
        .await
        .classify(FailureClass::Provisioning)?;
        tracing::debug!(subvolume = subvolume.name, target = ?target, "Mounted subvolume");
        mounted.push(target);
    }
    Ok(mounted)
}

/// Format the EFI system partition and mount it below the already mounted tree.
pub async fn mount_boot(system: &dyn System, boot: &Path, root: &Path) -> Result<PathBuf> {
    let target = in_root(root, BOOT_MOUNT_POINT);
    async {
        mkfs(system, boot, MakeFsType::Vfat, "EFI").await?;
        system.create_dir_all(&target).await?;
        mount::mount(system, boot, &target, Some(BOOT_MOUNT_OPTIONS)).await
    }
    .await
    .classify(FailureClass::Provisioning)?;
    Ok(target)
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::{error::failure_class_of, system::fake::FakeSystem};

    fn mapped() -> MappedVolume {
        MappedVolume {
            name: "cryptroot".to_owned(),
            path: PathBuf::from("/dev/mapper/cryptroot"),
        }
    }

    #[test]
    fn test_mount_order_is_topological() {
        let ordered = mount_order(&SUBVOLUME_LAYOUT);
        assert_eq!(ordered.len(), SUBVOLUME_LAYOUT.len());
        assert_eq!(ordered[0].role, SubvolumeRole::Root);

        for (i, child) in ordered.iter().enumerate() {
            for (j, parent) in ordered.iter().enumerate() {
                let is_parent = parent.mount_point != child.mount_point
                    && Path::new(child.mount_point).starts_with(parent.mount_point);
                if is_parent {
                    assert!(j < i, "{} must be mounted before {}", parent.name, child.name);
                }
            }
        }
    }

    #[test]
    fn test_subvolume_lookup() {
        assert_eq!(subvolume(SubvolumeRole::SwapArea).mount_point, "/swap");
        assert_eq!(SubvolumeRole::VarLog.as_ref(), "var-log");
        assert_eq!(
            subvolume(SubvolumeRole::Home).mount_options(),
            "noatime,compress=zstd:3,discard=async,space_cache=v2,subvol=@home"
        );
    }

    #[tokio::test]
    async fn test_mount_all_creates_dirs_just_in_time() -> Result<()> {
        let system = FakeSystem::new();
        let mounted = mount_all(&system, &mapped(), Path::new("/mnt"), &SUBVOLUME_LAYOUT).await?;

        assert_eq!(mounted[0], PathBuf::from("/mnt"));
        let commands = system.commands();
        let var = system.position("subvol=@var ").unwrap_or(usize::MAX);
        let log = system.position("subvol=@log ").unwrap_or(usize::MAX);
        assert!(var < log);
        assert!(commands[log].ends_with("/dev/mapper/cryptroot /mnt/var/log"));
        assert!(system.with_state(|state| state.dirs.contains(Path::new("/mnt/var/log"))));
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_failure_is_fatal() {
        let system = FakeSystem::new();
        system.fail("subvol=@var ");
        let error = mount_all(&system, &mapped(), Path::new("/mnt"), &SUBVOLUME_LAYOUT)
            .await
            .unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Provisioning));
        assert!(!system.ran("subvol=@log"));
    }

    #[tokio::test]
    async fn test_create_subvolumes() -> Result<()> {
        let system = FakeSystem::new();
        create_filesystem(&system, &mapped(), "system").await?;
        create_subvolumes(&system, &mapped(), Path::new("/mnt"), &SUBVOLUME_LAYOUT).await?;

        let commands = system.commands();
        assert_eq!(commands[0], "mkfs.btrfs -f -L system /dev/mapper/cryptroot");
        assert_eq!(commands[1], "mount /dev/mapper/cryptroot /mnt");
        assert_eq!(commands[2], "btrfs subvolume create /mnt/@");
        assert_eq!(commands.last().map(String::as_str), Some("umount /mnt"));
        assert_eq!(commands.len(), 3 + SUBVOLUME_LAYOUT.len());
        Ok(())
    }
}
