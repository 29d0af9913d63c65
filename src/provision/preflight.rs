use std::path::Path;

use anyhow::{bail, Result};

use crate::{
    config::InstallConfig,
    error::{Classify as _, FailureClass},
    fs::luks2,
    system::System,
};

use super::naming::DeviceNameSet;

/// Host programs the run needs before anything is touched.
pub const HOST_PROGRAMS: &[&str] = &[
    "wipefs",
    "sgdisk",
    "partprobe",
    "udevadm",
    "cryptsetup",
    "mkfs.btrfs",
    "mkfs.fat",
    "btrfs",
    "chattr",
    "truncate",
    "fallocate",
    "mkswap",
    "mount",
    "umount",
    "blkid",
    "pacstrap",
    "chroot",
];

pub const EFI_FIRMWARE_DIR: &str = "/sys/firmware/efi";

async fn check(system: &dyn System, config: &InstallConfig) -> Result<DeviceNameSet> {
    let names = DeviceNameSet::resolve(&config.disk)?;
    let disk = config.disk.as_path();

    if !system.exists(disk) {
        bail!("Disk {disk:?} does not exist");
    }
    if !system.is_block_device(disk) {
        bail!("{disk:?} is not a block device");
    }
    if system.is_in_use(disk).await? {
        bail!("Disk {disk:?} is currently in use, unmount and close everything on it first");
    }
    if luks2::is_active(system, &config.mapped_name) {
        bail!(
            "{:?} already exists, another run may be in progress",
            luks2::mapper_path(&config.mapped_name)
        );
    }
    if !system.exists(Path::new(EFI_FIRMWARE_DIR)) {
        bail!("The machine is not booted in UEFI mode ({EFI_FIRMWARE_DIR} is missing)");
    }
    let missing = HOST_PROGRAMS
        .iter()
        .filter(|program| !system.find_program(program))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        bail!("Required programs are missing: {missing:?}");
    }
    Ok(names)
}

/// Everything that can be checked before the confirmation gate. Nothing is modified.
pub async fn preflight(system: &dyn System, config: &InstallConfig) -> Result<DeviceNameSet> {
    check(system, config)
        .await
        .classify(FailureClass::Configuration)
}
