use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};

use crate::error::{Classify as _, FailureClass};

/// Partition device paths derived from the target disk. Pure, never touches the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNameSet {
    pub boot: PathBuf,
    pub payload: PathBuf,
}

impl DeviceNameSet {
    pub const BOOT_INDEX: u32 = 1;
    pub const PAYLOAD_INDEX: u32 = 2;

    pub fn resolve(disk: &Path) -> Result<Self> {
        Ok(Self {
            boot: partition_path(disk, Self::BOOT_INDEX)?,
            payload: partition_path(disk, Self::PAYLOAD_INDEX)?,
        })
    }

    pub fn all(&self) -> [&Path; 2] {
        [&self.boot, &self.payload]
    }
}

/// Path of partition `index` on `disk`. Names ending in a digit (`nvme0n1`, `mmcblk0`, `loop0`)
/// need a `p` separator, others (`sda`, `vdb`) take the index directly.
pub fn partition_path(disk: &Path, index: u32) -> Result<PathBuf> {
    check_disk_path(disk)
        .with_context(|| format!("Unrecognized disk path {disk:?}"))
        .classify(FailureClass::Configuration)?;

    let mut name = disk.as_os_str().to_owned();
    if needs_separator(disk) {
        name.push("p");
    }
    name.push(index.to_string());
    Ok(PathBuf::from(name))
}

fn needs_separator(disk: &Path) -> bool {
    disk.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.chars().last())
        .is_some_and(|c| c.is_ascii_digit())
}

fn check_disk_path(disk: &Path) -> Result<()> {
    if !disk.is_absolute() {
        bail!("Disk path must be absolute");
    }
    if disk.as_os_str().to_string_lossy().ends_with('/') {
        bail!("Disk path must not end with a slash");
    }
    let Some(name) = disk.file_name().and_then(|name| name.to_str()) else {
        bail!("Disk path has no device name");
    };
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("Device name {name:?} contains unsupported characters");
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::error::failure_class_of;
    use rstest::rstest;

    #[rstest]
    #[case("/dev/nvme0n1", "/dev/nvme0n1p1", "/dev/nvme0n1p2")]
    #[case("/dev/exampleN1", "/dev/exampleN1p1", "/dev/exampleN1p2")]
    #[case("/dev/mmcblk0", "/dev/mmcblk0p1", "/dev/mmcblk0p2")]
    #[case("/dev/loop7", "/dev/loop7p1", "/dev/loop7p2")]
    #[case("/dev/sda", "/dev/sda1", "/dev/sda2")]
    #[case("/dev/vdb", "/dev/vdb1", "/dev/vdb2")]
    #[case("/dev/xvda", "/dev/xvda1", "/dev/xvda2")]
    fn test_resolve(
        #[case] disk: &str,
        #[case] boot: &str,
        #[case] payload: &str,
    ) -> Result<()> {
        let names = DeviceNameSet::resolve(Path::new(disk))?;
        assert_eq!(names.boot, PathBuf::from(boot));
        assert_eq!(names.payload, PathBuf::from(payload));

        assert_ne!(names.boot, names.payload);
        for partition in names.all() {
            assert!(partition.to_string_lossy().starts_with(disk));
            let suffix = &partition.to_string_lossy()[disk.len()..];
            let has_separator = suffix.starts_with('p');
            assert_eq!(has_separator, disk.ends_with(|c: char| c.is_ascii_digit()));
        }
        Ok(())
    }

    #[rstest]
    #[case("sda")]
    #[case("/dev/")]
    #[case("/dev/sd a")]
    #[case("/dev/sda;rm")]
    fn test_unrecognized_disk(#[case] disk: &str) {
        let error = DeviceNameSet::resolve(Path::new(disk)).unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Configuration));
    }
}
