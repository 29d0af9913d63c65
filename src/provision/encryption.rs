use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::{
    config::LuksParams,
    error::{Classify as _, FailureClass},
    fs::luks2,
    system::System,
    types::Passphrase,
};

/// The unlocked view of the payload partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedVolume {
    pub name: String,
    pub path: PathBuf,
}

pub async fn format(
    system: &dyn System,
    payload: &Path,
    params: &LuksParams,
    passphrase: &Passphrase,
) -> Result<()> {
    luks2::format(system, payload, params, passphrase)
        .await
        .classify(FailureClass::Provisioning)
}

pub async fn open(
    system: &dyn System,
    payload: &Path,
    name: &str,
    passphrase: &Passphrase,
) -> Result<MappedVolume> {
    if luks2::is_active(system, name) {
        return Err(anyhow!(
            "Mapping {:?} is already active, refusing to open it again",
            luks2::mapper_path(name)
        )
        .context(FailureClass::Provisioning));
    }

    let path = luks2::open(system, payload, name, passphrase)
        .await
        .classify(FailureClass::Provisioning)?;

    if !system.exists(&path) {
        return Err(anyhow!("{path:?} does not exist after opening the volume")
            .context(FailureClass::Provisioning));
    }

    Ok(MappedVolume {
        name: name.to_owned(),
        path,
    })
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::{config::InstallConfig, error::failure_class_of, system::fake::FakeSystem};

    fn passphrase() -> Passphrase {
        Passphrase::from("correct horse".to_owned())
    }

    #[tokio::test]
    async fn test_format_then_open() -> Result<()> {
        let system = FakeSystem::new();
        system.on("cryptsetup open", |_, state| {
            state.block_devices.insert(PathBuf::from("/dev/mapper/cryptroot"));
            crate::system::fake::ok("")
        });
        let payload = Path::new("/dev/exampleN1p2");

        format(&system, payload, &InstallConfig::default().luks, &passphrase()).await?;
        let mapped = open(&system, payload, "cryptroot", &passphrase()).await?;

        assert_eq!(mapped.path, PathBuf::from("/dev/mapper/cryptroot"));
        assert!(system.position("luksFormat") < system.position("cryptsetup open"));
        Ok(())
    }

    #[tokio::test]
    async fn test_format_failure_is_fatal() {
        let system = FakeSystem::new();
        system.fail("luksFormat");
        let error = format(
            &system,
            Path::new("/dev/sda2"),
            &InstallConfig::default().luks,
            &passphrase(),
        )
        .await
        .unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Provisioning));
    }

    #[tokio::test]
    async fn test_open_refuses_active_mapping() {
        let system = FakeSystem::new();
        system.add_block_device("/dev/mapper/cryptroot");
        let error = open(&system, Path::new("/dev/sda2"), "cryptroot", &passphrase())
            .await
            .unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Provisioning));
        assert!(system.commands().is_empty());
    }
}
