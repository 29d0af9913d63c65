use std::path::Path;

use anyhow::{anyhow, Context as _, Result};

use crate::{
    config::InstallConfig,
    error::{Classify as _, FailureClass},
    system::{Invocation, System, SystemExt as _},
};

use super::{
    chroot::{with_chroot, Chroot},
    filesystem::Subvolume,
    naming::DeviceNameSet,
    static_config::{
        localtime_target, render_pacstrap_config, render_static_config, write_rendered,
        Identifiers,
    },
};

/// Installed with pacstrap. A failure here is fatal.
pub const BASE_PACKAGES: &[&str] = &[
    "base",
    "linux-firmware",
    "mkinitcpio",
    "btrfs-progs",
    "cryptsetup",
    "dosfstools",
    "efibootmgr",
    "sudo",
];

/// CPU microcode shipped as an early initrd image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microcode {
    pub package: &'static str,
    /// Image name below /boot.
    pub image: &'static str,
}

pub const INTEL_MICROCODE: Microcode = Microcode {
    package: "intel-ucode",
    image: "intel-ucode.img",
};

pub const AMD_MICROCODE: Microcode = Microcode {
    package: "amd-ucode",
    image: "amd-ucode.img",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseInstall {
    pub identifiers: Identifiers,
    /// Optional packages the package manager could not install.
    pub unavailable_packages: Vec<String>,
}

/// Pick the microcode package from the host CPU vendor.
pub fn detect_microcode(cpuinfo: &str) -> Option<Microcode> {
    let vendor = cpuinfo
        .lines()
        .find(|line| line.starts_with("vendor_id"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, vendor)| vendor.trim())?;
    match vendor {
        "GenuineIntel" => Some(INTEL_MICROCODE),
        "AuthenticAMD" => Some(AMD_MICROCODE),
        _ => None,
    }
}

/// With `pacman_conf`, pacstrap resolves packages through that configuration instead of the host's.
pub async fn install_packages(
    system: &dyn System,
    root: &Path,
    packages: &[&str],
    pacman_conf: Option<&Path>,
) -> Result<()> {
    let mut invocation = Invocation::new("pacstrap");
    if let Some(pacman_conf) = pacman_conf {
        invocation = invocation.arg("-C").arg(pacman_conf);
    }
    system
        .run(invocation.arg("-K").arg(root).args(packages))
        .await
        .with_context(|| format!("Failed to install base packages into {root:?}"))
        .classify(FailureClass::Provisioning)?;
    Ok(())
}

/// Install each optional package on its own and return those that could not be installed.
pub async fn install_optional_packages(chroot: &Chroot<'_>, packages: &[String]) -> Vec<String> {
    let mut unavailable = vec![];
    for package in packages {
        let installed = chroot
            .run_best_effort(
                Invocation::new("pacman")
                    .args(["-S", "--noconfirm", "--needed"])
                    .arg(package),
            )
            .await;
        if !installed {
            tracing::warn!("Package unavailable, skipping: {package}");
            unavailable.push(package.clone());
        }
    }
    unavailable
}

async fn filesystem_uuid(system: &dyn System, dev: &Path) -> Result<String> {
    let stdout = system
        .run(Invocation::new("blkid").args(["-s", "UUID", "-o", "value"]).arg(dev))
        .await?;
    let uuid = String::from_utf8_lossy(&stdout).trim().to_owned();
    if uuid.is_empty() {
        return Err(anyhow!("{dev:?} has no filesystem UUID"));
    }
    Ok(uuid)
}

/// Read the UUIDs of the boot filesystem and of the LUKS header on the payload partition.
pub async fn capture_identifiers(system: &dyn System, names: &DeviceNameSet) -> Result<Identifiers> {
    async {
        Ok::<_, anyhow::Error>(Identifiers {
            boot_uuid: filesystem_uuid(system, &names.boot).await?,
            payload_uuid: filesystem_uuid(system, &names.payload).await?,
        })
    }
    .await
    .context("Failed to capture partition identifiers")
    .classify(FailureClass::Provisioning)
}

async fn finish_in_chroot(chroot: &Chroot<'_>, config: &InstallConfig) -> Result<()> {
    chroot
        .run(Invocation::new("locale-gen"))
        .await
        .context("Failed to generate locales")?;
    chroot
        .run(
            Invocation::new("ln")
                .arg("-sf")
                .arg(localtime_target(&config.timezone))
                .arg("/etc/localtime"),
        )
        .await
        .context("Failed to set the time zone")?;
    chroot
        .run_best_effort(Invocation::new("hwclock").arg("--systohc"))
        .await;
    chroot
        .run(Invocation::new("bootctl").arg("install"))
        .await
        .context("Failed to install the boot loader")?;
    if !chroot
        .run_best_effort(Invocation::new("systemctl").args(["enable", "systemd-timesyncd"]))
        .await
    {
        tracing::debug!("Clock synchronisation service not enabled");
    }
    Ok(())
}

/// Install the base system into `root`, then render and apply its static configuration.
pub async fn run(
    system: &dyn System,
    root: &Path,
    config: &InstallConfig,
    names: &DeviceNameSet,
    layout: &[Subvolume],
) -> Result<BaseInstall> {
    let pacman_conf = match &config.mirror {
        Some(mirror) => {
            let [pacman_conf, mirrorlist] = render_pacstrap_config(mirror);
            write_rendered(system, Path::new("/"), &[pacman_conf.clone(), mirrorlist])
                .await
                .context("Failed to prepare the package manager configuration for pacstrap")
                .classify(FailureClass::Provisioning)?;
            Some(pacman_conf.path)
        }
        None => None,
    };
    install_packages(system, root, BASE_PACKAGES, pacman_conf.as_deref()).await?;

    let mut optional = vec![];
    match system.read_to_string(Path::new("/proc/cpuinfo")).await {
        Ok(cpuinfo) => {
            if let Some(microcode) = detect_microcode(&cpuinfo) {
                optional.push(microcode.package.to_owned());
            }
        }
        Err(error) => tracing::debug!("Cannot detect CPU vendor: {error:#}"),
    }
    optional.extend(config.extra_packages.iter().cloned());

    let identifiers = capture_identifiers(system, names).await?;
    let files = render_static_config(config, &identifiers, layout);
    write_rendered(system, root, &files)
        .await
        .classify(FailureClass::Provisioning)?;

    let unavailable_packages = with_chroot(system, root, |chroot| async move {
        let unavailable = install_optional_packages(&chroot, &optional).await;
        finish_in_chroot(&chroot, config).await?;
        Ok::<_, anyhow::Error>(unavailable)
    })
    .await
    .classify(FailureClass::Provisioning)?;

    Ok(BaseInstall {
        identifiers,
        unavailable_packages,
    })
}
