use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};

use crate::{
    config::DriverConfig,
    error::FailureClass,
    system::{Invocation, System},
};

use super::{
    chroot::{with_chroot, Chroot},
    kernel::{compare_versions, InstalledKernel, MODULES_DIR},
    outcome::Degradation,
    transcript::Transcript,
};

pub const TRANSCRIPT_PATH: &str = "/var/log/cryptforge/driver-build.log";

const DKMS_SOURCE_DIR: &str = "/usr/src";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledDriver {
    pub module: String,
    pub version: String,
    pub release: String,
}

/// Terminal states of the driver pipeline. A failure leaves the system bootable without the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Skipped,
    Installed(InstalledDriver),
    Failed(Degradation),
}

impl DriverState {
    /// Kernel command line arguments the boot entry needs for this driver.
    pub fn kernel_args(&self) -> Vec<String> {
        match self {
            DriverState::Installed(driver) => vec![format!("{}-drm.modeset=1", driver.module)],
            DriverState::Skipped | DriverState::Failed(_) => vec![],
        }
    }
}

/// Modules loaded from the initramfs so the display works in early boot.
pub fn early_modules(module: &str) -> Vec<String> {
    match module {
        "nvidia" => ["nvidia", "nvidia_modeset", "nvidia_uvm", "nvidia_drm"]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        module => vec![module.to_owned()],
    }
}

/// Highest version of the module's DKMS source tree below /usr/src.
async fn find_source_version(chroot: &Chroot<'_>, module: &str) -> Option<String> {
    let prefix = format!("{module}-");
    chroot
        .system()
        .read_dir(&chroot.host_path(DKMS_SOURCE_DIR))
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|name| name.strip_prefix(&prefix).map(str::to_owned))
        .filter(|version| version.starts_with(|c: char| c.is_ascii_digit()))
        .max_by(|a, b| compare_versions(a, b))
}

async fn build(
    chroot: &Chroot<'_>,
    config: &DriverConfig,
    kernel: &InstalledKernel,
    transcript: &mut Transcript,
) -> Result<InstalledDriver> {
    let release = &kernel.release;
    let module_tree = chroot.host_path(Path::new(MODULES_DIR).join(release));
    if !chroot.system().exists(&module_tree) {
        return Err(anyhow!("Kernel {release} has no module tree in the installed system"));
    }

    let version = match find_source_version(chroot, &config.module).await {
        Some(version) => version,
        None => {
            transcript.note(format!("installing {}", config.package));
            transcript
                .step(
                    chroot,
                    Invocation::new("pacman")
                        .args(["-S", "--noconfirm", "--needed", "dkms"])
                        .arg(&config.package),
                    FailureClass::DriverBuild,
                )
                .await
                .with_context(|| format!("Failed to install {}", config.package))?;
            find_source_version(chroot, &config.module)
                .await
                .ok_or_else(|| {
                    anyhow!("No {} source tree below {DKMS_SOURCE_DIR}", config.module)
                })?
        }
    };

    transcript
        .step(
            chroot,
            Invocation::new("dkms")
                .arg("install")
                .arg(format!("{}/{version}", config.module))
                .args(["-k", release]),
            FailureClass::DriverBuild,
        )
        .await
        .with_context(|| format!("Failed to build {} {version} for {release}", config.module))?;

    let modules_conf = Path::new("/etc/mkinitcpio.conf.d").join(format!("{}.conf", config.module));
    let system = chroot.system();
    let host_modules_conf = chroot.host_path(&modules_conf);
    if let Some(parent) = host_modules_conf.parent() {
        system.create_dir_all(parent).await?;
    }
    system
        .write(
            &host_modules_conf,
            format!("MODULES=({})\n", early_modules(&config.module).join(" ")).as_bytes(),
        )
        .await?;
    transcript
        .step(
            chroot,
            Invocation::new("mkinitcpio")
                .args(["-k", release, "-g"])
                .arg(&kernel.initramfs),
            FailureClass::DriverBuild,
        )
        .await
        .context("Failed to regenerate the initramfs with the driver module")?;

    Ok(InstalledDriver {
        module: config.module.clone(),
        version,
        release: release.clone(),
    })
}

pub async fn install(
    chroot: &Chroot<'_>,
    config: &DriverConfig,
    kernel: &InstalledKernel,
) -> DriverState {
    if !config.enabled {
        return DriverState::Skipped;
    }

    let mut transcript = Transcript::default();
    let result = build(chroot, config, kernel, &mut transcript).await;
    let persisted: Option<PathBuf> = transcript.persist(chroot, Path::new(TRANSCRIPT_PATH)).await;
    match result {
        Ok(driver) => DriverState::Installed(driver),
        Err(error) => {
            tracing::warn!(
                "Driver module {} is not installed, continuing without it: {error:#}",
                config.module
            );
            DriverState::Failed(Degradation {
                component: "driver",
                class: FailureClass::DriverBuild,
                detail: format!("{error:#}"),
                transcript: persisted,
            })
        }
    }
}

/// Build the driver for `kernel`. Only a failure to enter the chroot is an error.
pub async fn run(
    system: &dyn System,
    root: &Path,
    config: &DriverConfig,
    kernel: &InstalledKernel,
) -> Result<DriverState> {
    if !config.enabled {
        return Ok(DriverState::Skipped);
    }
    with_chroot(system, root, |chroot| async move {
        Ok(install(&chroot, config, kernel).await)
    })
    .await
}
