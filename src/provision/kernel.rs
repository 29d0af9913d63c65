use std::{
    cmp::Ordering,
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context as _, Result};

use crate::{
    config::KernelConfig,
    error::{failure_class_of, Classify as _, FailureClass},
    system::{Invocation, System, SystemExt as _},
};

use super::{
    chroot::{with_chroot, Chroot},
    outcome::{Degradation, StepOutcome},
    transcript::Transcript,
};

pub const TRANSCRIPT_PATH: &str = "/var/log/cryptforge/kernel-build.log";

pub const MODULES_DIR: &str = "/usr/lib/modules";

const TOOLCHAIN_PACKAGES: &[&str] = &["base-devel", "bc", "git", "cpio", "perl", "xz", "pahole"];

const REQUIRED_TOOLS: &[&str] = &["make", "gcc", "bc", "git"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSource {
    Built,
    Package,
}

/// The kernel the installed system boots. Paths are inside the installed system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKernel {
    pub source: KernelSource,
    pub release: String,
    pub image: PathBuf,
    pub initramfs: PathBuf,
}

impl InstalledKernel {
    /// File name of `path` as the boot loader sees it, relative to the ESP.
    pub fn boot_relative(path: &Path) -> String {
        format!(
            "/{}",
            path.strip_prefix("/boot").unwrap_or(path).display()
        )
    }
}

/// States of the kernel acquisition. `BuiltInstalled` and `PackageInstalled` are terminal.
#[derive(Debug)]
pub enum KernelState {
    Start,
    TryBuildFromSource,
    FallbackToPackage { reason: Option<Degradation> },
    BuiltInstalled(InstalledKernel),
    PackageInstalled {
        kernel: InstalledKernel,
        reason: Option<Degradation>,
    },
}

impl Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            KernelState::Start => "start",
            KernelState::TryBuildFromSource => "try-build-from-source",
            KernelState::FallbackToPackage { .. } => "fallback-to-package",
            KernelState::BuiltInstalled(_) => "built-installed",
            KernelState::PackageInstalled { .. } => "package-installed",
        })
    }
}

/// Order release strings such as `6.9.3-arch1-1` by their numeric components.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn numbers(s: &str) -> Vec<u64> {
        s.split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse().ok())
            .collect()
    }
    numbers(a).cmp(&numbers(b)).then_with(|| a.cmp(b))
}

async fn build_from_source(
    chroot: &Chroot<'_>,
    config: &KernelConfig,
    transcript: &mut Transcript,
) -> Result<InstalledKernel> {
    let source_dir = config.source_dir.as_path();
    let system = chroot.system();

    transcript.note("installing toolchain");
    if let Err(error) = transcript
        .step(
            chroot,
            Invocation::new("pacman")
                .args(["-S", "--noconfirm", "--needed"])
                .args(TOOLCHAIN_PACKAGES),
            FailureClass::MissingToolchain,
        )
        .await
    {
        tracing::warn!("Failed to install the kernel toolchain, checking for tools already present: {error:#}");
    }
    for tool in REQUIRED_TOOLS {
        transcript
            .step(
                chroot,
                Invocation::new("sh").args(["-c", &format!("command -v {tool}")]),
                FailureClass::MissingToolchain,
            )
            .await
            .with_context(|| format!("Required tool {tool} is not available"))?;
    }

    if system.exists(&chroot.host_path(source_dir.join(".git"))) {
        transcript.note(format!("updating {source_dir:?}"));
        transcript
            .step(
                chroot,
                Invocation::new("git")
                    .arg("-C")
                    .arg(source_dir)
                    .args(["pull", "--ff-only"]),
                FailureClass::SourceUnavailable,
            )
            .await
            .context("Failed to update the kernel source tree")?;
    } else {
        transcript.note(format!("cloning {} at {}", config.git_url, config.git_ref));
        transcript
            .step(
                chroot,
                Invocation::new("git")
                    .args(["clone", "--depth", "1", "--branch", &config.git_ref, &config.git_url])
                    .arg(source_dir),
                FailureClass::SourceUnavailable,
            )
            .await
            .context("Failed to clone the kernel source tree")?;
    }

    let make = || Invocation::new("make").arg("-C").arg(source_dir);

    // Reuse the running kernel's configuration when the host exposes it.
    let running_config = system
        .run(Invocation::new("zcat").arg("/proc/config.gz"))
        .await
        .ok();
    match running_config {
        Some(running_config) => {
            transcript.note("configuring from /proc/config.gz");
            system
                .write(&chroot.host_path(source_dir.join(".config")), &running_config)
                .await
                .classify(FailureClass::CompileFailure)?;
            transcript
                .step(chroot, make().arg("olddefconfig"), FailureClass::CompileFailure)
                .await?;
        }
        None => {
            transcript.note("configuring from defconfig");
            transcript
                .step(chroot, make().arg("defconfig"), FailureClass::CompileFailure)
                .await?;
        }
    }

    transcript
        .step(
            chroot,
            make().arg(format!("-j{}", num_cpus::get())),
            FailureClass::CompileFailure,
        )
        .await
        .context("Kernel compilation failed")?;
    transcript
        .step(chroot, make().arg("modules_install"), FailureClass::ModuleInstall)
        .await
        .context("Failed to install kernel modules")?;

    let release = transcript
        .step(chroot, make().args(["-s", "kernelrelease"]), FailureClass::CompileFailure)
        .await?
        .stdout_trimmed();
    let image_name = transcript
        .step(chroot, make().args(["-s", "image_name"]), FailureClass::CompileFailure)
        .await?
        .stdout_trimmed();
    if release.is_empty() || image_name.is_empty() {
        return Err(anyhow!("The kernel build did not report its release or image")
            .context(FailureClass::CompileFailure));
    }

    let image = PathBuf::from(format!("/boot/vmlinuz-{release}"));
    let initramfs = PathBuf::from(format!("/boot/initramfs-{release}.img"));
    system
        .copy(
            &chroot.host_path(source_dir.join(&image_name)),
            &chroot.host_path(&image),
        )
        .await
        .classify(FailureClass::CompileFailure)?;
    transcript
        .step(
            chroot,
            Invocation::new("mkinitcpio")
                .args(["-k", &release, "-g"])
                .arg(&initramfs),
            FailureClass::ModuleInstall,
        )
        .await
        .context("Failed to generate the initramfs for the built kernel")?;

    Ok(InstalledKernel {
        source: KernelSource::Built,
        release,
        image,
        initramfs,
    })
}

/// Find the module tree the stock package installed: the one whose `pkgbase` names the
/// package, else the newest one shipping a `vmlinuz`.
pub async fn discover_module_tree(chroot: &Chroot<'_>, package: &str) -> Result<String> {
    let system = chroot.system();
    let modules_dir = chroot.host_path(MODULES_DIR);
    let mut candidates = vec![];
    for release in system.read_dir(&modules_dir).await.unwrap_or_default() {
        let tree = modules_dir.join(&release);
        if !system.exists(&tree.join("vmlinuz")) {
            continue;
        }
        let pkgbase = system
            .read_to_string(&tree.join("pkgbase"))
            .await
            .map(|pkgbase| pkgbase.trim().to_owned())
            .unwrap_or_default();
        if pkgbase == package {
            return Ok(release);
        }
        candidates.push(release);
    }
    candidates
        .into_iter()
        .max_by(|a, b| compare_versions(a, b))
        .ok_or_else(|| anyhow!("No kernel found below {MODULES_DIR}"))
        .classify(FailureClass::NoInstalledKernel)
}

/// Install the stock kernel package. Safe to repeat, the package manager skips what is there.
async fn install_package(
    chroot: &Chroot<'_>,
    package: &str,
    transcript: &mut Transcript,
) -> Result<InstalledKernel> {
    transcript.note(format!("installing stock kernel package {package}"));
    if let Err(error) = transcript
        .step(
            chroot,
            Invocation::new("pacman")
                .args(["-S", "--noconfirm", "--needed"])
                .arg(package)
                .arg(format!("{package}-headers")),
            FailureClass::NoInstalledKernel,
        )
        .await
    {
        tracing::warn!("Failed to install {package}, looking for an existing kernel: {error:#}");
    }

    let release = discover_module_tree(chroot, package).await?;
    let image = PathBuf::from(format!("/boot/vmlinuz-{package}"));
    let initramfs = PathBuf::from(format!("/boot/initramfs-{package}.img"));

    let system = chroot.system();
    system
        .copy(
            &chroot.host_path(Path::new(MODULES_DIR).join(&release).join("vmlinuz")),
            &chroot.host_path(&image),
        )
        .await
        .classify(FailureClass::NoInstalledKernel)?;
    transcript
        .step(
            chroot,
            Invocation::new("mkinitcpio")
                .args(["-k", &release, "-g"])
                .arg(&initramfs),
            FailureClass::Provisioning,
        )
        .await
        .with_context(|| format!("Failed to generate the initramfs for {release}"))?;

    Ok(InstalledKernel {
        source: KernelSource::Package,
        release,
        image,
        initramfs,
    })
}

/// Drive the state machine inside an already entered chroot.
pub async fn acquire(chroot: &Chroot<'_>, config: &KernelConfig) -> Result<StepOutcome<InstalledKernel>> {
    let mut transcript = Transcript::default();
    let mut state = KernelState::Start;
    loop {
        tracing::debug!(state = %state, "Kernel pipeline");
        state = match state {
            KernelState::Start if config.build_from_source => KernelState::TryBuildFromSource,
            KernelState::Start => KernelState::FallbackToPackage { reason: None },
            KernelState::TryBuildFromSource => {
                match build_from_source(chroot, config, &mut transcript).await {
                    Ok(kernel) => KernelState::BuiltInstalled(kernel),
                    Err(error) => {
                        let class =
                            failure_class_of(&error).unwrap_or(FailureClass::CompileFailure);
                        tracing::warn!(
                            "Building the kernel from source failed, falling back to the {} package: {error:#}",
                            config.package
                        );
                        transcript.note(format!("build failed: {error:#}"));
                        KernelState::FallbackToPackage {
                            reason: Some(Degradation {
                                component: "kernel",
                                class,
                                detail: format!("{error:#}"),
                                transcript: None,
                            }),
                        }
                    }
                }
            }
            KernelState::FallbackToPackage { reason } => {
                let kernel = install_package(chroot, &config.package, &mut transcript).await?;
                KernelState::PackageInstalled { kernel, reason }
            }
            KernelState::BuiltInstalled(kernel) => {
                transcript.persist(chroot, Path::new(TRANSCRIPT_PATH)).await;
                return Ok(StepOutcome::Completed(kernel));
            }
            KernelState::PackageInstalled { kernel, reason } => {
                let persisted = transcript.persist(chroot, Path::new(TRANSCRIPT_PATH)).await;
                return Ok(match reason {
                    None => StepOutcome::Completed(kernel),
                    Some(reason) => StepOutcome::Degraded {
                        value: kernel,
                        reason: Degradation {
                            transcript: persisted,
                            ..reason
                        },
                    },
                });
            }
        }
    }
}

pub async fn run(system: &dyn System, root: &Path, config: &KernelConfig) -> Result<StepOutcome<InstalledKernel>> {
    with_chroot(system, root, |chroot| async move { acquire(&chroot, config).await }).await
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::{config::InstallConfig, error::failure_class_of, system::fake::FakeSystem};

    pub fn stock_kernel(system: &FakeSystem, release: &str, pkgbase: &str) {
        let tree = format!("/mnt/usr/lib/modules/{release}");
        system.touch(format!("{tree}/vmlinuz"), b"stock image");
        system.touch(format!("{tree}/pkgbase"), format!("{pkgbase}\n").as_bytes());
    }

    fn build_config() -> KernelConfig {
        let mut config = InstallConfig::default().kernel;
        config.build_from_source = true;
        config
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("6.10.2-arch1-1", "6.9.12-arch1-1"), Ordering::Greater);
        assert_eq!(compare_versions("6.6.30-1-lts", "6.6.30-1-lts"), Ordering::Equal);
        assert_eq!(compare_versions("5.15.0", "6.1.0"), Ordering::Less);
    }

    #[tokio::test]
    async fn test_skipped_build_installs_package() -> Result<()> {
        let system = FakeSystem::new();
        stock_kernel(&system, "6.9.3-arch1-1", "linux");

        let outcome = run(&system, Path::new("/mnt"), &InstallConfig::default().kernel).await?;

        assert!(!outcome.is_degraded());
        let kernel = outcome.into_value();
        assert_eq!(kernel.source, KernelSource::Package);
        assert_eq!(kernel.release, "6.9.3-arch1-1");
        assert_eq!(kernel.image, PathBuf::from("/boot/vmlinuz-linux"));
        assert_eq!(system.file("/mnt/boot/vmlinuz-linux").as_deref(), Some("stock image"));
        assert!(system.ran("chroot /mnt mkinitcpio -k 6.9.3-arch1-1 -g /boot/initramfs-linux.img"));
        assert!(!system.ran("git"));
        Ok(())
    }

    #[tokio::test]
    async fn test_build_failure_falls_back_to_package() -> Result<()> {
        let system = FakeSystem::new();
        stock_kernel(&system, "6.9.3-arch1-1", "linux");
        system.fail(&format!("-j{}", num_cpus::get()));

        let outcome = run(&system, Path::new("/mnt"), &build_config()).await?;

        let reason = outcome.degradation().cloned();
        assert_eq!(outcome.value().source, KernelSource::Package);
        assert!(!outcome.value().release.is_empty());
        assert!(reason.as_ref().is_some_and(|reason| reason.class == FailureClass::CompileFailure));
        assert_eq!(
            reason.and_then(|reason| reason.transcript),
            Some(PathBuf::from(TRANSCRIPT_PATH))
        );
        let log = system.file(format!("/mnt{TRANSCRIPT_PATH}")).unwrap_or_default();
        assert!(log.contains("simulated failure"));
        assert!(!system.ran("modules_install"));
        // A single install on fallback.
        assert_eq!(
            system
                .commands()
                .iter()
                .filter(|cmd| cmd.contains("pacman -S --noconfirm --needed linux linux-headers"))
                .count(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_recorded() -> Result<()> {
        let system = FakeSystem::new();
        stock_kernel(&system, "6.9.3-arch1-1", "linux");
        system.fail("command -v gcc");

        let outcome = run(&system, Path::new("/mnt"), &build_config()).await?;
        assert_eq!(
            outcome.degradation().map(|reason| reason.class),
            Some(FailureClass::MissingToolchain)
        );
        assert!(!system.ran("git clone"));
        Ok(())
    }

    #[tokio::test]
    async fn test_toolchain_install_failure_uses_present_tools() -> Result<()> {
        let system = FakeSystem::new();
        stock_kernel(&system, "6.9.3-arch1-1", "linux");
        system.fail("pacman -S --noconfirm --needed base-devel");

        run(&system, Path::new("/mnt"), &build_config()).await?;
        assert!(system.position("pacman -S --noconfirm --needed base-devel")
            < system.position("command -v make"));
        assert!(system.ran("git clone"));
        Ok(())
    }

    #[tokio::test]
    async fn test_successful_build() -> Result<()> {
        let system = FakeSystem::new();
        system.respond("kernelrelease", "6.11.0-rc1\n");
        system.respond("image_name", "arch/x86/boot/bzImage\n");
        system.touch("/mnt/usr/src/linux/arch/x86/boot/bzImage", b"built image");

        let outcome = run(&system, Path::new("/mnt"), &build_config()).await?;

        assert_eq!(
            outcome,
            StepOutcome::Completed(InstalledKernel {
                source: KernelSource::Built,
                release: "6.11.0-rc1".to_owned(),
                image: PathBuf::from("/boot/vmlinuz-6.11.0-rc1"),
                initramfs: PathBuf::from("/boot/initramfs-6.11.0-rc1.img"),
            })
        );
        assert!(system.ran(
            "chroot /mnt git clone --depth 1 --branch linux-rolling-stable \
             https://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git /usr/src/linux"
        ));
        assert_eq!(system.file("/mnt/boot/vmlinuz-6.11.0-rc1").as_deref(), Some("built image"));
        assert!(!system.ran("linux-headers"));
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_tree_is_fast_forwarded() -> Result<()> {
        let system = FakeSystem::new();
        stock_kernel(&system, "6.9.3-arch1-1", "linux");
        system.with_state(|state| state.add_dir("/mnt/usr/src/linux/.git"));

        run(&system, Path::new("/mnt"), &build_config()).await?;
        assert!(system.ran("chroot /mnt git -C /usr/src/linux pull --ff-only"));
        assert!(!system.ran("git clone"));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_kernel_is_fatal() {
        let system = FakeSystem::new();
        let error = run(&system, Path::new("/mnt"), &build_config())
            .await
            .unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::NoInstalledKernel));
        assert!(system.ran("umount -R -l /mnt/proc"));
    }

    #[tokio::test]
    async fn test_discovery_prefers_matching_pkgbase() -> Result<()> {
        let system = FakeSystem::new();
        stock_kernel(&system, "6.10.1-arch1-1", "linux-zen");
        stock_kernel(&system, "6.6.40-1-lts", "linux-lts");

        let release = with_chroot(&system, Path::new("/mnt"), |chroot| async move {
            Ok::<_, anyhow::Error>((
                discover_module_tree(&chroot, "linux-lts").await?,
                discover_module_tree(&chroot, "linux").await?,
            ))
        })
        .await?;
        assert_eq!(release, ("6.6.40-1-lts".to_owned(), "6.10.1-arch1-1".to_owned()));
        Ok(())
    }
}
