pub mod source;

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use serde::Serialize;

use crate::types::{ByteSize, Passphrase};

/// Everything a provisioning run can be tuned with. Built from fixed defaults, then overridden
/// key by key from the configured sources.
#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct InstallConfig {
    /// The block device to wipe and provision.
    pub disk: PathBuf,

    /// Size of the unencrypted boot (EFI system) partition.
    pub boot_size: ByteSize,

    /// Where the new system is assembled on the host.
    pub target_root: PathBuf,

    pub hostname: String,

    pub locale: String,

    /// Console keymap written to vconsole.conf.
    pub keymap: String,

    /// Zone name below /usr/share/zoneinfo, e.g. `Europe/Berlin`.
    pub timezone: String,

    /// Name of the decrypted volume below /dev/mapper.
    pub mapped_name: String,

    /// Label of the btrfs filesystem.
    pub fs_label: String,

    pub swap_size: ByteSize,

    /// Packages installed after the base set. Failures are tolerated.
    pub extra_packages: Vec<String>,

    /// Package mirror written to the installed system's mirrorlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,

    /// Never serialized and never logged.
    #[serde(skip)]
    pub passphrase: Option<Passphrase>,

    pub luks: LuksParams,

    pub kernel: KernelConfig,

    pub driver: DriverConfig,

    pub boot: BootConfig,
}

/// Parameters of the LUKS2 container. The key-derivation cost is host specific, so it is
/// configured rather than fixed.
#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct LuksParams {
    pub cipher: String,

    /// Key size in bits.
    pub key_size: u32,

    pub hash: String,

    /// Password-based key derivation function, e.g. `argon2id`.
    pub pbkdf: String,

    /// Memory cost of the key derivation in KiB.
    pub pbkdf_memory: u32,

    /// Number of parallel threads for the key derivation.
    pub pbkdf_parallel: u32,

    /// Target unlock time in milliseconds.
    pub iter_time: u32,
}

#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct KernelConfig {
    /// Try to build a kernel from source before falling back to the stock package.
    pub build_from_source: bool,

    pub git_url: String,

    pub git_ref: String,

    /// Location of the kernel source tree inside the installed system.
    pub source_dir: PathBuf,

    /// Stock kernel package used when no kernel is built from source.
    pub package: String,
}

#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct DriverConfig {
    /// Try to build the proprietary driver module.
    pub enabled: bool,

    /// Module name, also the DKMS module name.
    pub module: String,

    /// Package shipping the DKMS source tree.
    pub package: String,
}

#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct BootConfig {
    /// Boot menu timeout in seconds.
    pub timeout: u32,

    pub entry_title: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            disk: PathBuf::from("/dev/nvme0n1"),
            boot_size: ByteSize::gib(1),
            target_root: PathBuf::from("/mnt"),
            hostname: "archlinux".to_owned(),
            locale: "en_US.UTF-8".to_owned(),
            keymap: "us".to_owned(),
            timezone: "UTC".to_owned(),
            mapped_name: "cryptroot".to_owned(),
            fs_label: "system".to_owned(),
            swap_size: ByteSize::gib(8),
            extra_packages: vec![],
            mirror: None,
            passphrase: None,
            luks: LuksParams {
                cipher: "aes-xts-plain64".to_owned(),
                key_size: 512,
                hash: "sha512".to_owned(),
                pbkdf: "argon2id".to_owned(),
                pbkdf_memory: 1024 * 1024,
                pbkdf_parallel: 4,
                iter_time: 2000,
            },
            kernel: KernelConfig {
                build_from_source: false,
                git_url: "https://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git"
                    .to_owned(),
                git_ref: "linux-rolling-stable".to_owned(),
                source_dir: PathBuf::from("/usr/src/linux"),
                package: "linux".to_owned(),
            },
            driver: DriverConfig {
                enabled: false,
                module: "nvidia".to_owned(),
                package: "nvidia-dkms".to_owned(),
            },
            boot: BootConfig {
                timeout: 3,
                entry_title: "Arch Linux".to_owned(),
            },
        }
    }
}

/// Every key accepted by [`InstallConfig::apply`].
pub const KNOWN_KEYS: &[&str] = &[
    "DISK",
    "BOOT_SIZE",
    "TARGET_ROOT",
    "HOSTNAME",
    "LOCALE",
    "KEYMAP",
    "TIMEZONE",
    "MAPPED_NAME",
    "FS_LABEL",
    "SWAP_SIZE",
    "EXTRA_PACKAGES",
    "MIRROR",
    "LUKS_PASSPHRASE",
    "LUKS_CIPHER",
    "LUKS_KEY_SIZE",
    "LUKS_HASH",
    "LUKS_PBKDF",
    "LUKS_PBKDF_MEMORY",
    "LUKS_PBKDF_PARALLEL",
    "LUKS_ITER_TIME",
    "BUILD_KERNEL",
    "KERNEL_GIT_URL",
    "KERNEL_GIT_REF",
    "KERNEL_SOURCE_DIR",
    "KERNEL_PACKAGE",
    "INSTALL_DRIVER",
    "DRIVER_MODULE",
    "DRIVER_PACKAGE",
    "BOOT_TIMEOUT",
    "ENTRY_TITLE",
];

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("Expected a boolean, got {other:?}"),
    }
}

fn parse_number(value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Expected a number, got {value:?}"))
}

impl InstallConfig {
    /// Override a single setting from its environment-style key.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value_owned = value.trim().to_owned();
        match key {
            "DISK" => self.disk = PathBuf::from(value_owned),
            "BOOT_SIZE" => self.boot_size = value.parse()?,
            "TARGET_ROOT" => self.target_root = PathBuf::from(value_owned),
            "HOSTNAME" => self.hostname = value_owned,
            "LOCALE" => self.locale = value_owned,
            "KEYMAP" => self.keymap = value_owned,
            "TIMEZONE" => self.timezone = value_owned,
            "MAPPED_NAME" => self.mapped_name = value_owned,
            "FS_LABEL" => self.fs_label = value_owned,
            "SWAP_SIZE" => self.swap_size = value.parse()?,
            "EXTRA_PACKAGES" => {
                self.extra_packages = value.split_whitespace().map(str::to_owned).collect()
            }
            "MIRROR" => self.mirror = Some(value_owned).filter(|m| !m.is_empty()),
            // Kept verbatim, surrounding whitespace may be part of a passphrase.
            "LUKS_PASSPHRASE" => self.passphrase = Some(Passphrase::from(value.to_owned())),
            "LUKS_CIPHER" => self.luks.cipher = value_owned,
            "LUKS_KEY_SIZE" => self.luks.key_size = parse_number(value)?,
            "LUKS_HASH" => self.luks.hash = value_owned,
            "LUKS_PBKDF" => self.luks.pbkdf = value_owned,
            "LUKS_PBKDF_MEMORY" => self.luks.pbkdf_memory = parse_number(value)?,
            "LUKS_PBKDF_PARALLEL" => self.luks.pbkdf_parallel = parse_number(value)?,
            "LUKS_ITER_TIME" => self.luks.iter_time = parse_number(value)?,
            "BUILD_KERNEL" => self.kernel.build_from_source = parse_bool(value)?,
            "KERNEL_GIT_URL" => self.kernel.git_url = value_owned,
            "KERNEL_GIT_REF" => self.kernel.git_ref = value_owned,
            "KERNEL_SOURCE_DIR" => self.kernel.source_dir = PathBuf::from(value_owned),
            "KERNEL_PACKAGE" => self.kernel.package = value_owned,
            "INSTALL_DRIVER" => self.driver.enabled = parse_bool(value)?,
            "DRIVER_MODULE" => self.driver.module = value_owned,
            "DRIVER_PACKAGE" => self.driver.package = value_owned,
            "BOOT_TIMEOUT" => self.boot.timeout = parse_number(value)?,
            "ENTRY_TITLE" => self.boot.entry_title = value_owned,
            _ => bail!("Unknown configuration key {key:?}"),
        }
        Ok(())
    }

    /// Check the values that can be checked without touching the machine.
    pub fn validate(&self) -> Result<()> {
        if !self.target_root.is_absolute() {
            bail!("TARGET_ROOT must be an absolute path, got {:?}", self.target_root);
        }
        if self.hostname.is_empty()
            || self.hostname.len() > 63
            || !self
                .hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            || self.hostname.starts_with('-')
        {
            bail!("HOSTNAME {:?} is not a valid host name", self.hostname);
        }
        if self.mapped_name.is_empty() || self.mapped_name.contains('/') {
            bail!("MAPPED_NAME {:?} is not a valid mapping name", self.mapped_name);
        }
        if self.locale.is_empty() || self.timezone.is_empty() || self.keymap.is_empty() {
            bail!("LOCALE, TIMEZONE and KEYMAP must not be empty");
        }
        if self.timezone.contains("..") || self.timezone.starts_with('/') {
            bail!("TIMEZONE {:?} must be a zone name", self.timezone);
        }
        if self.boot_size < ByteSize::mib(64) {
            bail!("BOOT_SIZE {} is too small for an EFI system partition", self.boot_size);
        }
        if self.swap_size.bytes() == 0 {
            bail!("SWAP_SIZE must not be zero");
        }
        if self.luks.key_size == 0 || self.luks.key_size % 8 != 0 {
            bail!("LUKS_KEY_SIZE must be a positive multiple of 8");
        }
        if self.luks.pbkdf_memory == 0 || self.luks.pbkdf_parallel == 0 || self.luks.iter_time == 0
        {
            bail!("LUKS_PBKDF_MEMORY, LUKS_PBKDF_PARALLEL and LUKS_ITER_TIME must be positive");
        }
        if self.passphrase.as_ref().is_some_and(|p| p.is_empty()) {
            bail!("LUKS_PASSPHRASE must not be empty");
        }
        if let Some(mirror) = &self.mirror {
            if !["http://", "https://", "ftp://", "file://"]
                .iter()
                .any(|scheme| mirror.starts_with(scheme))
            {
                bail!("MIRROR {mirror:?} is not a URL");
            }
        }
        if !self.kernel.source_dir.is_absolute() {
            bail!("KERNEL_SOURCE_DIR must be an absolute path");
        }
        if self.kernel.package.is_empty() {
            bail!("KERNEL_PACKAGE must not be empty");
        }
        if self.driver.enabled && (self.driver.module.is_empty() || self.driver.package.is_empty())
        {
            bail!("DRIVER_MODULE and DRIVER_PACKAGE must be set when INSTALL_DRIVER is enabled");
        }
        Ok(())
    }
}
