//! Pure rendering of the configuration files of the installed system.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::{
    config::InstallConfig,
    fs::luks2::mapper_path,
    system::{in_root, System},
};

use super::{
    filesystem::{mount_order, Subvolume, BOOT_MOUNT_OPTIONS, BOOT_MOUNT_POINT},
    swap::swap_file_in_target,
};

/// Filesystem UUIDs captured once the filesystems exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifiers {
    pub boot_uuid: String,
    pub payload_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    /// Absolute path inside the installed system.
    pub path: PathBuf,
    pub content: String,
}

const HEADER: &str = "# Generated by cryptforge, changes may be overwritten.\n";

pub const MKINITCPIO_HOOKS: &str = "base systemd autodetect microcode modconf kms keyboard \
                                    sd-vconsole block sd-encrypt filesystems fsck";

pub fn render_fstab(identifiers: &Identifiers, layout: &[Subvolume], mapped_name: &str) -> String {
    let mapped = mapper_path(mapped_name);
    let mut fstab = String::from(HEADER);
    fstab.push_str("# <file system> <dir> <type> <options> <dump> <pass>\n");
    for subvolume in mount_order(layout) {
        fstab.push_str(&format!(
            "{} {} btrfs {} 0 0\n",
            mapped.display(),
            subvolume.mount_point,
            subvolume.mount_options()
        ));
    }
    fstab.push_str(&format!(
        "UUID={} {BOOT_MOUNT_POINT} vfat {BOOT_MOUNT_OPTIONS} 0 2\n",
        identifiers.boot_uuid
    ));
    fstab.push_str(&format!(
        "{} none swap defaults 0 0\n",
        swap_file_in_target().display()
    ));
    fstab
}

pub fn render_crypttab(identifiers: &Identifiers, mapped_name: &str) -> String {
    format!(
        "{HEADER}{mapped_name} UUID={} none luks,discard\n",
        identifiers.payload_uuid
    )
}

pub fn render_hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1 localhost\n::1 localhost\n127.0.1.1 {hostname}.localdomain {hostname}\n"
    )
}

/// The `locale.gen` line for `locale`, e.g. `en_US.UTF-8 UTF-8`.
pub fn render_locale_gen(locale: &str) -> String {
    let charset = locale.split_once('.').map(|(_, charset)| charset).unwrap_or("UTF-8");
    format!("{locale} {charset}\n")
}

pub fn localtime_target(timezone: &str) -> PathBuf {
    Path::new("/usr/share/zoneinfo").join(timezone)
}

/// Every file written into the installed system, in a fixed order.
pub fn render_static_config(
    config: &InstallConfig,
    identifiers: &Identifiers,
    layout: &[Subvolume],
) -> Vec<RenderedFile> {
    let mut files = vec![
        RenderedFile {
            path: "/etc/fstab".into(),
            content: render_fstab(identifiers, layout, &config.mapped_name),
        },
        RenderedFile {
            path: "/etc/crypttab".into(),
            content: render_crypttab(identifiers, &config.mapped_name),
        },
        RenderedFile {
            path: "/etc/hostname".into(),
            content: format!("{}\n", config.hostname),
        },
        RenderedFile {
            path: "/etc/hosts".into(),
            content: render_hosts(&config.hostname),
        },
        RenderedFile {
            path: "/etc/locale.gen".into(),
            content: render_locale_gen(&config.locale),
        },
        RenderedFile {
            path: "/etc/locale.conf".into(),
            content: format!("LANG={}\n", config.locale),
        },
        RenderedFile {
            path: "/etc/vconsole.conf".into(),
            content: format!("KEYMAP={}\n", config.keymap),
        },
        RenderedFile {
            path: "/etc/mkinitcpio.conf.d/cryptforge.conf".into(),
            content: format!("{HEADER}HOOKS=({MKINITCPIO_HOOKS})\n"),
        },
    ];
    if let Some(mirror) = &config.mirror {
        files.push(RenderedFile {
            path: "/etc/pacman.d/mirrorlist".into(),
            content: format!("{HEADER}Server = {mirror}\n"),
        });
    }
    files
}

/// Host directory holding the pacman configuration pacstrap runs with when a mirror is set.
pub const PACSTRAP_CONF_DIR: &str = "/run/cryptforge";

/// A pacman.conf and mirrorlist for the host, so the base set is fetched from `mirror` as well.
/// The first file is the one to hand to `pacstrap -C`.
pub fn render_pacstrap_config(mirror: &str) -> [RenderedFile; 2] {
    let dir = Path::new(PACSTRAP_CONF_DIR);
    let mirrorlist = dir.join("mirrorlist");
    let mut pacman_conf = format!(
        "{HEADER}[options]\nArchitecture = auto\nSigLevel = Required DatabaseOptional\n\
         LocalFileSigLevel = Optional\nParallelDownloads = 5\n"
    );
    for repo in ["core", "extra"] {
        pacman_conf.push_str(&format!("\n[{repo}]\nInclude = {}\n", mirrorlist.display()));
    }
    [
        RenderedFile {
            path: dir.join("pacman.conf"),
            content: pacman_conf,
        },
        RenderedFile {
            path: mirrorlist,
            content: format!("{HEADER}Server = {mirror}\n"),
        },
    ]
}

pub async fn write_rendered(system: &dyn System, root: &Path, files: &[RenderedFile]) -> Result<()> {
    for file in files {
        let path = in_root(root, &file.path);
        if let Some(parent) = path.parent() {
            system.create_dir_all(parent).await?;
        }
        system
            .write(&path, file.content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {:?}", file.path))?;
        tracing::debug!("Wrote {:?}", file.path);
    }
    Ok(())
}
