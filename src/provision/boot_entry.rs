use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};

use crate::{
    config::InstallConfig,
    error::{Classify as _, FailureClass},
    fs::luks2::mapper_path,
    system::{in_root, System},
};

use super::{
    base::{AMD_MICROCODE, INTEL_MICROCODE},
    filesystem::{subvolume, SubvolumeRole},
    kernel::InstalledKernel,
    static_config::Identifiers,
};

pub const ENTRY_NAME: &str = "cryptforge";

pub const ENTRIES_DIR: &str = "/boot/loader/entries";

pub const LOADER_CONF: &str = "/boot/loader/loader.conf";

/// A rendered loader entry and the loader configuration selecting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedBoot {
    pub entry_file: PathBuf,
    pub entry: String,
    pub loader: String,
}

pub fn kernel_options(identifiers: &Identifiers, mapped_name: &str, extra_args: &[String]) -> String {
    let mut options = vec![
        format!("rd.luks.name={}={mapped_name}", identifiers.payload_uuid),
        "rd.luks.options=discard".to_owned(),
        format!("root={}", mapper_path(mapped_name).display()),
        format!("rootflags={}", subvolume(SubvolumeRole::Root).mount_options()),
        "rw".to_owned(),
    ];
    options.extend(extra_args.iter().cloned());
    options.join(" ")
}

/// Render the entry for `kernel`. `microcode` is the image name below /boot, if there is one.
pub fn compose(
    kernel: &InstalledKernel,
    microcode: Option<&str>,
    identifiers: &Identifiers,
    config: &InstallConfig,
    extra_args: &[String],
) -> ComposedBoot {
    let mut entry = format!("title   {}\n", config.boot.entry_title);
    entry.push_str(&format!(
        "linux   {}\n",
        InstalledKernel::boot_relative(&kernel.image)
    ));
    if let Some(microcode) = microcode {
        entry.push_str(&format!("initrd  /{microcode}\n"));
    }
    entry.push_str(&format!(
        "initrd  {}\n",
        InstalledKernel::boot_relative(&kernel.initramfs)
    ));
    entry.push_str(&format!(
        "options {}\n",
        kernel_options(identifiers, &config.mapped_name, extra_args)
    ));

    let loader = format!(
        "default {ENTRY_NAME}.conf\ntimeout {}\nconsole-mode max\neditor no\n",
        config.boot.timeout
    );

    ComposedBoot {
        entry_file: Path::new(ENTRIES_DIR).join(format!("{ENTRY_NAME}.conf")),
        entry,
        loader,
    }
}

/// The microcode image installed into the target's /boot, if any.
pub fn installed_microcode(system: &dyn System, root: &Path) -> Option<&'static str> {
    [INTEL_MICROCODE, AMD_MICROCODE]
        .into_iter()
        .map(|microcode| microcode.image)
        .find(|image| system.exists(&in_root(root, Path::new("/boot").join(image))))
}

/// Write the entry and loader.conf. Refuses to reference a kernel or initramfs that is missing.
pub async fn write(
    system: &dyn System,
    root: &Path,
    kernel: &InstalledKernel,
    identifiers: &Identifiers,
    config: &InstallConfig,
    extra_args: &[String],
) -> Result<ComposedBoot> {
    async {
        for file in [&kernel.image, &kernel.initramfs] {
            if !system.exists(&in_root(root, file)) {
                return Err(anyhow!("Boot entry would reference missing file {file:?}"));
            }
        }

        let microcode = installed_microcode(system, root);
        let composed = compose(kernel, microcode, identifiers, config, extra_args);

        system.create_dir_all(&in_root(root, ENTRIES_DIR)).await?;
        system
            .write(&in_root(root, &composed.entry_file), composed.entry.as_bytes())
            .await
            .context("Failed to write the loader entry")?;
        system
            .write(&in_root(root, LOADER_CONF), composed.loader.as_bytes())
            .await
            .context("Failed to write loader.conf")?;
        Ok::<_, anyhow::Error>(composed)
    }
    .await
    .classify(FailureClass::Provisioning)
}
