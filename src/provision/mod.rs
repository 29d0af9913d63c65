//! The provisioning workflow: every stage runs strictly after the one before it, and each hands
//! its artifacts forward through [`ProvisionReport`].

pub mod base;
pub mod boot_entry;
pub mod chroot;
pub mod driver;
pub mod encryption;
pub mod filesystem;
pub mod kernel;
pub mod naming;
pub mod outcome;
pub mod partition;
pub mod preflight;
pub mod static_config;
pub mod swap;
pub mod transcript;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tracing::Instrument as _;

use crate::{
    config::InstallConfig,
    error::FailureClass,
    fs::poll::PollPolicy,
    system::System,
    types::Passphrase,
};

use self::{
    base::BaseInstall,
    boot_entry::ComposedBoot,
    driver::DriverState,
    encryption::MappedVolume,
    filesystem::SUBVOLUME_LAYOUT,
    kernel::InstalledKernel,
    naming::DeviceNameSet,
    outcome::{Degradation, StepOutcome},
    partition::PartitionPlan,
    swap::SwapFile,
};

/// The exact text an operator has to enter before the disk is wiped.
pub const CONFIRMATION_TOKEN: &str = "YES";

pub const STAGE_COUNT: usize = 8;

/// Proof that the operator agreed to lose everything on the disk.
#[derive(Debug)]
pub struct Confirmation(());

impl Confirmation {
    pub fn check(input: &str) -> Result<Self> {
        if input.trim_end_matches(&['\r', '\n'][..]) == CONFIRMATION_TOKEN {
            Ok(Self(()))
        } else {
            Err(anyhow!(
                "Confirmation {input:?} does not match {CONFIRMATION_TOKEN:?}, aborted without any changes"
            )
            .context(FailureClass::Cancelled))
        }
    }
}

/// Everything the run produced, in stage order.
#[derive(Debug)]
pub struct ProvisionReport {
    pub names: DeviceNameSet,
    pub mapped: MappedVolume,
    pub mounts: Vec<PathBuf>,
    pub swap: SwapFile,
    pub base: BaseInstall,
    pub kernel: StepOutcome<InstalledKernel>,
    pub driver: DriverState,
    pub boot: ComposedBoot,
}

impl ProvisionReport {
    pub fn degradations(&self) -> Vec<&Degradation> {
        let mut degradations = vec![];
        degradations.extend(self.kernel.degradation());
        if let DriverState::Failed(reason) = &self.driver {
            degradations.push(reason);
        }
        degradations
    }
}

/// State threaded through the stages of one run.
pub struct ProvisionContext<'a> {
    system: &'a dyn System,
    config: &'a InstallConfig,
    /// Taken by the encryption stage and dropped once the volume is open.
    passphrase: Option<Passphrase>,
    names: DeviceNameSet,
    poll_policy: PollPolicy,
    stage: usize,
}

impl<'a> ProvisionContext<'a> {
    /// `names` comes from a successful preflight on the same configuration.
    pub fn new(
        system: &'a dyn System,
        config: &'a InstallConfig,
        names: DeviceNameSet,
        passphrase: Passphrase,
    ) -> Self {
        Self {
            system,
            config,
            passphrase: Some(passphrase),
            names,
            poll_policy: PollPolicy::DEVICE_NODES,
            stage: 0,
        }
    }

    pub fn with_poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    fn next_stage(&mut self, message: &str) {
        self.stage += 1;
        tracing::info!("[ {}/{STAGE_COUNT} ] {message}", self.stage);
    }

    async fn encrypt(&mut self) -> Result<MappedVolume> {
        let passphrase = self.passphrase.take().ok_or_else(|| {
            anyhow!("The passphrase was already used").context(FailureClass::Provisioning)
        })?;
        encryption::format(self.system, &self.names.payload, &self.config.luks, &passphrase).await?;
        encryption::open(
            self.system,
            &self.names.payload,
            &self.config.mapped_name,
            &passphrase,
        )
        .await
    }

    /// Run every stage. Destructive from the first stage on, so it requires a [`Confirmation`].
    pub async fn run(mut self, _confirmation: Confirmation) -> Result<ProvisionReport> {
        let system = self.system;
        let config = self.config;
        let root = config.target_root.as_path();
        let disk = config.disk.as_path();

        self.next_stage(&format!("Partitioning {disk:?}"));
        let plan = PartitionPlan::standard(config.boot_size)?;
        async {
            partition::wipe_table(system, disk).await?;
            partition::create_plan(system, disk, &plan).await?;
            partition::wait_for_nodes(system, &self.names.all(), self.poll_policy).await
        }
        .instrument(tracing::info_span!("partition"))
        .await
        .map_err(provisioning)?;

        self.next_stage(&format!("Encrypting {:?}", self.names.payload));
        let mapped = self
            .encrypt()
            .instrument(tracing::info_span!("encryption"))
            .await?;

        self.next_stage(&format!("Creating btrfs on {:?}", mapped.path));
        let mounts = async {
            filesystem::create_filesystem(system, &mapped, &config.fs_label).await?;
            filesystem::create_subvolumes(system, &mapped, root, &SUBVOLUME_LAYOUT).await?;
            let mut mounts = filesystem::mount_all(system, &mapped, root, &SUBVOLUME_LAYOUT).await?;
            mounts.push(filesystem::mount_boot(system, &self.names.boot, root).await?);
            Ok::<_, anyhow::Error>(mounts)
        }
        .instrument(tracing::info_span!("filesystem"))
        .await?;

        self.next_stage(&format!("Creating {} swap file", config.swap_size));
        let swap = swap::provision_swap(system, root, config.swap_size)
            .instrument(tracing::info_span!("swap"))
            .await?;

        self.next_stage("Installing base system");
        let base = base::run(system, root, config, &self.names, &SUBVOLUME_LAYOUT)
            .instrument(tracing::info_span!("base"))
            .await?;

        self.next_stage("Installing kernel");
        let kernel = kernel::run(system, root, &config.kernel)
            .instrument(tracing::info_span!("kernel"))
            .await?;
        if let Some(reason) = kernel.degradation() {
            tracing::warn!("Kernel degraded: {reason}");
        }

        self.next_stage("Installing driver module");
        let driver = driver::run(system, root, &config.driver, kernel.value())
            .instrument(tracing::info_span!("driver"))
            .await?;

        self.next_stage("Writing boot entry");
        let boot = boot_entry::write(
            system,
            root,
            kernel.value(),
            &base.identifiers,
            config,
            &driver.kernel_args(),
        )
        .instrument(tracing::info_span!("boot-entry"))
        .await?;

        Ok(ProvisionReport {
            names: self.names,
            mapped,
            mounts,
            swap,
            base,
            kernel,
            driver,
            boot,
        })
    }
}

/// Unclassified errors of a destructive stage are provisioning errors.
fn provisioning(error: anyhow::Error) -> anyhow::Error {
    match crate::error::failure_class_of(&error) {
        Some(_) => error,
        None => error.context(FailureClass::Provisioning),
    }
}
