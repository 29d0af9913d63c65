use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use dialoguer::{console::Term, Input, Password};

use crate::{
    cli::InstallOptions,
    config::{
        source::{load_config, ConfigSource},
        InstallConfig,
    },
    error::{Classify as _, FailureClass},
    provision::{
        preflight::preflight, Confirmation, ProvisionContext, ProvisionReport, CONFIRMATION_TOKEN,
    },
    system::host::HostSystem,
    types::Passphrase,
};

use super::show::{degradation_table, print_plan};

pub struct InstallCommand {
    pub install_options: InstallOptions,
    pub sources: Vec<Box<dyn ConfigSource>>,
}

#[async_trait]
impl crate::cmd::Command for InstallCommand {
    async fn run(&self) -> Result<()> {
        let mut config = load_config(&self.sources).await?;
        let system = HostSystem;

        let names = preflight(&system, &config).await?;
        print_plan(&system, &config, &names)?;

        let confirmation = match &self.install_options.confirm {
            Some(token) => Confirmation::check(token)?,
            None => ask_confirmation(&config)?,
        };
        let passphrase = match config.passphrase.take() {
            Some(passphrase) => passphrase,
            None => ask_passphrase(&config)?,
        };

        let context = ProvisionContext::new(&system, &config, names, passphrase);
        let report = tokio::select! {
            report = context.run(confirmation) => report?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for the interrupt signal")?;
                return Err(anyhow!(
                    "Interrupted, {:?} is left in an intermediate state. Nothing was rolled back, run the installation again from the start to recover",
                    config.disk
                )
                .context(FailureClass::Cancelled));
            }
        };

        summarize(&config, &report);
        Ok(())
    }
}

fn ensure_terminal() -> Result<()> {
    if !Term::stderr().is_term() {
        bail!("Standard error is not a terminal. Please use '--confirm {CONFIRMATION_TOKEN}' and LUKS_PASSPHRASE in non-interactive mode.");
    }
    Ok(())
}

fn ask_confirmation(config: &InstallConfig) -> Result<Confirmation> {
    ensure_terminal().classify(FailureClass::Configuration)?;

    let input: String = Input::new()
        .with_prompt(format!(
            "All of the data on {:?} will be lost. Type {CONFIRMATION_TOKEN} to continue",
            config.disk
        ))
        .allow_empty(true)
        .interact_text()?;
    Confirmation::check(&input)
}

fn ask_passphrase(config: &InstallConfig) -> Result<Passphrase> {
    ensure_terminal().classify(FailureClass::Configuration)?;

    let passphrase = Password::new()
        .with_prompt(format!("Passphrase for {}", config.mapped_name))
        .with_confirmation("Repeat passphrase", "Passphrases do not match")
        .interact()?;
    Ok(Passphrase::from(passphrase))
}

fn summarize(config: &InstallConfig, report: &ProvisionReport) {
    let kernel = report.kernel.value();
    tracing::info!(
        "Installed kernel {} ({:?}) into {:?}",
        kernel.release,
        kernel.source,
        config.target_root
    );
    tracing::info!(
        "Boot entry written to {:?}, {} mounts left in place below {:?}",
        report.boot.entry_file,
        report.mounts.len(),
        config.target_root
    );

    let degradations = report.degradations();
    if degradations.is_empty() {
        tracing::info!("Every component was installed as configured");
    } else {
        tracing::warn!(
            "{} optional component(s) fell back or were skipped, the system is still bootable",
            degradations.len()
        );
        println!("{}", degradation_table(&degradations));
    }
    if !report.base.unavailable_packages.is_empty() {
        tracing::warn!(
            "Unavailable optional packages: {}",
            report.base.unavailable_packages.join(" ")
        );
    }
}
