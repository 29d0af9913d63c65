use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::{
    cli::ConfigSubcommand,
    config::{
        source::{load_config, ConfigSource},
        InstallConfig,
    },
    error::{Classify as _, FailureClass},
    provision::{naming::DeviceNameSet, partition::PartitionPlan},
};

pub struct ConfigCommand {
    pub command: ConfigSubcommand,
    pub sources: Vec<Box<dyn ConfigSource>>,
}

#[async_trait]
impl crate::cmd::Command for ConfigCommand {
    async fn run(&self) -> Result<()> {
        for source in &self.sources {
            tracing::debug!("Load config from {}", source.source_debug_string());
        }
        let config = load_config(&self.sources).await?;

        match self.command {
            ConfigSubcommand::Dump => println!("{}", dump(&config)?),
            ConfigSubcommand::Check => {
                check(&config)?;
                tracing::info!("Configuration for {:?} is valid", config.disk);
            }
        }
        Ok(())
    }
}

pub fn dump(config: &InstallConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration")
}

/// Everything that can be derived from the configuration alone, without looking at the host.
pub fn check(config: &InstallConfig) -> Result<()> {
    config.validate().classify(FailureClass::Configuration)?;
    let names = DeviceNameSet::resolve(&config.disk)?;
    PartitionPlan::standard(config.boot_size)?;
    tracing::debug!(
        "Partitions will be {:?} and {:?}",
        names.boot,
        names.payload
    );
    Ok(())
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::error::failure_class_of;

    #[test]
    fn test_dump_is_toml() -> Result<()> {
        let dumped = dump(&InstallConfig::default())?;
        assert!(dumped.contains("disk = \"/dev/nvme0n1\""));
        assert!(dumped.contains("[luks]"));
        Ok(())
    }

    #[test]
    fn test_check_rejects_bad_disk_path() {
        let mut config = InstallConfig::default();
        config.disk = "/dev/nvme0n1/".into();
        let error = check(&config).unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Configuration));
    }

    #[test]
    fn test_check_accepts_defaults() -> Result<()> {
        check(&InstallConfig::default())
    }
}
