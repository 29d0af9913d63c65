use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::build::CLAP_LONG_VERSION;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: ForgeSubcommand,

    /// Path to an env file with `KEY=VALUE` overrides. Applied before the `CRYPTFORGE_*` variables of the process environment.
    #[clap(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Log at debug level and pass verbose flags to the external tools.
    #[clap(long, short = 'v', global = true, default_value = "false")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum ForgeSubcommand {
    /// Wipe the configured disk and provision an encrypted system onto it.
    #[command(name = "install")]
    Install(InstallOptions),

    /// Show the partition plan, the subvolume layout and the mount order.
    #[command(name = "show")]
    Show,

    /// Inspect the resolved configuration.
    #[command(name = "config")]
    Config(ConfigOptions),
}

#[derive(Parser, Debug)]
pub struct InstallOptions {
    /// Answer the confirmation prompt up front. Must be exactly `YES`.
    #[clap(long)]
    pub confirm: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ConfigOptions {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the resolved configuration as TOML. The passphrase is never printed.
    #[command(name = "dump")]
    Dump,

    /// Validate the configuration without touching any device.
    #[command(name = "check")]
    Check,
}
