pub mod config;
pub mod install;
pub mod show;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    cli::{Cli, ConfigOptions, ForgeSubcommand},
    config::source::sources_for,
};
use config::ConfigCommand;
use install::InstallCommand;
use show::ShowCommand;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for Cli {
    fn into_command(self) -> Box<dyn Command> {
        let sources = sources_for(self.env_file.as_deref());
        match self.command {
            ForgeSubcommand::Install(install_options) => Box::new(InstallCommand {
                install_options,
                sources,
            }),
            ForgeSubcommand::Show => Box::new(ShowCommand { sources }),
            ForgeSubcommand::Config(ConfigOptions { command }) => {
                Box::new(ConfigCommand { command, sources })
            }
        }
    }
}
