#![deny(clippy::disallowed_methods)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod fs;
pub mod provision;
pub mod system;
pub mod types;

use anyhow::{Context, Result};
use clap::Parser as _;
use cmd::IntoCommand as _;
use shadow_rs::shadow;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

shadow!(build);

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    crate::fs::set_verbose(tracing::enabled!(target: "cryptforge", tracing::Level::DEBUG)).await;

    let args = cli::Cli::parse();

    if args.verbose {
        reload_handle
            .modify(|filter| {
                *filter = tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into())
            })
            .context("Failed to update log level to DEBUG")?;
        crate::fs::set_verbose(true).await;

        tracing::debug!("Log level set to DEBUG");
    }

    tracing::debug!(
        "cryptforge version: v{}  commit: {}  buildtime: {}",
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );

    // Handle the command
    args.into_command().run().await?;

    Ok(())
}

/// A macro like scopeguard::defer! but can defer a future.
///
/// Other code running concurrently in the same task is suspended by the call to
/// block_in_place until the future is finished.
///
/// # Panics
///
/// Only usable from a tokio multi-thread runtime, panics on a `current_thread` one.
#[macro_export]
macro_rules! async_defer {
    ($future:expr) => {
        scopeguard::defer! {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = $future.await;
                });
            });
        }
    };
}
