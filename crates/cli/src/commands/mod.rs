mod call;
mod daemon;
mod enumerate;
mod listen;
mod sessions;

use anyhow::Context;
use hwlink_runtime::Endpoint;
use tracing::info;

use crate::cli::{Cli, Commands, DaemonAction};
use crate::context::CommandContext;
use crate::error::Result;

pub async fn dispatch(cli: Cli) -> Result<()> {
	// Daemon lifecycle does not depend on transport configuration.
	if let Commands::Daemon(args) = &cli.command {
		let endpoint = Endpoint::default_for_user();
		return match args.action {
			DaemonAction::Start { foreground } => daemon::start(&endpoint, foreground).await,
			DaemonAction::Stop => daemon::stop(&endpoint).await,
			DaemonAction::Status => daemon::status(&endpoint).await,
		};
	}

	let ctx = CommandContext::from_cli(&cli)?;
	match cli.command {
		Commands::Enumerate => enumerate::execute(&ctx).await,
		Commands::Listen => listen::execute(&ctx).await,
		Commands::Call(args) => call::execute(&ctx, args).await,
		Commands::Sessions => sessions::execute(&ctx).await,
		Commands::Daemon(_) => unreachable!("handled above"),
	}
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub(crate) async fn shutdown_signal() -> Result<()> {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
		let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
		tokio::select! {
			_ = sigterm.recv() => info!(target = "hwlink.cli", "received SIGTERM"),
			_ = sigint.recv() => info!(target = "hwlink.cli", "received SIGINT"),
		}
	}

	#[cfg(not(unix))]
	{
		tokio::signal::ctrl_c().await.context("Failed to install Ctrl+C handler")?;
		info!(target = "hwlink.cli", "received Ctrl+C");
	}

	Ok(())
}
