
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hwlink_runtime::BackendKind;

/// Root CLI for hwlink.
#[derive(Parser, Debug)]
#[command(name = "hwlink")]
#[command(about = "Exclusive-session access to hardware wallets over USB, bridge or emulator")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Transport configuration file (JSON)
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Backends to try, in order (overrides the configured list)
	#[arg(long = "transport", global = true, value_name = "KIND")]
	pub transports: Vec<BackendKind>,

	/// Arbitrate in-process even when a sessions daemon is running
	#[arg(long, global = true)]
	pub no_daemon: bool,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// List connected devices and the sessions holding them.
	Enumerate,
	/// Stream device events as NDJSON until interrupted.
	Listen,
	/// Acquire a device, exchange one message, release it.
	Call(CallArgs),
	/// Show which caller holds which device.
	Sessions,
	/// Manage the shared sessions daemon.
	Daemon(DaemonArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CallArgs {
	/// Device path as reported by `enumerate`.
	#[arg(long, value_name = "PATH")]
	pub path: String,

	/// Message type number.
	#[arg(long = "type", value_name = "N")]
	pub message_type: u16,

	/// Payload as hex.
	#[arg(long, value_name = "HEX", default_value = "")]
	pub payload: String,

	/// Session held before, for handoff.
	#[arg(long, value_name = "SESSION")]
	pub previous: Option<String>,

	/// Bound on the exchange in milliseconds.
	#[arg(long, value_name = "MS")]
	pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct DaemonArgs {
	#[command(subcommand)]
	pub action: DaemonAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DaemonAction {
	Start {
		#[arg(long)]
		foreground: bool,
	},
	Stop,
	Status,
}

impl Commands {
	/// Name used in the output envelope.
	pub fn name(&self) -> &'static str {
		match self {
			Commands::Enumerate => "enumerate",
			Commands::Listen => "listen",
			Commands::Call(_) => "call",
			Commands::Sessions => "sessions",
			Commands::Daemon(args) => match args.action {
				DaemonAction::Start { .. } => "daemon start",
				DaemonAction::Stop => "daemon stop",
				DaemonAction::Status => "daemon status",
			},
		}
	}
}
