//! Config resolution and sessions-client selection shared by all commands.

use std::path::{Path, PathBuf};

use hwlink_runtime::sessions::is_running;
use hwlink_runtime::{BackendKind, Endpoint, SessionsClient, Transport, TransportConfig};
use tracing::debug;

use crate::cli::Cli;
use crate::error::Result;

/// Everything a command needs besides its own arguments.
#[derive(Debug, Clone)]
pub struct CommandContext {
	pub config: TransportConfig,
	pub endpoint: Endpoint,
	pub use_daemon: bool,
}

impl CommandContext {
	pub fn from_cli(cli: &Cli) -> Result<Self> {
		Ok(Self {
			config: resolve_config(cli.config.as_deref(), default_config_path().as_deref(), &cli.transports)?,
			endpoint: Endpoint::default_for_user(),
			use_daemon: !cli.no_daemon,
		})
	}

	/// Arbitration through the daemon when one answers, in-process otherwise.
	pub async fn sessions(&self) -> SessionsClient {
		let owner = caller_token();
		if self.use_daemon && is_running(&self.endpoint).await {
			debug!(target = "hwlink.cli", endpoint = %self.endpoint, "using sessions daemon");
			SessionsClient::ipc(self.endpoint.clone(), owner)
		} else {
			SessionsClient::local(owner)
		}
	}

	pub async fn transport(&self) -> Result<Transport> {
		let sessions = self.sessions().await;
		Ok(Transport::init(self.config.clone(), sessions).await?)
	}
}

/// `$XDG_CONFIG_HOME/hwlink/config.json` (platform equivalent elsewhere).
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("hwlink").join("config.json"))
}

/// An explicit file must exist; the default one is optional.
fn resolve_config(explicit: Option<&Path>, fallback: Option<&Path>, transports: &[BackendKind]) -> Result<TransportConfig> {
	let config = match (explicit, fallback) {
		(Some(path), _) => TransportConfig::load(path)?,
		(None, Some(path)) if path.exists() => TransportConfig::load(path)?,
		_ => TransportConfig::default(),
	};

	if transports.is_empty() {
		return Ok(config);
	}
	let config = config.with_transports(transports.to_vec());
	config.validate()?;
	Ok(config)
}

fn caller_token() -> String {
	format!("hwlink-cli:{}", std::process::id())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::CliError;

	#[test]
	fn defaults_without_any_file() {
		let dir = tempfile::tempdir().unwrap();
		let config = resolve_config(None, Some(dir.path().join("missing.json").as_path()), &[]).unwrap();
		assert_eq!(config, TransportConfig::default());
	}

	#[test]
	fn reads_default_file_when_present() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		std::fs::write(&path, r#"{"transports": ["emulator"], "callTimeoutMs": 1500}"#).unwrap();

		let config = resolve_config(None, Some(path.as_path()), &[]).unwrap();
		assert_eq!(config.transports, vec![BackendKind::Emulator]);
		assert_eq!(config.call_timeout_ms, Some(1500));
	}

	#[test]
	fn transport_flags_override_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		std::fs::write(&path, r#"{"transports": ["bridge"], "listenIntervalMs": 250}"#).unwrap();

		let config = resolve_config(Some(path.as_path()), None, &[BackendKind::Emulator, BackendKind::Usb]).unwrap();
		assert_eq!(config.transports, vec![BackendKind::Emulator, BackendKind::Usb]);
		assert_eq!(config.listen_interval_ms, 250);
	}

	#[test]
	fn explicit_file_must_exist() {
		let dir = tempfile::tempdir().unwrap();
		let err = resolve_config(Some(dir.path().join("nope.json").as_path()), None, &[]).unwrap_err();
		assert_eq!(err.code(), "invalid_config");
	}

	#[test]
	fn invalid_file_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		std::fs::write(&path, r#"{"chunkSize": 4}"#).unwrap();
		assert!(matches!(resolve_config(Some(path.as_path()), None, &[]), Err(CliError::Runtime(_))));
	}
}
