#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use hwlink_runtime::sessions::is_running;
use hwlink_runtime::{Endpoint, SessionsBackground, SessionsClient, SessionsServer};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::shutdown_signal;
use crate::error::{CliError, Result};
use crate::output::{ResultBuilder, print_result};

const STARTUP_POLLS: u32 = 40;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// PID file for a daemon started in the background.
#[cfg(unix)]
fn daemon_pid_path() -> PathBuf {
	if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
		return PathBuf::from(xdg_runtime).join("hwlink-daemon.pid");
	}
	std::env::temp_dir().join("hwlink-daemon.pid")
}

#[cfg(unix)]
fn read_pid_file(path: &std::path::Path) -> Option<u32> {
	std::fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()
}

pub async fn start(endpoint: &Endpoint, foreground: bool) -> Result<()> {
	if foreground {
		return run_foreground(endpoint).await;
	}

	#[cfg(not(unix))]
	{
		let _ = endpoint;
		return Err(CliError::Daemon("background mode is only available on unix; use --foreground".to_string()));
	}

	#[cfg(unix)]
	{
		let pid_path = daemon_pid_path();
		if is_running(endpoint).await {
			let result = ResultBuilder::new("daemon start")
				.data(json!({
					"started": false,
					"alreadyRunning": true,
					"endpoint": endpoint.to_string(),
					"pid": read_pid_file(&pid_path),
				}))
				.build();
			print_result(&result);
			return Ok(());
		}

		// Re-exec instead of forking; the tokio runtime does not survive a fork.
		let exe = std::env::current_exe().map_err(|e| CliError::Anyhow(anyhow!("Failed to get executable path: {e}")))?;
		let mut child = std::process::Command::new(&exe)
			.args(["daemon", "start", "--foreground"])
			.stdin(std::process::Stdio::null())
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null())
			.spawn()
			.map_err(|e| CliError::Anyhow(anyhow!("Failed to spawn daemon: {e}")))?;

		let mut running = false;
		for _ in 0..STARTUP_POLLS {
			tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
			if is_running(endpoint).await {
				running = true;
				break;
			}
			if child.try_wait()?.is_some() {
				break;
			}
		}
		if !running {
			return Err(CliError::Daemon(format!("daemon failed to start on {endpoint}")));
		}

		if let Some(parent) = pid_path.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		std::fs::write(&pid_path, child.id().to_string())?;

		let result = ResultBuilder::new("daemon start")
			.data(json!({
				"started": true,
				"foreground": false,
				"endpoint": endpoint.to_string(),
				"pid": child.id(),
			}))
			.build();
		print_result(&result);
		Ok(())
	}
}

/// Hosts the sessions background on `endpoint` until a signal or a `daemon stop`.
async fn run_foreground(endpoint: &Endpoint) -> Result<()> {
	if is_running(endpoint).await {
		return Err(CliError::Daemon(format!("already running on {endpoint}; use `hwlink daemon status` or `hwlink daemon stop`")));
	}

	let handle = SessionsBackground::spawn();
	let server = SessionsServer::bind(endpoint, handle).await?;
	let bound = server.local_endpoint();

	let shutdown = CancellationToken::new();
	let signals = {
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			let _ = shutdown_signal().await;
			shutdown.cancel();
		})
	};

	print_result(
		&ResultBuilder::new("daemon start")
			.data(json!({
				"started": true,
				"foreground": true,
				"endpoint": bound.to_string(),
			}))
			.build(),
	);

	let result = server.run(shutdown).await;
	signals.abort();
	info!(target = "hwlink.daemon", "sessions daemon stopped");
	Ok(result?)
}

pub async fn stop(endpoint: &Endpoint) -> Result<()> {
	if !is_running(endpoint).await {
		let result = ResultBuilder::new("daemon stop")
			.data(json!({
				"stopped": false,
				"message": "daemon not running",
			}))
			.build();
		print_result(&result);
		return Ok(());
	}

	SessionsClient::ipc(endpoint.clone(), "hwlink-cli").shutdown().await?;
	#[cfg(unix)]
	{
		let _ = std::fs::remove_file(daemon_pid_path());
	}

	print_result(&ResultBuilder::new("daemon stop").data(json!({ "stopped": true })).build());
	Ok(())
}

pub async fn status(endpoint: &Endpoint) -> Result<()> {
	if !is_running(endpoint).await {
		let result = ResultBuilder::new("daemon status")
			.data(json!({
				"running": false,
				"endpoint": endpoint.to_string(),
				"message": "daemon not running",
			}))
			.build();
		print_result(&result);
		return Ok(());
	}

	let client = SessionsClient::ipc(endpoint.clone(), "hwlink-cli");
	let version = client.handshake().await?;
	let sessions = client.sessions_info().await?;
	let result = ResultBuilder::new("daemon status")
		.data(json!({
			"running": true,
			"endpoint": endpoint.to_string(),
			"version": version,
			"sessions": sessions,
		}))
		.build();
	print_result(&result);
	Ok(())
}
