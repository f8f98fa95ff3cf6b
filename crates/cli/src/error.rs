use thiserror::Error;

use crate::output::CommandError;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("daemon: {0}")]
	Daemon(String),

	#[error(transparent)]
	Runtime(#[from] hwlink_runtime::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

impl CliError {
	/// Stable code: runtime errors keep their own, CLI failures get theirs.
	pub fn code(&self) -> &str {
		match self {
			CliError::InvalidInput(_) => "invalid_input",
			CliError::Daemon(_) => "daemon_error",
			CliError::Runtime(err) => err.code(),
			CliError::Io(_) => "io_error",
			CliError::Json(_) => "json_error",
			CliError::Anyhow(_) => "internal_error",
		}
	}

	pub fn to_command_error(&self) -> CommandError {
		CommandError {
			code: self.code().to_string(),
			message: self.to_string(),
			recoverable: matches!(self, CliError::Runtime(err) if err.is_recoverable()),
		}
	}
}
