//! Structured output envelope for all CLI commands.
//!
//! Every command prints one result envelope on stdout:
//!
//! ```json
//! { "ok": true, "command": "enumerate", "data": [ ... ] }
//! ```
//!
//! On failure:
//!
//! ```json
//! { "ok": false, "command": "call", "error": { "code": "device_used_elsewhere", "message": "...", "recoverable": true } }
//! ```
//!
//! `listen` streams one compact JSON event per line instead.


use std::io::{self, Write};

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
	pub ok: bool,

	/// Command name (e.g. "enumerate", "daemon status")
	pub command: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,
}

/// Error information for failed commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
	/// snake_case code, shared with the runtime's error codes
	pub code: String,
	pub message: String,
	/// Whether retrying the same command can succeed without user action.
	#[serde(default)]
	pub recoverable: bool,
}

pub struct ResultBuilder<T: Serialize> {
	command: String,
	data: Option<T>,
	error: Option<CommandError>,
}

impl<T: Serialize> ResultBuilder<T> {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			data: None,
			error: None,
		}
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	pub fn error(mut self, error: CommandError) -> Self {
		self.error = Some(error);
		self
	}

	pub fn build(self) -> CommandResult<T> {
		CommandResult {
			ok: self.error.is_none(),
			command: self.command,
			data: self.data,
			error: self.error,
		}
	}
}

/// Prints a result envelope as pretty JSON.
pub fn print_result<T: Serialize>(result: &CommandResult<T>) {
	let rendered = serde_json::to_string_pretty(result).unwrap_or_else(|e| format!(r#"{{"ok":false,"error":{{"code":"json_error","message":"{e}"}}}}"#));
	let mut stdout = io::stdout().lock();
	let _ = writeln!(stdout, "{rendered}");
	let _ = stdout.flush();
}

/// Prints one NDJSON line and flushes, so pipes see events as they happen.
pub fn print_line<T: Serialize>(value: &T) -> io::Result<()> {
	let mut stdout = io::stdout().lock();
	serde_json::to_writer(&mut stdout, value)?;
	writeln!(stdout)?;
	stdout.flush()
}

pub fn print_error_stderr(error: &CommandError) {
	eprintln!("error[{}]: {}", error.code, error.message);
}
