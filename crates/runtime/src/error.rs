//! Error types for the hwlink runtime.

use std::time::Duration;

use hwlink_protocol::{CodecError, DevicePath, SessionId};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Raw device I/O failures reported by a backend.
///
/// Backends map their native failures onto these; the transport facade
/// normalizes them further into [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
	/// The device or its link went away mid-operation.
	#[error("device disconnected")]
	Disconnected,

	/// The OS refused access. Not auto-retried: needs user or OS action.
	#[error("permission denied: {0}")]
	PermissionDenied(String),

	/// The device is claimed at OS level or by another bridge client.
	#[error("device busy: {0}")]
	DeviceBusy(String),

	/// A single read did not complete in time.
	#[error("I/O timed out")]
	Timeout,

	/// A network-attached backend (bridge, emulator) cannot be reached.
	#[error("network unreachable: {0}")]
	NetworkUnreachable(String),

	#[error("I/O error: {0}")]
	Other(String),
}

impl From<std::io::Error> for IoError {
	fn from(err: std::io::Error) -> Self {
		use std::io::ErrorKind;

		match err.kind() {
			ErrorKind::NotFound | ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => IoError::Disconnected,
			ErrorKind::PermissionDenied => IoError::PermissionDenied(err.to_string()),
			ErrorKind::ResourceBusy | ErrorKind::AddrInUse => IoError::DeviceBusy(err.to_string()),
			ErrorKind::TimedOut | ErrorKind::WouldBlock => IoError::Timeout,
			ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
				IoError::NetworkUnreachable(err.to_string())
			}
			_ => IoError::Other(err.to_string()),
		}
	}
}

/// Errors surfaced to transport callers.
#[derive(Debug, Error)]
pub enum Error {
	/// The path is not currently enumerated, or vanished mid-exchange.
	#[error("device disconnected: {path}")]
	DeviceDisconnected { path: DevicePath },

	/// Another caller holds the device and no matching previous session was given.
	#[error("device {path} is used by another application")]
	DeviceUsedElsewhere { path: DevicePath },

	/// The session id is unknown or already released.
	#[error("session not found: {session}")]
	SessionNotFound { session: SessionId },

	/// Another exchange is in flight on this session.
	#[error("session {session} is busy with another call")]
	SessionBusy { session: SessionId },

	/// The session was degraded and must be released or re-acquired.
	#[error("session {session} needs to be re-acquired: {reason}")]
	NeedsReacquire { session: SessionId, reason: String },

	/// The exchange did not complete in time.
	#[error("response timeout after {timeout_ms}ms")]
	ResponseTimeout { timeout_ms: u64 },

	/// The caller cancelled the exchange.
	#[error("call aborted")]
	Aborted,

	/// Every configured backend failed its probe.
	#[error("no transport available: {}", attempts.join("; "))]
	NoTransportAvailable { attempts: Vec<String> },

	/// No backend responded to enumeration.
	#[error("transport not detected")]
	TransportNotDetected,

	/// A configured network backend (e.g. the bridge daemon) cannot be reached.
	#[error("backend unreachable: {0}")]
	BackendUnreachable(String),

	/// Settings rejected at init.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// Framing failure; fatal for the session it happened on.
	#[error(transparent)]
	Codec(#[from] CodecError),

	#[error(transparent)]
	Io(#[from] IoError),

	/// The sessions background or an internal channel went away.
	#[error("channel closed unexpectedly")]
	ChannelClosed,

	/// Unexpected message shape from a peer.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	/// Error reported by the sessions daemon that has no local counterpart.
	#[error("{code}: {message}")]
	Remote { code: String, message: String },
}

impl Error {
	/// Stable snake_case identifier used on the IPC wire and in CLI output.
	pub fn code(&self) -> &str {
		match self {
			Error::DeviceDisconnected { .. } => "device_disconnected",
			Error::DeviceUsedElsewhere { .. } => "device_used_elsewhere",
			Error::SessionNotFound { .. } => "session_not_found",
			Error::SessionBusy { .. } => "session_busy",
			Error::NeedsReacquire { .. } => "needs_reacquire",
			Error::ResponseTimeout { .. } => "response_timeout",
			Error::Aborted => "aborted",
			Error::NoTransportAvailable { .. } => "no_transport_available",
			Error::TransportNotDetected => "transport_not_detected",
			Error::BackendUnreachable(_) => "backend_unreachable",
			Error::InvalidConfig(_) => "invalid_config",
			Error::Codec(CodecError::UnexpectedChunkBoundary) => "unexpected_chunk_boundary",
			Error::Codec(_) => "malformed_message",
			Error::Io(IoError::PermissionDenied(_)) => "permission_denied",
			Error::Io(_) => "io_error",
			Error::ChannelClosed => "channel_closed",
			Error::Protocol(_) => "protocol_error",
			Error::Json(_) => "json_error",
			Error::Remote { code, .. } => code,
		}
	}

	/// Maps a backend failure on `path` into the caller taxonomy.
	pub fn from_io(err: IoError, path: &DevicePath) -> Self {
		match err {
			IoError::Disconnected => Error::DeviceDisconnected { path: path.clone() },
			IoError::DeviceBusy(_) => Error::DeviceUsedElsewhere { path: path.clone() },
			IoError::NetworkUnreachable(msg) => Error::BackendUnreachable(msg),
			other => Error::Io(other),
		}
	}

	/// Rebuilds an error received over IPC from its code.
	///
	/// `path` and `session` are the ones named by the request that failed;
	/// codes with no local counterpart become [`Error::Remote`].
	pub fn from_code(code: &str, message: String, path: Option<&DevicePath>, session: Option<&SessionId>) -> Self {
		match (code, path, session) {
			("device_disconnected", Some(path), _) => Error::DeviceDisconnected { path: path.clone() },
			("device_used_elsewhere", Some(path), _) => Error::DeviceUsedElsewhere { path: path.clone() },
			("session_not_found", _, Some(session)) => Error::SessionNotFound { session: session.clone() },
			("session_busy", _, Some(session)) => Error::SessionBusy { session: session.clone() },
			("transport_not_detected", _, _) => Error::TransportNotDetected,
			("backend_unreachable", _, _) => Error::BackendUnreachable(message),
			("invalid_config", _, _) => Error::InvalidConfig(message),
			("channel_closed", _, _) => Error::ChannelClosed,
			("protocol_error", _, _) => Error::Protocol(message),
			_ => Error::Remote {
				code: code.to_string(),
				message,
			},
		}
	}

	pub(crate) fn timeout(timeout: Duration) -> Self {
		Error::ResponseTimeout {
			timeout_ms: timeout.as_millis() as u64,
		}
	}

	/// Returns true for ownership conflicts and stale sessions.
	pub fn is_arbitration(&self) -> bool {
		matches!(
			self,
			Error::DeviceUsedElsewhere { .. } | Error::DeviceDisconnected { .. } | Error::SessionNotFound { .. } | Error::SessionBusy { .. }
		)
	}

	/// Returns true when a caller may retry, possibly after re-enumerating and re-acquiring.
	///
	/// Configuration errors and permission failures need new settings or user action.
	pub fn is_recoverable(&self) -> bool {
		match self {
			Error::NoTransportAvailable { .. } | Error::InvalidConfig(_) | Error::Json(_) => false,
			Error::Io(IoError::PermissionDenied(_)) => false,
			_ => true,
		}
	}

	/// Returns true when the session the error occurred on can no longer be used.
	pub fn needs_reacquire(&self) -> bool {
		matches!(
			self,
			Error::NeedsReacquire { .. }
				| Error::ResponseTimeout { .. }
				| Error::Codec(_)
				| Error::SessionNotFound { .. }
				| Error::DeviceDisconnected { .. }
		)
	}

	/// Returns true if this is a timeout error.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::ResponseTimeout { .. } | Error::Io(IoError::Timeout))
	}
}
