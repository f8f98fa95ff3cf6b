//! Transport configuration.
//!
//! Immutable once handed to [`crate::Transport::init`]; a new configuration
//! means a new transport.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use hwlink_protocol::chunk::MIN_CHUNK_SIZE;
use hwlink_protocol::{CHUNK_SIZE, ChunkCodec, DEFAULT_MAX_MESSAGE_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:21325";
pub const DEFAULT_BRIDGE_ORIGIN: &str = "https://hwlink.local";
pub const DEFAULT_EMULATOR_ADDR: &str = "127.0.0.1:21324";

const MAX_CHUNK_SIZE: usize = 4096;

/// Channel kinds a transport can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
	/// Direct USB access.
	Usb,
	/// Local bridge daemon over HTTP.
	Bridge,
	/// Device emulator over UDP.
	Emulator,
}

impl fmt::Display for BackendKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			BackendKind::Usb => "usb",
			BackendKind::Bridge => "bridge",
			BackendKind::Emulator => "emulator",
		};
		f.write_str(name)
	}
}

impl FromStr for BackendKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.to_ascii_lowercase().as_str() {
			"usb" | "webusb" => Ok(BackendKind::Usb),
			"bridge" => Ok(BackendKind::Bridge),
			"emulator" | "udp" => Ok(BackendKind::Emulator),
			other => Err(Error::InvalidConfig(format!("unknown transport '{other}'"))),
		}
	}
}

/// Host environment; decides which backends are eligible at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
	#[default]
	Node,
	Web,
	Webextension,
	Electron,
	ReactNative,
}

impl Environment {
	pub fn allows(self, kind: BackendKind) -> bool {
		match self {
			Environment::Node | Environment::Electron => true,
			Environment::Web | Environment::Webextension => matches!(kind, BackendKind::Usb | BackendKind::Bridge),
			Environment::ReactNative => kind == BackendKind::Usb,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
	/// Backends to try, in priority order.
	pub transports: Vec<BackendKind>,
	/// Keep listening through failed enumerations instead of stopping.
	pub transport_reconnect: bool,
	/// Emit `device-connect` for devices already present when listening starts.
	pub pending_transport_event: bool,
	/// Base URL of the bridge daemon.
	pub bridge_url: String,
	/// `Origin` header sent to the bridge daemon.
	pub bridge_origin: String,
	/// UDP address of the emulator.
	pub emulator_addr: SocketAddr,
	pub environment: Environment,
	/// Default bound for a whole `call` when the caller gives none.
	pub call_timeout_ms: Option<u64>,
	/// Enumeration polling interval while listening.
	pub listen_interval_ms: u64,
	/// Wire chunk size for USB and emulator links.
	pub chunk_size: usize,
	/// Largest payload accepted from a device.
	pub max_message_len: u32,
}

impl Default for TransportConfig {
	fn default() -> Self {
		Self {
			transports: vec![BackendKind::Bridge, BackendKind::Usb],
			transport_reconnect: true,
			pending_transport_event: true,
			bridge_url: DEFAULT_BRIDGE_URL.to_string(),
			bridge_origin: DEFAULT_BRIDGE_ORIGIN.to_string(),
			emulator_addr: SocketAddr::from(([127, 0, 0, 1], 21324)),
			environment: Environment::default(),
			call_timeout_ms: None,
			listen_interval_ms: 1000,
			chunk_size: CHUNK_SIZE,
			max_message_len: DEFAULT_MAX_MESSAGE_LEN,
		}
	}
}

impl TransportConfig {
	/// Reads a JSON configuration file. Missing keys take their defaults.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;
		let config: Self = serde_json::from_str(&content).map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
		config.validate()?;
		Ok(config)
	}

	pub fn with_transports(mut self, transports: Vec<BackendKind>) -> Self {
		self.transports = transports;
		self
	}

	/// Rejects settings no transport could be built from.
	pub fn validate(&self) -> Result<()> {
		if self.transports.is_empty() {
			return Err(Error::InvalidConfig("transports must not be empty".into()));
		}
		if self.eligible_transports().is_empty() {
			return Err(Error::InvalidConfig(format!(
				"none of the configured transports is available in the {:?} environment",
				self.environment
			)));
		}
		reqwest::Url::parse(&self.bridge_url).map_err(|e| Error::InvalidConfig(format!("bridge url '{}': {e}", self.bridge_url)))?;
		if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
			return Err(Error::InvalidConfig(format!(
				"chunk size {} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}",
				self.chunk_size
			)));
		}
		if self.listen_interval_ms == 0 {
			return Err(Error::InvalidConfig("listen interval must be positive".into()));
		}
		if self.call_timeout_ms == Some(0) {
			return Err(Error::InvalidConfig("call timeout must be positive".into()));
		}
		Ok(())
	}

	/// Configured backends allowed by the environment, order and duplicates preserved as given.
	pub fn eligible_transports(&self) -> Vec<BackendKind> {
		let mut out = Vec::with_capacity(self.transports.len());
		for kind in &self.transports {
			if self.environment.allows(*kind) && !out.contains(kind) {
				out.push(*kind);
			}
		}
		out
	}

	pub fn call_timeout(&self) -> Option<Duration> {
		self.call_timeout_ms.map(Duration::from_millis)
	}

	pub fn listen_interval(&self) -> Duration {
		Duration::from_millis(self.listen_interval_ms)
	}

	pub fn codec(&self) -> ChunkCodec {
		ChunkCodec::new(self.chunk_size).with_max_message_len(self.max_message_len)
	}
}
