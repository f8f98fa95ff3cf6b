//! Local bridge daemon spoken to over HTTP.
//!
//! The bridge moves whole messages, not chunks: written chunks are
//! reassembled and posted once complete, and a read message is re-chunked
//! so the transport sees the same stream as on a raw link.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use hwlink_protocol::{ChunkCodec, Decoder, DeviceDescriptor, DevicePath, Message, SessionId};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN};
use serde::Deserialize;
use tracing::{debug, trace};

use super::{Api, with_timeout};
use crate::config::BackendKind;
use crate::error::IoError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BridgeBackend {
	client: reqwest::Client,
	base: String,
	codec: ChunkCodec,
}

/// A session held at the bridge, plus chunk buffers in both directions.
pub struct BridgeHandle {
	path: DevicePath,
	session: String,
	outbound: Mutex<Decoder>,
	inbound: Mutex<VecDeque<Vec<u8>>>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
	version: String,
}

#[derive(Debug, Deserialize)]
struct AcquireInfo {
	session: String,
}

#[derive(Debug, Deserialize)]
struct BridgeFailure {
	error: String,
}

impl BridgeBackend {
	pub fn new(base: &str, origin: &str, codec: ChunkCodec) -> Result<Self, IoError> {
		let mut headers = HeaderMap::new();
		let origin = HeaderValue::from_str(origin).map_err(|e| IoError::Other(format!("invalid origin header: {e}")))?;
		headers.insert(ORIGIN, origin);

		let client = reqwest::Client::builder()
			.default_headers(headers)
			.build()
			.map_err(|e| IoError::Other(format!("cannot build http client: {e}")))?;

		Ok(Self {
			client,
			base: base.trim_end_matches('/').to_string(),
			codec,
		})
	}

	/// POSTs to `route` and returns the response body.
	async fn post(&self, route: &str, body: Option<String>, timeout: Option<Duration>) -> Result<String, IoError> {
		let url = format!("{}{}", self.base, route);
		trace!(target = "hwlink.backend", %url, "bridge request");

		with_timeout(timeout, async {
			let mut request = self.client.post(&url);
			if let Some(body) = body {
				request = request.body(body);
			}
			let response = request.send().await.map_err(request_error)?;
			let status = response.status();
			let text = response.text().await.map_err(request_error)?;
			if status.is_success() {
				Ok(text)
			} else {
				Err(bridge_error(&text))
			}
		})
		.await
	}

	/// Acquires `path` at the bridge, displacing the bridge session `previous` if it still holds it.
	async fn claim(&self, path: &DevicePath, previous: Option<&SessionId>) -> Result<BridgeHandle, IoError> {
		let previous = previous.map_or("null", SessionId::as_str);
		let body = self.post(&format!("/acquire/{path}/{previous}"), None, Some(PROBE_TIMEOUT)).await?;
		let info: AcquireInfo = serde_json::from_str(&body).map_err(|e| IoError::Other(format!("bad bridge acquire reply: {e}")))?;
		debug!(target = "hwlink.backend", %path, %previous, bridge_session = %info.session, "bridge session opened");

		Ok(BridgeHandle {
			path: path.clone(),
			session: info.session,
			outbound: Mutex::new(self.codec.decoder()),
			inbound: Mutex::new(VecDeque::new()),
		})
	}

	pub async fn version(&self) -> Result<String, IoError> {
		let body = self.post("/", None, Some(PROBE_TIMEOUT)).await?;
		let info: VersionInfo = serde_json::from_str(&body).map_err(|e| IoError::Other(format!("bad bridge version reply: {e}")))?;
		Ok(info.version)
	}
}

fn request_error(err: reqwest::Error) -> IoError {
	if err.is_connect() {
		IoError::NetworkUnreachable(err.to_string())
	} else if err.is_timeout() {
		IoError::Timeout
	} else {
		IoError::Other(err.to_string())
	}
}

/// Maps a bridge `{"error": ...}` body onto an [`IoError`].
pub(crate) fn bridge_error(body: &str) -> IoError {
	let message = serde_json::from_str::<BridgeFailure>(body).map(|f| f.error).unwrap_or_else(|_| body.trim().to_string());
	let lower = message.to_ascii_lowercase();
	if lower.contains("wrong previous session") || lower.contains("other call in progress") {
		IoError::DeviceBusy(message)
	} else if lower.contains("device not found") || lower.contains("session not found") || lower.contains("closed device") {
		IoError::Disconnected
	} else {
		IoError::Other(message)
	}
}

#[async_trait]
impl Api for BridgeBackend {
	type Handle = BridgeHandle;

	fn kind(&self) -> BackendKind {
		BackendKind::Bridge
	}

	async fn probe(&self) -> Result<(), IoError> {
		let version = self.version().await?;
		debug!(target = "hwlink.backend", %version, base = %self.base, "bridge detected");
		Ok(())
	}

	async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, IoError> {
		let body = self.post("/enumerate", None, Some(PROBE_TIMEOUT)).await?;
		let descriptors: Vec<DeviceDescriptor> = serde_json::from_str(&body).map_err(|e| IoError::Other(format!("bad bridge enumerate reply: {e}")))?;
		Ok(descriptors.into_iter().filter(|d| !d.debug).collect())
	}

	async fn open(&self, path: &DevicePath) -> Result<BridgeHandle, IoError> {
		self.claim(path, None).await
	}

	/// The bridge still holds the replaced holder's session; pass it as `previous`.
	async fn take_over(&self, path: &DevicePath) -> Result<BridgeHandle, IoError> {
		let held = self.enumerate().await?.into_iter().find(|d| d.path == *path).and_then(|d| d.session);
		self.claim(path, held.as_ref()).await
	}

	async fn write_chunk(&self, handle: &BridgeHandle, chunk: &[u8]) -> Result<(), IoError> {
		let complete = handle.outbound.lock().push(chunk).map_err(|e| IoError::Other(e.to_string()))?;
		let Some(message) = complete else {
			return Ok(());
		};

		let body = message.to_bridge_hex().map_err(|e| IoError::Other(e.to_string()))?;
		self.post(&format!("/post/{}", handle.session), Some(body), None).await?;
		trace!(target = "hwlink.backend", path = %handle.path, message_type = message.message_type, "bridge message posted");
		Ok(())
	}

	async fn read_chunk(&self, handle: &BridgeHandle, timeout: Option<Duration>) -> Result<Vec<u8>, IoError> {
		if let Some(chunk) = handle.inbound.lock().pop_front() {
			return Ok(chunk);
		}

		let body = self.post(&format!("/read/{}", handle.session), None, timeout).await?;
		let message = Message::from_bridge_hex(body.trim()).map_err(|e| IoError::Other(e.to_string()))?;
		let chunks = self.codec.encode_message(&message).map_err(|e| IoError::Other(e.to_string()))?;

		let mut inbound = handle.inbound.lock();
		inbound.extend(chunks.into_iter().map(|c| c.into_vec()));
		inbound.pop_front().ok_or_else(|| IoError::Other("bridge returned no data".into()))
	}

	async fn close(&self, handle: &BridgeHandle) -> Result<(), IoError> {
		handle.outbound.lock().reset();
		handle.inbound.lock().clear();
		match self.post(&format!("/release/{}", handle.session), None, Some(PROBE_TIMEOUT)).await {
			Ok(_) | Err(IoError::Disconnected) => Ok(()),
			Err(err) => Err(err),
		}
	}
}
