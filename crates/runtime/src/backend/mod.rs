//! Raw device I/O, one variant per channel kind.
//!
//! Every backend exposes the same chunk-level capability through [`Api`].
//! [`Backend`] is the closed set the transport is built from; it dispatches
//! to the concrete variant and pairs it with the matching [`DeviceHandle`].

pub(crate) mod bridge;
pub(crate) mod emulator;
pub(crate) mod usb;

#[cfg(test)]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
pub use bridge::{BridgeBackend, BridgeHandle};
pub use emulator::{EmulatorBackend, EmulatorHandle};
use hwlink_protocol::{DeviceDescriptor, DevicePath};
pub use usb::{UsbBackend, UsbHandle};

use crate::config::{BackendKind, TransportConfig};
use crate::error::IoError;

/// Chunk-level device access.
///
/// A handle is only ever used by one exchange at a time; the transport
/// guarantees that, not the backend.
#[async_trait]
pub trait Api: Send + Sync {
	type Handle: Send + Sync;

	fn kind(&self) -> BackendKind;

	/// Checks that the channel itself is usable (daemon running, OS listing works).
	async fn probe(&self) -> Result<(), IoError>;

	/// Devices currently present on this channel.
	async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, IoError>;

	async fn open(&self, path: &DevicePath) -> Result<Self::Handle, IoError>;

	/// Opens `path` after a cooperative handoff.
	///
	/// The replaced holder may never have closed its handle. Backends that
	/// keep their own claim on a device override this to displace it.
	async fn take_over(&self, path: &DevicePath) -> Result<Self::Handle, IoError> {
		self.open(path).await
	}

	async fn write_chunk(&self, handle: &Self::Handle, chunk: &[u8]) -> Result<(), IoError>;

	/// Reads one chunk. `None` waits indefinitely.
	async fn read_chunk(&self, handle: &Self::Handle, timeout: Option<Duration>) -> Result<Vec<u8>, IoError>;

	/// Releases the OS-level resources behind `handle`.
	async fn close(&self, handle: &Self::Handle) -> Result<(), IoError>;
}

/// The configured channel.
pub enum Backend {
	Usb(UsbBackend),
	Bridge(BridgeBackend),
	Emulator(EmulatorBackend),
}

/// Open device handle, tagged by the backend that issued it.
pub enum DeviceHandle {
	Usb(UsbHandle),
	Bridge(BridgeHandle),
	Emulator(EmulatorHandle),
}

impl Backend {
	pub fn from_config(kind: BackendKind, config: &TransportConfig) -> Result<Self, IoError> {
		Ok(match kind {
			BackendKind::Usb => Backend::Usb(UsbBackend::new(config.codec())),
			BackendKind::Bridge => Backend::Bridge(BridgeBackend::new(&config.bridge_url, &config.bridge_origin, config.codec())?),
			BackendKind::Emulator => Backend::Emulator(EmulatorBackend::new(config.emulator_addr)),
		})
	}
}

fn mismatched(kind: BackendKind) -> IoError {
	IoError::Other(format!("handle was not opened by the {kind} backend"))
}

#[async_trait]
impl Api for Backend {
	type Handle = DeviceHandle;

	fn kind(&self) -> BackendKind {
		match self {
			Backend::Usb(b) => b.kind(),
			Backend::Bridge(b) => b.kind(),
			Backend::Emulator(b) => b.kind(),
		}
	}

	async fn probe(&self) -> Result<(), IoError> {
		match self {
			Backend::Usb(b) => b.probe().await,
			Backend::Bridge(b) => b.probe().await,
			Backend::Emulator(b) => b.probe().await,
		}
	}

	async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, IoError> {
		match self {
			Backend::Usb(b) => b.enumerate().await,
			Backend::Bridge(b) => b.enumerate().await,
			Backend::Emulator(b) => b.enumerate().await,
		}
	}

	async fn open(&self, path: &DevicePath) -> Result<DeviceHandle, IoError> {
		Ok(match self {
			Backend::Usb(b) => DeviceHandle::Usb(b.open(path).await?),
			Backend::Bridge(b) => DeviceHandle::Bridge(b.open(path).await?),
			Backend::Emulator(b) => DeviceHandle::Emulator(b.open(path).await?),
		})
	}

	async fn take_over(&self, path: &DevicePath) -> Result<DeviceHandle, IoError> {
		Ok(match self {
			Backend::Usb(b) => DeviceHandle::Usb(b.take_over(path).await?),
			Backend::Bridge(b) => DeviceHandle::Bridge(b.take_over(path).await?),
			Backend::Emulator(b) => DeviceHandle::Emulator(b.take_over(path).await?),
		})
	}

	async fn write_chunk(&self, handle: &DeviceHandle, chunk: &[u8]) -> Result<(), IoError> {
		match (self, handle) {
			(Backend::Usb(b), DeviceHandle::Usb(h)) => b.write_chunk(h, chunk).await,
			(Backend::Bridge(b), DeviceHandle::Bridge(h)) => b.write_chunk(h, chunk).await,
			(Backend::Emulator(b), DeviceHandle::Emulator(h)) => b.write_chunk(h, chunk).await,
			_ => Err(mismatched(self.kind())),
		}
	}

	async fn read_chunk(&self, handle: &DeviceHandle, timeout: Option<Duration>) -> Result<Vec<u8>, IoError> {
		match (self, handle) {
			(Backend::Usb(b), DeviceHandle::Usb(h)) => b.read_chunk(h, timeout).await,
			(Backend::Bridge(b), DeviceHandle::Bridge(h)) => b.read_chunk(h, timeout).await,
			(Backend::Emulator(b), DeviceHandle::Emulator(h)) => b.read_chunk(h, timeout).await,
			_ => Err(mismatched(self.kind())),
		}
	}

	async fn close(&self, handle: &DeviceHandle) -> Result<(), IoError> {
		match (self, handle) {
			(Backend::Usb(b), DeviceHandle::Usb(h)) => b.close(h).await,
			(Backend::Bridge(b), DeviceHandle::Bridge(h)) => b.close(h).await,
			(Backend::Emulator(b), DeviceHandle::Emulator(h)) => b.close(h).await,
			_ => Err(mismatched(self.kind())),
		}
	}
}

/// Waits for `fut`, mapping expiry of `timeout` to [`IoError::Timeout`].
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, IoError>
where
	F: std::future::Future<Output = Result<T, IoError>>,
{
	match timeout {
		Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| IoError::Timeout)?,
		None => fut.await,
	}
}
