//! Direct USB access through `nusb`.

use std::time::Duration;

use async_trait::async_trait;
use hwlink_protocol::{ChunkCodec, DeviceDescriptor, DevicePath};
use nusb::transfer::{RequestBuffer, TransferError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Api, with_timeout};
use crate::config::BackendKind;
use crate::error::IoError;

pub const VENDOR_ID: u16 = 0x1209;
pub const PRODUCT_ID_FIRMWARE: u16 = 0x53c1;
pub const PRODUCT_ID_BOOTLOADER: u16 = 0x53c0;

const INTERFACE: u8 = 0;
const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

pub struct UsbBackend {
	/// Interrupt transfer length, one chunk.
	chunk_size: usize,
}

/// Claimed interface 0 of one device.
pub struct UsbHandle {
	path: DevicePath,
	interface: Mutex<Option<nusb::Interface>>,
}

impl UsbBackend {
	pub fn new(codec: ChunkCodec) -> Self {
		Self {
			chunk_size: codec.chunk_size(),
		}
	}

	pub fn chunk_size(&self) -> usize {
		self.chunk_size
	}
}

impl Default for UsbBackend {
	fn default() -> Self {
		Self::new(ChunkCodec::default())
	}
}

impl UsbHandle {
	fn interface(&self) -> Result<nusb::Interface, IoError> {
		self.interface.lock().clone().ok_or(IoError::Disconnected)
	}
}

pub(crate) fn is_supported(vendor: u16, product: u16) -> bool {
	vendor == VENDOR_ID && (product == PRODUCT_ID_FIRMWARE || product == PRODUCT_ID_BOOTLOADER)
}

pub(crate) fn usb_path(bus: u8, address: u8) -> DevicePath {
	DevicePath::new(format!("{bus}-{address}"))
}

fn transfer_error(err: TransferError) -> IoError {
	match err {
		TransferError::Disconnected => IoError::Disconnected,
		TransferError::Cancelled => IoError::Timeout,
		TransferError::Stall => IoError::Other("endpoint stalled".into()),
		other => IoError::Other(other.to_string()),
	}
}

fn supported_devices() -> Result<impl Iterator<Item = nusb::DeviceInfo>, IoError> {
	let devices = nusb::list_devices().map_err(IoError::from)?;
	Ok(devices.filter(|info| is_supported(info.vendor_id(), info.product_id())))
}

#[async_trait]
impl Api for UsbBackend {
	type Handle = UsbHandle;

	fn kind(&self) -> BackendKind {
		BackendKind::Usb
	}

	async fn probe(&self) -> Result<(), IoError> {
		nusb::list_devices().map(|_| ()).map_err(IoError::from)
	}

	async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, IoError> {
		let descriptors = supported_devices()?
			.map(|info| DeviceDescriptor::new(usb_path(info.bus_number(), info.device_address())).with_ids(info.vendor_id(), info.product_id()))
			.collect();
		Ok(descriptors)
	}

	async fn open(&self, path: &DevicePath) -> Result<UsbHandle, IoError> {
		let info = supported_devices()?
			.find(|info| usb_path(info.bus_number(), info.device_address()) == *path)
			.ok_or(IoError::Disconnected)?;

		let device = info.open().map_err(IoError::from)?;
		let interface = device.claim_interface(INTERFACE).map_err(IoError::from)?;
		debug!(target = "hwlink.backend", %path, "usb interface claimed");

		Ok(UsbHandle {
			path: path.clone(),
			interface: Mutex::new(Some(interface)),
		})
	}

	async fn write_chunk(&self, handle: &UsbHandle, chunk: &[u8]) -> Result<(), IoError> {
		let interface = handle.interface()?;
		trace!(target = "hwlink.backend", path = %handle.path, len = chunk.len(), "usb out");
		interface.interrupt_out(ENDPOINT_OUT, chunk.to_vec()).await.into_result().map_err(transfer_error)?;
		Ok(())
	}

	async fn read_chunk(&self, handle: &UsbHandle, timeout: Option<Duration>) -> Result<Vec<u8>, IoError> {
		let interface = handle.interface()?;
		// Dropping the transfer future on timeout cancels the transfer.
		let data = with_timeout(timeout, async {
			interface
				.interrupt_in(ENDPOINT_IN, RequestBuffer::new(self.chunk_size))
				.await
				.into_result()
				.map_err(transfer_error)
		})
		.await?;
		trace!(target = "hwlink.backend", path = %handle.path, len = data.len(), "usb in");
		Ok(data)
	}

	async fn close(&self, handle: &UsbHandle) -> Result<(), IoError> {
		if handle.interface.lock().take().is_some() {
			debug!(target = "hwlink.backend", path = %handle.path, "usb interface released");
		}
		Ok(())
	}
}
