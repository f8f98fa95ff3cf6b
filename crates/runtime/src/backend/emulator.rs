//! Device emulator reachable over UDP.
//!
//! Every datagram is one chunk. The emulator also answers a `PINGPING`
//! datagram with `PONGPONG`, which is how presence is detected.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hwlink_protocol::{CHUNK_SIZE, DeviceDescriptor, DevicePath};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{Api, with_timeout};
use crate::config::BackendKind;
use crate::error::IoError;

pub(crate) const PING: &[u8] = b"PINGPING";
pub(crate) const PONG: &[u8] = b"PONGPONG";
const PING_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_DATAGRAM: usize = 4096;

pub struct EmulatorBackend {
	addr: SocketAddr,
}

/// Private socket connected to the emulator.
pub struct EmulatorHandle {
	socket: UdpSocket,
}

impl EmulatorBackend {
	pub fn new(addr: SocketAddr) -> Self {
		Self { addr }
	}

	pub fn path(&self) -> DevicePath {
		DevicePath::new(self.addr.to_string())
	}

	async fn connect(&self) -> Result<UdpSocket, IoError> {
		let local: SocketAddr = if self.addr.is_ipv4() {
			SocketAddr::from(([127, 0, 0, 1], 0))
		} else {
			SocketAddr::from(([0u16; 8], 0))
		};
		let socket = UdpSocket::bind(local).await.map_err(IoError::from)?;
		socket.connect(self.addr).await.map_err(IoError::from)?;
		Ok(socket)
	}

	async fn ping(&self) -> Result<(), IoError> {
		let socket = self.connect().await?;
		socket.send(PING).await.map_err(udp_error)?;

		let mut buf = [0u8; CHUNK_SIZE];
		let len = with_timeout(Some(PING_TIMEOUT), async { socket.recv(&mut buf).await.map_err(udp_error) })
			.await
			.map_err(|err| match err {
				IoError::Timeout | IoError::Disconnected => IoError::NetworkUnreachable(format!("no emulator at {}", self.addr)),
				other => other,
			})?;
		if &buf[..len] == PONG {
			Ok(())
		} else {
			Err(IoError::Other(format!("unexpected ping reply from {}", self.addr)))
		}
	}
}

/// ICMP port-unreachable surfaces as a refused connection on the next call.
fn udp_error(err: std::io::Error) -> IoError {
	match err.kind() {
		std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => IoError::Disconnected,
		_ => IoError::from(err),
	}
}

#[async_trait]
impl Api for EmulatorBackend {
	type Handle = EmulatorHandle;

	fn kind(&self) -> BackendKind {
		BackendKind::Emulator
	}

	async fn probe(&self) -> Result<(), IoError> {
		self.ping().await
	}

	async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, IoError> {
		match self.ping().await {
			Ok(()) => Ok(vec![DeviceDescriptor::new(self.path())]),
			Err(err) => {
				trace!(target = "hwlink.backend", addr = %self.addr, error = %err, "emulator not answering");
				Ok(Vec::new())
			}
		}
	}

	async fn open(&self, path: &DevicePath) -> Result<EmulatorHandle, IoError> {
		if *path != self.path() {
			return Err(IoError::Disconnected);
		}
		let socket = self.connect().await?;
		debug!(target = "hwlink.backend", %path, local = ?socket.local_addr().ok(), "emulator handle opened");
		Ok(EmulatorHandle { socket })
	}

	async fn write_chunk(&self, handle: &EmulatorHandle, chunk: &[u8]) -> Result<(), IoError> {
		handle.socket.send(chunk).await.map_err(udp_error)?;
		Ok(())
	}

	async fn read_chunk(&self, handle: &EmulatorHandle, timeout: Option<Duration>) -> Result<Vec<u8>, IoError> {
		let mut buf = vec![0u8; MAX_DATAGRAM];
		let len = with_timeout(timeout, async { handle.socket.recv(&mut buf).await.map_err(udp_error) }).await?;
		buf.truncate(len);
		Ok(buf)
	}

	async fn close(&self, _handle: &EmulatorHandle) -> Result<(), IoError> {
		Ok(())
	}
}
