//! Line-delimited JSON transport between sessions clients and the daemon.
//!
//! Each connection carries one request and one response, except
//! [`SessionsRequest::Subscribe`], after which the server writes one
//! [`SessionsEvent`] per line until either side hangs up.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use hwlink_protocol::{SessionsEvent, SessionsRequest, SessionsResponse};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::background::{SessionsHandle, error_response};
use crate::error::{Error, Result};

pub const SESSIONS_TCP_PORT: u16 = 21328;

/// Where the sessions daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
	#[cfg(unix)]
	Unix(PathBuf),
	Tcp(SocketAddr),
}

impl Endpoint {
	/// Per-user default.
	///
	/// Uses `$XDG_RUNTIME_DIR/hwlink-sessions.sock` if available, otherwise
	/// `/tmp/hwlink-sessions-{uid}.sock`. Non-unix hosts use a loopback TCP port.
	pub fn default_for_user() -> Self {
		#[cfg(unix)]
		{
			if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
				return Endpoint::Unix(PathBuf::from(xdg_runtime).join("hwlink-sessions.sock"));
			}
			let uid = unsafe { libc::getuid() };
			Endpoint::Unix(PathBuf::from(format!("/tmp/hwlink-sessions-{uid}.sock")))
		}

		#[cfg(not(unix))]
		{
			Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], SESSIONS_TCP_PORT)))
		}
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			#[cfg(unix)]
			Endpoint::Unix(path) => write!(f, "{}", path.display()),
			Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
		}
	}
}

/// Boxed read half of a subscription connection.
pub(crate) type EventLines = tokio::io::Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Sends one request and reads one response.
pub(crate) async fn round_trip(endpoint: &Endpoint, request: &SessionsRequest) -> Result<SessionsResponse> {
	match endpoint {
		#[cfg(unix)]
		Endpoint::Unix(path) => {
			let stream = UnixStream::connect(path).await.map_err(|e| unreachable(endpoint, e))?;
			let (response, _) = exchange(stream, request).await?;
			Ok(response)
		}
		Endpoint::Tcp(addr) => {
			let stream = TcpStream::connect(addr).await.map_err(|e| unreachable(endpoint, e))?;
			let (response, _) = exchange(stream, request).await?;
			Ok(response)
		}
	}
}

/// Opens an event stream.
pub(crate) async fn subscribe(endpoint: &Endpoint) -> Result<EventLines> {
	let (response, reader) = match endpoint {
		#[cfg(unix)]
		Endpoint::Unix(path) => {
			let stream = UnixStream::connect(path).await.map_err(|e| unreachable(endpoint, e))?;
			exchange(stream, &SessionsRequest::Subscribe).await?
		}
		Endpoint::Tcp(addr) => {
			let stream = TcpStream::connect(addr).await.map_err(|e| unreachable(endpoint, e))?;
			exchange(stream, &SessionsRequest::Subscribe).await?
		}
	};
	match response {
		SessionsResponse::Subscribed => Ok(reader.lines()),
		other => Err(Error::Protocol(format!("unexpected subscribe response: {other:?}"))),
	}
}

/// Returns true when something answers a handshake at `endpoint`.
pub async fn is_running(endpoint: &Endpoint) -> bool {
	match round_trip(endpoint, &SessionsRequest::Handshake).await {
		Ok(SessionsResponse::Handshake { .. }) => true,
		Ok(other) => {
			debug!(target = "hwlink.daemon", response = ?other, "unexpected handshake response");
			false
		}
		Err(err) => {
			debug!(target = "hwlink.daemon", %endpoint, error = %err, "sessions daemon not reachable");
			false
		}
	}
}

fn unreachable(endpoint: &Endpoint, err: std::io::Error) -> Error {
	Error::BackendUnreachable(format!("sessions daemon at {endpoint}: {err}"))
}

async fn exchange<S>(stream: S, request: &SessionsRequest) -> Result<(SessionsResponse, Box<dyn AsyncBufRead + Send + Unpin>)>
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	let (read_half, mut write_half) = tokio::io::split(stream);
	write_line(&mut write_half, request).await?;

	let mut reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(BufReader::new(read_half));
	let mut line = String::new();
	let read = reader.read_line(&mut line).await.map_err(|e| Error::Io(e.into()))?;
	if read == 0 {
		return Err(Error::ChannelClosed);
	}
	let response = serde_json::from_str(line.trim_end())?;
	Ok((response, reader))
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
	W: AsyncWrite + Unpin,
	T: serde::Serialize,
{
	let payload = serde_json::to_string(value)?;
	writer.write_all(format!("{payload}\n").as_bytes()).await.map_err(|e| Error::Io(e.into()))?;
	writer.flush().await.map_err(|e| Error::Io(e.into()))?;
	Ok(())
}

enum Listener {
	#[cfg(unix)]
	Unix(UnixListener, PathBuf),
	Tcp(TcpListener),
}

/// Serves a [`SessionsHandle`] to other processes.
pub struct SessionsServer {
	handle: SessionsHandle,
	listener: Listener,
}

impl SessionsServer {
	/// Binds `endpoint`, replacing a stale socket file if one is left over.
	pub async fn bind(endpoint: &Endpoint, handle: SessionsHandle) -> Result<Self> {
		let listener = match endpoint {
			#[cfg(unix)]
			Endpoint::Unix(path) => {
				if path.exists() {
					std::fs::remove_file(path).map_err(|e| Error::Io(e.into()))?;
				}
				if let Some(parent) = path.parent() {
					if !parent.exists() {
						std::fs::create_dir_all(parent).map_err(|e| Error::Io(e.into()))?;
					}
				}
				let listener = UnixListener::bind(path).map_err(|e| Error::Io(e.into()))?;
				Listener::Unix(listener, path.clone())
			}
			Endpoint::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr).await.map_err(|e| Error::Io(e.into()))?),
		};

		let server = Self { handle, listener };
		info!(target = "hwlink.daemon", endpoint = %server.local_endpoint(), "sessions daemon listening");
		Ok(server)
	}

	/// The bound endpoint; resolves port 0 to the assigned port.
	pub fn local_endpoint(&self) -> Endpoint {
		match &self.listener {
			#[cfg(unix)]
			Listener::Unix(_, path) => Endpoint::Unix(path.clone()),
			Listener::Tcp(listener) => match listener.local_addr() {
				Ok(addr) => Endpoint::Tcp(addr),
				Err(_) => Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], SESSIONS_TCP_PORT))),
			},
		}
	}

	/// Accepts clients until `shutdown` fires or a client asks the background to stop.
	pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
		let Self { handle, listener } = self;
		let result = match &listener {
			#[cfg(unix)]
			Listener::Unix(listener, _) => {
				loop {
					tokio::select! {
						_ = shutdown.cancelled() => break,
						_ = handle.stopped() => {
							info!(target = "hwlink.daemon", "shutdown requested via message");
							break;
						}
						accept = listener.accept() => {
							let (stream, _) = accept.map_err(|e| Error::Io(e.into()))?;
							spawn_client(stream, handle.clone(), shutdown.clone());
						}
					}
				}
				Ok(())
			}
			Listener::Tcp(listener) => {
				loop {
					tokio::select! {
						_ = shutdown.cancelled() => break,
						_ = handle.stopped() => {
							info!(target = "hwlink.daemon", "shutdown requested via message");
							break;
						}
						accept = listener.accept() => {
							let (stream, _) = accept.map_err(|e| Error::Io(e.into()))?;
							spawn_client(stream, handle.clone(), shutdown.clone());
						}
					}
				}
				Ok(())
			}
		};

		shutdown.cancel();
		#[cfg(unix)]
		if let Listener::Unix(_, path) = &listener {
			let _ = std::fs::remove_file(path);
		}
		result
	}
}

fn spawn_client<S>(stream: S, handle: SessionsHandle, shutdown: CancellationToken)
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	tokio::spawn(async move {
		if let Err(err) = handle_client(stream, handle, shutdown).await {
			warn!(target = "hwlink.daemon", error = %err, "sessions connection error");
		}
	});
}

async fn handle_client<S>(stream: S, handle: SessionsHandle, shutdown: CancellationToken) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let (read_half, mut write_half) = tokio::io::split(stream);
	let mut reader = BufReader::new(read_half);
	let mut line = String::new();

	loop {
		line.clear();
		let bytes = reader.read_line(&mut line).await.map_err(|e| Error::Io(e.into()))?;
		if bytes == 0 {
			break;
		}

		let request = match serde_json::from_str::<SessionsRequest>(line.trim_end()) {
			Ok(request) => request,
			Err(err) => {
				let response = SessionsResponse::Error {
					code: "invalid_request".to_string(),
					message: err.to_string(),
				};
				write_line(&mut write_half, &response).await?;
				continue;
			}
		};

		if request == SessionsRequest::Subscribe {
			// Subscribe before acknowledging so no event falls in between.
			let events = handle.events();
			write_line(&mut write_half, &SessionsResponse::Subscribed).await?;
			return stream_events(events, &mut write_half, &handle, &shutdown).await;
		}

		let response = match handle.request(request).await {
			Ok(response) => response,
			Err(err) => error_response(&err),
		};
		write_line(&mut write_half, &response).await?;
	}

	Ok(())
}

async fn stream_events<W>(mut events: broadcast::Receiver<SessionsEvent>, writer: &mut W, handle: &SessionsHandle, shutdown: &CancellationToken) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => return Ok(()),
			_ = handle.stopped() => return Ok(()),
			event = events.recv() => match event {
				Ok(event) => write_line(writer, &event).await?,
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(target = "hwlink.daemon", skipped, "subscriber lagged, events dropped");
				}
				Err(broadcast::error::RecvError::Closed) => return Ok(()),
			},
		}
	}
}
