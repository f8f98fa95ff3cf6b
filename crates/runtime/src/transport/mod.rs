//! Public transport facade.
//!
//! [`Transport`] ties one probed [`Backend`] to a [`SessionsClient`] and the
//! chunk codec. Ownership of a device is decided by the sessions background;
//! this layer opens and closes the physical handle to match, and runs
//! message exchanges over it one at a time per session.

mod session;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use hwlink_protocol::{Chunk, ChunkCodec, DescriptorDiff, DeviceDescriptor, DevicePath, LostSession, Message, SessionId, SessionsEvent, SessionsInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
pub use session::SessionState;
use session::LocalSession;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Api, Backend};
use crate::config::{BackendKind, TransportConfig};
use crate::error::{Error, IoError, Result};
use crate::sessions::{SessionsClient, SessionsSubscription};

const EVENT_BUFFER: usize = 256;

/// Notification delivered to [`Transport::subscribe`]rs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TransportEvent {
	DeviceConnect { descriptor: DeviceDescriptor },
	DeviceDisconnect { descriptor: DeviceDescriptor },
	/// A present device went from free to held, by any caller.
	DeviceAcquired { descriptor: DeviceDescriptor },
	/// A present device went from held to free.
	DeviceReleased { descriptor: DeviceDescriptor },
	/// A session held by this transport stopped being valid without `release`.
	SessionLost { path: DevicePath, session: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireInput {
	pub path: DevicePath,
	/// Session the caller held before, for cooperative handoff.
	pub previous: Option<SessionId>,
}

impl AcquireInput {
	pub fn new(path: impl Into<DevicePath>) -> Self {
		Self {
			path: path.into(),
			previous: None,
		}
	}

	pub fn with_previous(mut self, previous: impl Into<SessionId>) -> Self {
		self.previous = Some(previous.into());
		self
	}
}

/// One request/response exchange.
#[derive(Debug, Clone)]
pub struct CallInput {
	pub session: SessionId,
	pub message_type: u16,
	pub payload: Vec<u8>,
	/// Bound on the whole exchange; falls back to the configured default.
	pub timeout: Option<Duration>,
	pub signal: Option<CancellationToken>,
}

impl CallInput {
	pub fn new(session: impl Into<SessionId>, message_type: u16, payload: impl Into<Vec<u8>>) -> Self {
		Self {
			session: session.into(),
			message_type,
			payload: payload.into(),
			timeout: None,
			signal: None,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn with_signal(mut self, signal: CancellationToken) -> Self {
		self.signal = Some(signal);
		self
	}
}

enum Outcome<T> {
	Done(Result<T>),
	TimedOut(Duration),
	Cancelled,
}

pub(crate) struct Inner {
	pub(crate) config: TransportConfig,
	backend: Backend,
	codec: ChunkCodec,
	sessions: SessionsClient,
	local: DashMap<SessionId, Arc<LocalSession>>,
	events: broadcast::Sender<TransportEvent>,
	/// Serializes event emission so lost sessions precede disconnects.
	emit: Mutex<()>,
	pub(crate) shutdown: CancellationToken,
	listener: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one transport instance.
#[derive(Clone)]
pub struct Transport {
	inner: Arc<Inner>,
}

impl Transport {
	/// Probes the eligible backends in configured order and keeps the first that responds.
	pub async fn init(config: TransportConfig, sessions: SessionsClient) -> Result<Self> {
		config.validate()?;

		let mut attempts = Vec::new();
		for kind in config.eligible_transports() {
			let backend = match Backend::from_config(kind, &config) {
				Ok(backend) => backend,
				Err(err) => {
					attempts.push(format!("{kind}: {err}"));
					continue;
				}
			};
			match backend.probe().await {
				Ok(()) => {
					info!(target = "hwlink.transport", backend = %kind, "transport selected");
					return Self::with_backend(config, backend, sessions).await;
				}
				Err(err) => {
					debug!(target = "hwlink.transport", backend = %kind, error = %err, "backend probe failed");
					attempts.push(format!("{kind}: {err}"));
				}
			}
		}

		Err(Error::NoTransportAvailable { attempts })
	}

	/// Builds a transport on an already chosen backend, skipping the probe.
	pub async fn with_backend(config: TransportConfig, backend: Backend, sessions: SessionsClient) -> Result<Self> {
		let subscription = sessions.subscribe().await?;
		let (events, _) = broadcast::channel(EVENT_BUFFER);
		let inner = Arc::new(Inner {
			codec: config.codec(),
			config,
			backend,
			sessions,
			local: DashMap::new(),
			events,
			emit: Mutex::new(()),
			shutdown: CancellationToken::new(),
			listener: Mutex::new(None),
		});

		tokio::spawn(watch_invalidations(Arc::downgrade(&inner), subscription, inner.shutdown.clone()));
		Ok(Self { inner })
	}

	pub fn backend_kind(&self) -> BackendKind {
		self.inner.backend.kind()
	}

	pub fn config(&self) -> &TransportConfig {
		&self.inner.config
	}

	/// Lists present devices, decorated with their sessions.
	pub async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
		let (descriptors, lost) = self.inner.enumerate_pass().await?;
		let closing = self.inner.emit_pass(lost, &DescriptorDiff::default());
		self.inner.close_all(closing).await;
		Ok(descriptors)
	}

	/// Starts the polling enumerator. Calling it again while it runs is a no-op.
	pub fn listen(&self) {
		let mut listener = self.inner.listener.lock();
		if listener.as_ref().is_some_and(|task| !task.is_finished()) {
			return;
		}
		*listener = Some(tokio::spawn(crate::enumerator::run(Arc::downgrade(&self.inner), self.inner.shutdown.clone())));
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
		self.inner.events.subscribe()
	}

	/// Acquires `path` and opens it on the backend.
	pub async fn acquire(&self, input: AcquireInput) -> Result<SessionId> {
		let AcquireInput { path, previous } = input;

		// The previous holder's handle has to be gone before the device is reopened.
		if let Some(previous) = &previous {
			if let Some((_, old)) = self.inner.local.remove_if(previous, |_, local| local.path == path) {
				debug!(target = "hwlink.transport", %path, session = %old.id, "closing handle for handoff");
				self.inner.close(&old).await;
			}
		}

		let grant = self.inner.sessions.acquire(&path, previous.as_ref()).await?;
		let session = grant.session;
		let opened = match &grant.replaced {
			Some(replaced) => {
				debug!(target = "hwlink.transport", %path, %replaced, "taking over device");
				self.inner.backend.take_over(&path).await
			}
			None => self.inner.backend.open(&path).await,
		};
		match opened {
			Ok(handle) => {
				info!(target = "hwlink.transport", %path, %session, "session acquired");
				self.inner.local.insert(session.clone(), LocalSession::new(session.clone(), path, handle));
				Ok(session)
			}
			Err(err) => {
				warn!(target = "hwlink.transport", %path, %session, error = %err, "open failed, releasing session");
				if let Err(release_err) = self.inner.sessions.release(&session).await {
					debug!(target = "hwlink.transport", %session, error = %release_err, "release after failed open");
				}
				Err(Error::from_io(err, &path))
			}
		}
	}

	/// Closes the handle and frees the session.
	pub async fn release(&self, session: &SessionId) -> Result<()> {
		if let Some((_, local)) = self.inner.local.remove(session) {
			self.inner.close(&local).await;
		}
		let path = self.inner.sessions.release(session).await?;
		info!(target = "hwlink.transport", %path, %session, "session released");
		Ok(())
	}

	/// Writes one message and reads the response.
	pub async fn call(&self, input: CallInput) -> Result<Message> {
		let CallInput {
			session,
			message_type,
			payload,
			timeout,
			signal,
		} = input;
		let chunks = self.inner.codec.encode(message_type, &payload)?;
		let message = self.inner.exchange(&session, Some(chunks), true, timeout, signal).await?;
		message.ok_or_else(|| Error::Protocol("exchange finished without a response".into()))
	}

	/// Writes one message without waiting for a response.
	pub async fn send(&self, input: CallInput) -> Result<()> {
		let chunks = self.inner.codec.encode(input.message_type, &input.payload)?;
		self.inner.exchange(&input.session, Some(chunks), false, input.timeout, input.signal).await?;
		Ok(())
	}

	/// Reads one message.
	pub async fn receive(&self, session: &SessionId, timeout: Option<Duration>, signal: Option<CancellationToken>) -> Result<Message> {
		let message = self.inner.exchange(session, None, true, timeout, signal).await?;
		message.ok_or_else(|| Error::Protocol("exchange finished without a response".into()))
	}

	/// Ownership snapshot from the sessions background.
	pub async fn sessions_info(&self) -> Result<SessionsInfo> {
		self.inner.sessions.sessions_info().await
	}

	/// Exchange state of a session held by this transport.
	pub fn session_state(&self, session: &SessionId) -> Option<SessionState> {
		self.inner.local.get(session).map(|local| local.state())
	}

	/// Stops background tasks and releases every session this transport holds.
	pub async fn stop(&self) {
		self.inner.shutdown.cancel();
		if let Some(task) = self.inner.listener.lock().take() {
			task.abort();
		}

		let held: Vec<SessionId> = self.inner.local.iter().map(|entry| entry.key().clone()).collect();
		for session in held {
			if let Err(err) = self.release(&session).await {
				debug!(target = "hwlink.transport", %session, error = %err, "release on stop");
			}
		}
		info!(target = "hwlink.transport", "transport stopped");
	}
}

impl Inner {
	/// One enumeration round trip: backend listing, then registry reconciliation.
	pub(crate) async fn enumerate_pass(&self) -> Result<(Vec<DeviceDescriptor>, Vec<LostSession>)> {
		let reported = self.backend.enumerate().await.map_err(|err| match err {
			IoError::NetworkUnreachable(msg) => Error::BackendUnreachable(msg),
			IoError::Timeout | IoError::Disconnected => Error::TransportNotDetected,
			other => Error::Io(other),
		})?;
		self.sessions.enumerate(self.backend.kind(), reported).await
	}

	/// Emits `session-lost` for locally held `lost` sessions, then the diff
	/// (disconnects, connects, ownership changes).
	///
	/// Returns the sessions whose handles still need closing.
	pub(crate) fn emit_pass(&self, lost: Vec<LostSession>, diff: &DescriptorDiff) -> Vec<Arc<LocalSession>> {
		let _emit = self.emit.lock();
		let mut closing = Vec::new();
		for LostSession { path, session } in lost {
			if let Some((_, local)) = self.local.remove(&session) {
				info!(target = "hwlink.transport", %path, %session, "session lost");
				let _ = self.events.send(TransportEvent::SessionLost { path, session });
				closing.push(local);
			}
		}
		for descriptor in &diff.disconnected {
			let _ = self.events.send(TransportEvent::DeviceDisconnect {
				descriptor: descriptor.clone(),
			});
		}
		for descriptor in &diff.connected {
			let _ = self.events.send(TransportEvent::DeviceConnect {
				descriptor: descriptor.clone(),
			});
		}
		for descriptor in &diff.acquired {
			let _ = self.events.send(TransportEvent::DeviceAcquired {
				descriptor: descriptor.clone(),
			});
		}
		for descriptor in &diff.released {
			let _ = self.events.send(TransportEvent::DeviceReleased {
				descriptor: descriptor.clone(),
			});
		}
		closing
	}

	pub(crate) async fn close_all(&self, sessions: Vec<Arc<LocalSession>>) {
		for local in sessions {
			self.close(&local).await;
		}
	}

	async fn close(&self, local: &LocalSession) {
		if let Err(err) = self.backend.close(&local.handle).await {
			debug!(target = "hwlink.transport", path = %local.path, session = %local.id, error = %err, "close failed");
		}
	}

	fn local_session(&self, session: &SessionId) -> Result<Arc<LocalSession>> {
		self.local
			.get(session)
			.map(|entry| Arc::clone(entry.value()))
			.ok_or_else(|| Error::SessionNotFound { session: session.clone() })
	}

	/// Runs one exchange on `session`: writes `chunks` (if any), then reads one message when `read` is set.
	///
	/// Cancellation before the first chunk is written leaves the session usable.
	/// Any other interruption or failure degrades it.
	async fn exchange(&self, session: &SessionId, chunks: Option<Vec<Chunk>>, read: bool, timeout: Option<Duration>, signal: Option<CancellationToken>) -> Result<Option<Message>> {
		let local = self.local_session(session)?;
		let mut guard = local.begin()?;

		let timeout = timeout.or(self.config.call_timeout());
		let deadline = timeout.map(|t| Instant::now() + t);
		let committed = AtomicBool::new(false);
		let io = self.run_io(&local, chunks.as_deref(), read, deadline, &committed);

		let cancelled = async {
			match &signal {
				Some(signal) => signal.cancelled().await,
				None => std::future::pending().await,
			}
		};
		let expired = async {
			match deadline {
				Some(deadline) => tokio::time::sleep_until(deadline).await,
				None => std::future::pending().await,
			}
		};

		let outcome = tokio::select! {
			biased;
			_ = cancelled => Outcome::Cancelled,
			_ = expired => Outcome::TimedOut(timeout.unwrap_or_default()),
			result = io => Outcome::Done(result),
		};

		match outcome {
			Outcome::Done(Ok(message)) => {
				guard.complete();
				Ok(message)
			}
			Outcome::Done(Err(err)) => {
				let err = match err {
					Error::Io(IoError::Timeout) => Error::timeout(timeout.unwrap_or_default()),
					Error::Io(io_err) => Error::from_io(io_err, &local.path),
					other => other,
				};
				guard.degrade(err.to_string());
				Err(err)
			}
			Outcome::TimedOut(timeout) => {
				guard.degrade("response timeout");
				Err(Error::timeout(timeout))
			}
			Outcome::Cancelled => {
				if committed.load(Ordering::SeqCst) {
					guard.degrade("cancelled mid-exchange");
				} else {
					guard.complete();
				}
				Err(Error::Aborted)
			}
		}
	}

	/// Device I/O of one exchange. `committed` flips once bytes have moved.
	async fn run_io(&self, local: &LocalSession, chunks: Option<&[Chunk]>, read: bool, deadline: Option<Instant>, committed: &AtomicBool) -> Result<Option<Message>> {
		for chunk in chunks.unwrap_or_default() {
			committed.store(true, Ordering::SeqCst);
			self.backend.write_chunk(&local.handle, chunk.as_bytes()).await?;
		}
		if !read {
			return Ok(None);
		}
		committed.store(true, Ordering::SeqCst);

		let mut decoder = self.codec.decoder();
		loop {
			let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
			let chunk = self.backend.read_chunk(&local.handle, remaining).await?;
			if let Some(message) = decoder.push(&chunk)? {
				return Ok(Some(message));
			}
		}
	}

	/// Handles a session invalidated by the sessions background.
	fn invalidated(&self, path: DevicePath, session: SessionId) -> Option<Arc<LocalSession>> {
		let _emit = self.emit.lock();
		let (_, local) = self.local.remove(&session)?;
		info!(target = "hwlink.transport", %path, %session, "session invalidated elsewhere");
		let _ = self.events.send(TransportEvent::SessionLost { path, session });
		Some(local)
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn watch_invalidations(inner: Weak<Inner>, mut subscription: SessionsSubscription, shutdown: CancellationToken) {
	loop {
		let event = tokio::select! {
			_ = shutdown.cancelled() => return,
			event = subscription.recv() => event,
		};
		let Some(event) = event else {
			warn!(target = "hwlink.transport", "sessions event stream ended");
			return;
		};
		let SessionsEvent::Invalidated { path, session, .. } = event else {
			continue;
		};
		let Some(inner) = inner.upgrade() else {
			return;
		};
		if let Some(local) = inner.invalidated(path, session) {
			inner.close(&local).await;
		}
	}
}
