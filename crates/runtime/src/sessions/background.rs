//! Single-owner task hosting the [`SessionRegistry`].

use hwlink_protocol::{CallerToken, DevicePath, InvalidationReason, SessionId, SessionsEvent, SessionsRequest, SessionsResponse};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::registry::SessionRegistry;

const REQUEST_QUEUE: usize = 64;
const EVENT_BUFFER: usize = 256;

struct Command {
	request: SessionsRequest,
	reply: oneshot::Sender<SessionsResponse>,
}

/// Processes arbitration requests one at a time, in arrival order.
pub struct SessionsBackground {
	registry: SessionRegistry,
	rx: mpsc::Receiver<Command>,
	events: broadcast::Sender<SessionsEvent>,
	stopped: CancellationToken,
}

/// Cloneable sender side of a running [`SessionsBackground`].
#[derive(Clone)]
pub struct SessionsHandle {
	tx: mpsc::Sender<Command>,
	events: broadcast::Sender<SessionsEvent>,
	stopped: CancellationToken,
}

impl SessionsBackground {
	/// Spawns the background on the current runtime.
	pub fn spawn() -> SessionsHandle {
		let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
		let (events, _) = broadcast::channel(EVENT_BUFFER);
		let stopped = CancellationToken::new();

		let background = Self {
			registry: SessionRegistry::new(),
			rx,
			events: events.clone(),
			stopped: stopped.clone(),
		};
		tokio::spawn(background.run());

		SessionsHandle { tx, events, stopped }
	}

	async fn run(mut self) {
		debug!(target = "hwlink.sessions", "sessions background started");
		while let Some(Command { request, reply }) = self.rx.recv().await {
			let shutdown = matches!(request, SessionsRequest::Shutdown);
			let response = self.handle(request);
			let _ = reply.send(response);
			if shutdown {
				info!(target = "hwlink.sessions", "sessions background shutting down");
				break;
			}
		}
		self.rx.close();
		self.stopped.cancel();
	}

	fn handle(&mut self, request: SessionsRequest) -> SessionsResponse {
		match request {
			SessionsRequest::Handshake => SessionsResponse::Handshake {
				version: env!("CARGO_PKG_VERSION").to_string(),
			},
			SessionsRequest::Enumerate { source, descriptors } => {
				let reconciled = self.registry.reconcile(&source, descriptors);
				for lost in &reconciled.lost {
					info!(target = "hwlink.sessions", path = %lost.path, session = %lost.session, "session lost on disconnect");
					self.invalidated(&lost.path, &lost.session, InvalidationReason::Disconnected);
				}
				if reconciled.changed {
					self.publish_descriptors();
				}
				SessionsResponse::Enumerated {
					descriptors: reconciled.descriptors,
					lost: reconciled.lost,
				}
			}
			SessionsRequest::Acquire { path, previous, owner } => self.acquire(path, previous, owner),
			SessionsRequest::Release { session } => match self.registry.release(&session) {
				Ok(path) => {
					debug!(target = "hwlink.sessions", %path, %session, "released");
					self.invalidated(&path, &session, InvalidationReason::Released);
					self.publish_descriptors();
					SessionsResponse::Released { path, session }
				}
				Err(err) => error_response(&err),
			},
			SessionsRequest::GetSessions => SessionsResponse::Sessions {
				sessions: self.registry.sessions_info(),
			},
			SessionsRequest::GetPathBySession { session } => SessionsResponse::Path {
				path: self.registry.path_by_session(&session),
			},
			SessionsRequest::Subscribe => SessionsResponse::Subscribed,
			SessionsRequest::Shutdown => SessionsResponse::Ok,
		}
	}

	fn acquire(&mut self, path: DevicePath, previous: Option<SessionId>, owner: CallerToken) -> SessionsResponse {
		match self.registry.acquire(&path, previous.as_ref(), owner.clone()) {
			Ok(grant) => {
				debug!(target = "hwlink.sessions", path = %grant.path, session = %grant.session, %owner, "acquired");
				if let Some(replaced) = &grant.replaced {
					self.invalidated(&grant.path, replaced, InvalidationReason::Handoff);
				}
				self.publish_descriptors();
				SessionsResponse::Acquired {
					path: grant.path,
					session: grant.session,
					replaced: grant.replaced,
				}
			}
			Err(err) => {
				debug!(target = "hwlink.sessions", %path, %owner, error = %err, "acquire refused");
				error_response(&err)
			}
		}
	}

	fn invalidated(&self, path: &DevicePath, session: &SessionId, reason: InvalidationReason) {
		let _ = self.events.send(SessionsEvent::Invalidated {
			path: path.clone(),
			session: session.clone(),
			reason,
		});
	}

	fn publish_descriptors(&self) {
		let _ = self.events.send(SessionsEvent::DescriptorsChanged {
			descriptors: self.registry.descriptors(),
		});
	}
}

impl SessionsHandle {
	/// Queues `request` and waits for its response.
	pub async fn request(&self, request: SessionsRequest) -> Result<SessionsResponse> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(Command { request, reply }).await.map_err(|_| Error::ChannelClosed)?;
		rx.await.map_err(|_| Error::ChannelClosed)
	}

	pub fn events(&self) -> broadcast::Receiver<SessionsEvent> {
		self.events.subscribe()
	}

	/// Resolves once the background has processed a shutdown request.
	pub async fn stopped(&self) {
		self.stopped.cancelled().await
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.is_cancelled()
	}
}

pub(crate) fn error_response(err: &Error) -> SessionsResponse {
	SessionsResponse::Error {
		code: err.code().to_string(),
		message: err.to_string(),
	}
}
