//! Session arbitration service and its clients.
//!
//! The [`SessionsBackground`] task is the only writer of the path -> session
//! table. Callers reach it through a [`SessionsClient`]: in-process over
//! channels ([`LocalSessions`]), or across processes through the `hwlink`
//! daemon socket ([`IpcSessions`]). Both variants speak the same
//! [`SessionsRequest`]/[`SessionsResponse`] messages.

mod background;
mod ipc;

#[cfg(test)]
mod tests;

pub use background::{SessionsBackground, SessionsHandle};
use hwlink_protocol::{CallerToken, DeviceDescriptor, DevicePath, LostSession, SessionId, SessionsEvent, SessionsInfo, SessionsRequest, SessionsResponse};
pub use ipc::{Endpoint, SESSIONS_TCP_PORT, SessionsServer, is_running};
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::registry::Grant;

/// In-process client of a [`SessionsBackground`].
#[derive(Clone)]
pub struct LocalSessions {
	handle: SessionsHandle,
	owner: CallerToken,
}

impl LocalSessions {
	pub fn new(handle: SessionsHandle, owner: impl Into<CallerToken>) -> Self {
		Self {
			handle,
			owner: owner.into(),
		}
	}

	pub fn handle(&self) -> &SessionsHandle {
		&self.handle
	}
}

/// Client of a sessions daemon in another process.
#[derive(Debug, Clone)]
pub struct IpcSessions {
	endpoint: Endpoint,
	owner: CallerToken,
}

impl IpcSessions {
	pub fn new(endpoint: Endpoint, owner: impl Into<CallerToken>) -> Self {
		Self {
			endpoint,
			owner: owner.into(),
		}
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}
}

/// Handle to whichever sessions background arbitrates this process.
#[derive(Clone)]
pub enum SessionsClient {
	Local(LocalSessions),
	Ipc(IpcSessions),
}

/// Stream of [`SessionsEvent`]s.
pub enum SessionsSubscription {
	Local(broadcast::Receiver<SessionsEvent>),
	Ipc(ipc::EventLines),
}

impl SessionsSubscription {
	/// Next event, or `None` once the background is gone.
	pub async fn recv(&mut self) -> Option<SessionsEvent> {
		match self {
			SessionsSubscription::Local(rx) => loop {
				match rx.recv().await {
					Ok(event) => return Some(event),
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(target = "hwlink.sessions", skipped, "sessions subscriber lagged");
					}
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			},
			SessionsSubscription::Ipc(lines) => loop {
				let line = match lines.next_line().await {
					Ok(Some(line)) => line,
					Ok(None) => return None,
					Err(err) => {
						warn!(target = "hwlink.sessions", error = %err, "sessions event stream failed");
						return None;
					}
				};
				match serde_json::from_str(&line) {
					Ok(event) => return Some(event),
					Err(err) => warn!(target = "hwlink.sessions", error = %err, "ignoring malformed sessions event"),
				}
			},
		}
	}
}

impl SessionsClient {
	/// Spawns a private in-process background.
	pub fn local(owner: impl Into<CallerToken>) -> Self {
		SessionsClient::Local(LocalSessions::new(SessionsBackground::spawn(), owner))
	}

	pub fn ipc(endpoint: Endpoint, owner: impl Into<CallerToken>) -> Self {
		SessionsClient::Ipc(IpcSessions::new(endpoint, owner))
	}

	pub fn owner(&self) -> &CallerToken {
		match self {
			SessionsClient::Local(local) => &local.owner,
			SessionsClient::Ipc(ipc) => &ipc.owner,
		}
	}

	pub fn is_shared(&self) -> bool {
		matches!(self, SessionsClient::Ipc(_))
	}

	async fn request(&self, request: SessionsRequest) -> Result<SessionsResponse> {
		match self {
			SessionsClient::Local(local) => local.handle.request(request).await,
			SessionsClient::Ipc(ipc) => ipc::round_trip(&ipc.endpoint, &request).await,
		}
	}

	/// Returns the background version.
	pub async fn handshake(&self) -> Result<String> {
		match self.request(SessionsRequest::Handshake).await? {
			SessionsResponse::Handshake { version } => Ok(version),
			other => Err(unexpected(other, None, None)),
		}
	}

	/// Reports an enumeration made on `source`; returns decorated descriptors and the sessions it invalidated.
	pub async fn enumerate(&self, source: BackendKind, descriptors: Vec<DeviceDescriptor>) -> Result<(Vec<DeviceDescriptor>, Vec<LostSession>)> {
		let request = SessionsRequest::Enumerate {
			source: source.to_string(),
			descriptors,
		};
		match self.request(request).await? {
			SessionsResponse::Enumerated { descriptors, lost } => Ok((descriptors, lost)),
			other => Err(unexpected(other, None, None)),
		}
	}

	pub async fn acquire(&self, path: &DevicePath, previous: Option<&SessionId>) -> Result<Grant> {
		let request = SessionsRequest::Acquire {
			path: path.clone(),
			previous: previous.cloned(),
			owner: self.owner().clone(),
		};
		match self.request(request).await? {
			SessionsResponse::Acquired { path, session, replaced } => Ok(Grant { path, session, replaced }),
			other => Err(unexpected(other, Some(path), previous)),
		}
	}

	/// Frees `session`; returns the path it was bound to.
	pub async fn release(&self, session: &SessionId) -> Result<DevicePath> {
		match self.request(SessionsRequest::Release { session: session.clone() }).await? {
			SessionsResponse::Released { path, .. } => Ok(path),
			other => Err(unexpected(other, None, Some(session))),
		}
	}

	pub async fn sessions_info(&self) -> Result<SessionsInfo> {
		match self.request(SessionsRequest::GetSessions).await? {
			SessionsResponse::Sessions { sessions } => Ok(sessions),
			other => Err(unexpected(other, None, None)),
		}
	}

	pub async fn path_by_session(&self, session: &SessionId) -> Result<Option<DevicePath>> {
		match self.request(SessionsRequest::GetPathBySession { session: session.clone() }).await? {
			SessionsResponse::Path { path } => Ok(path),
			other => Err(unexpected(other, None, Some(session))),
		}
	}

	pub async fn subscribe(&self) -> Result<SessionsSubscription> {
		match self {
			SessionsClient::Local(local) => Ok(SessionsSubscription::Local(local.handle.events())),
			SessionsClient::Ipc(ipc) => Ok(SessionsSubscription::Ipc(ipc::subscribe(&ipc.endpoint).await?)),
		}
	}

	/// Stops the background. For a daemon this stops it for every client.
	pub async fn shutdown(&self) -> Result<()> {
		match self.request(SessionsRequest::Shutdown).await? {
			SessionsResponse::Ok => Ok(()),
			other => Err(unexpected(other, None, None)),
		}
	}
}

fn unexpected(response: SessionsResponse, path: Option<&DevicePath>, session: Option<&SessionId>) -> Error {
	match response {
		SessionsResponse::Error { code, message } => Error::from_code(&code, message, path, session),
		other => Error::Protocol(format!("unexpected sessions response: {other:?}")),
	}
}
