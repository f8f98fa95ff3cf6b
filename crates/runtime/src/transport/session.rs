//! Per-session exchange state.

use std::sync::Arc;

use hwlink_protocol::{DevicePath, SessionId};
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::DeviceHandle;
use crate::error::{Error, Result};

/// Where a locally held session stands between exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Idle,
	/// An exchange is in flight.
	Busy,
	/// An exchange was cut short; the link may hold unread bytes.
	NeedsReacquire(String),
}

/// A session this process holds, with the handle it opened.
pub(crate) struct LocalSession {
	pub(crate) id: SessionId,
	pub(crate) path: DevicePath,
	pub(crate) handle: DeviceHandle,
	state: Mutex<SessionState>,
}

impl LocalSession {
	pub(crate) fn new(id: SessionId, path: DevicePath, handle: DeviceHandle) -> Arc<Self> {
		Arc::new(Self {
			id,
			path,
			handle,
			state: Mutex::new(SessionState::Idle),
		})
	}

	pub(crate) fn state(&self) -> SessionState {
		self.state.lock().clone()
	}

	/// Claims the session for one exchange.
	pub(crate) fn begin(self: &Arc<Self>) -> Result<BusyGuard> {
		let mut state = self.state.lock();
		match &*state {
			SessionState::Idle => {
				*state = SessionState::Busy;
				Ok(BusyGuard {
					session: Arc::clone(self),
					outcome: None,
				})
			}
			SessionState::Busy => Err(Error::SessionBusy { session: self.id.clone() }),
			SessionState::NeedsReacquire(reason) => Err(Error::NeedsReacquire {
				session: self.id.clone(),
				reason: reason.clone(),
			}),
		}
	}
}

/// Holds a session busy for the lifetime of one exchange.
///
/// Dropped without [`BusyGuard::complete`] or [`BusyGuard::degrade`] (the
/// exchange future was dropped mid-flight), the session is degraded.
pub(crate) struct BusyGuard {
	session: Arc<LocalSession>,
	outcome: Option<SessionState>,
}

impl BusyGuard {
	pub(crate) fn complete(&mut self) {
		self.outcome = Some(SessionState::Idle);
	}

	pub(crate) fn degrade(&mut self, reason: impl Into<String>) {
		let reason = reason.into();
		debug!(target = "hwlink.transport", session = %self.session.id, %reason, "session degraded");
		self.outcome = Some(SessionState::NeedsReacquire(reason));
	}
}

impl Drop for BusyGuard {
	fn drop(&mut self) {
		let outcome = self
			.outcome
			.take()
			.unwrap_or_else(|| SessionState::NeedsReacquire("exchange dropped before completion".into()));
		*self.session.state.lock() = outcome;
	}
}
