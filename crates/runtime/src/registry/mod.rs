//! Path -> session arbitration table.
//!
//! [`SessionRegistry`] is plain data with no locking of its own. Exactly one
//! owner mutates it (the sessions background), which is what makes every
//! acquire and release observe the effects of the ones before it.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hwlink_protocol::{CallerToken, DeviceDescriptor, DevicePath, LostSession, SessionId, SessionInfo, SessionsInfo};

use crate::error::{Error, Result};


/// Outcome of a successful [`SessionRegistry::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
	pub path: DevicePath,
	pub session: SessionId,
	/// Session invalidated by a cooperative handoff.
	pub replaced: Option<SessionId>,
}

/// Outcome of [`SessionRegistry::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
	/// The reported devices, decorated with their sessions.
	pub descriptors: Vec<DeviceDescriptor>,
	/// Sessions dropped because their path is gone.
	pub lost: Vec<LostSession>,
	/// Whether the decorated list differs from the previous one.
	pub changed: bool,
}

/// In-memory table of present devices and the session holding each.
///
/// Presence is tracked per enumeration source; a path counts as present while
/// any source still reports it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	present: BTreeMap<String, BTreeMap<DevicePath, DeviceDescriptor>>,
	sessions: BTreeMap<DevicePath, SessionInfo>,
	last_id: u64,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Grants exclusive ownership of `path`.
	///
	/// A live session is only replaced when `previous` names it exactly; the
	/// replaced id is reported in [`Grant::replaced`] and is dead from here on.
	pub fn acquire(&mut self, path: &DevicePath, previous: Option<&SessionId>, owner: CallerToken) -> Result<Grant> {
		if !self.is_present(path) {
			return Err(Error::DeviceDisconnected { path: path.clone() });
		}

		let replaced = match (self.sessions.get(path), previous) {
			(None, _) => None,
			(Some(current), Some(previous)) if current.session == *previous => Some(current.session.clone()),
			(Some(_), _) => return Err(Error::DeviceUsedElsewhere { path: path.clone() }),
		};

		let session = self.next_session();
		self.sessions.insert(
			path.clone(),
			SessionInfo {
				session: session.clone(),
				owner,
				acquired_at: now_millis(),
			},
		);

		Ok(Grant {
			path: path.clone(),
			session,
			replaced,
		})
	}

	/// Frees the slot held by `session` and returns its path.
	pub fn release(&mut self, session: &SessionId) -> Result<DevicePath> {
		let path = self.path_by_session(session).ok_or_else(|| Error::SessionNotFound { session: session.clone() })?;
		self.sessions.remove(&path);
		Ok(path)
	}

	/// Replaces the devices last reported by `source` with a fresh enumeration.
	///
	/// Other sources' devices are left alone. Sessions on paths no source
	/// reports any more are dropped and returned in [`Reconciled::lost`].
	pub fn reconcile(&mut self, source: &str, reported: Vec<DeviceDescriptor>) -> Reconciled {
		let before = self.descriptors();

		let listing: BTreeMap<DevicePath, DeviceDescriptor> = reported
			.into_iter()
			.map(|mut d| {
				d.session = None;
				(d.path.clone(), d)
			})
			.collect();
		if listing.is_empty() {
			self.present.remove(source);
		} else {
			self.present.insert(source.to_string(), listing);
		}

		let gone: Vec<DevicePath> = self.sessions.keys().filter(|path| !self.is_present(path)).cloned().collect();
		let lost = gone
			.into_iter()
			.filter_map(|path| self.sessions.remove(&path).map(|info| LostSession { path, session: info.session }))
			.collect();

		let changed = self.descriptors() != before;
		let descriptors = self.present.get(source).map(|listing| self.decorate(listing.values())).unwrap_or_default();
		Reconciled { descriptors, lost, changed }
	}

	/// Present devices from every source, each carrying its current session.
	pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
		let merged: BTreeMap<&DevicePath, &DeviceDescriptor> = self.present.values().flat_map(|listing| listing.iter()).collect();
		self.decorate(merged.into_values())
	}

	fn decorate<'a>(&self, listing: impl Iterator<Item = &'a DeviceDescriptor>) -> Vec<DeviceDescriptor> {
		listing
			.map(|d| {
				let mut d = d.clone();
				d.session = self.sessions.get(&d.path).map(|info| info.session.clone());
				d
			})
			.collect()
	}

	pub fn sessions_info(&self) -> SessionsInfo {
		self.sessions.clone()
	}

	pub fn path_by_session(&self, session: &SessionId) -> Option<DevicePath> {
		self.sessions.iter().find(|(_, info)| info.session == *session).map(|(path, _)| path.clone())
	}

	pub fn is_present(&self, path: &DevicePath) -> bool {
		self.present.values().any(|listing| listing.contains_key(path))
	}

	fn next_session(&mut self) -> SessionId {
		self.last_id += 1;
		SessionId::new(self.last_id.to_string())
	}
}

fn now_millis() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
