//! Device descriptors, session identifiers and enumeration diffs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_newtype {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			pub fn new(value: impl Into<String>) -> Self {
				Self(value.into())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $name {
			fn from(value: &str) -> Self {
				Self(value.to_string())
			}
		}

		impl From<String> for $name {
			fn from(value: String) -> Self {
				Self(value)
			}
		}
	};
}

string_newtype!(
	/// Stable identity of one physical connection (e.g. `"1-4"` for USB bus 1 address 4).
	DevicePath
);
string_newtype!(
	/// Opaque session identifier issued by the sessions registry.
	SessionId
);
string_newtype!(
	/// Identifies an independent caller sharing the sessions background.
	///
	/// Used for ownership reporting only.
	CallerToken
);

/// One device as reported by enumeration, decorated with its current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
	pub path: DevicePath,
	/// USB vendor id, or a bridge-assigned value.
	#[serde(default)]
	pub vendor: u16,
	/// USB product id, or a bridge-assigned value.
	#[serde(default)]
	pub product: u16,
	/// Session currently holding the device.
	#[serde(default)]
	pub session: Option<SessionId>,
	/// Whether this is a debug-link interface.
	#[serde(default)]
	pub debug: bool,
	/// Session holding the debug link, when the backend reports one.
	#[serde(default)]
	pub debug_session: Option<SessionId>,
}

impl DeviceDescriptor {
	pub fn new(path: impl Into<DevicePath>) -> Self {
		Self {
			path: path.into(),
			vendor: 0,
			product: 0,
			session: None,
			debug: false,
			debug_session: None,
		}
	}

	pub fn with_ids(mut self, vendor: u16, product: u16) -> Self {
		self.vendor = vendor;
		self.product = product;
		self
	}
}

/// Ownership snapshot for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
	pub session: SessionId,
	pub owner: CallerToken,
	/// Unix epoch milliseconds when the session was granted.
	pub acquired_at: u64,
}

/// Snapshot returned by `getSessionsInfo`.
pub type SessionsInfo = BTreeMap<DevicePath, SessionInfo>;

/// Difference between two consecutive enumerations, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDiff {
	/// Paths present now but not before.
	pub connected: Vec<DeviceDescriptor>,
	/// Paths present before but not now, as last seen.
	pub disconnected: Vec<DeviceDescriptor>,
	/// Paths whose session went from none to some.
	pub acquired: Vec<DeviceDescriptor>,
	/// Paths whose session went from some to none.
	pub released: Vec<DeviceDescriptor>,
}

impl DescriptorDiff {
	/// Computes the diff by set difference on `path`, never by object identity.
	pub fn between(previous: &[DeviceDescriptor], current: &[DeviceDescriptor]) -> Self {
		let before: HashMap<&DevicePath, &DeviceDescriptor> = previous.iter().map(|d| (&d.path, d)).collect();
		let after: HashMap<&DevicePath, &DeviceDescriptor> = current.iter().map(|d| (&d.path, d)).collect();

		let mut diff = Self::default();
		for descriptor in current {
			match before.get(&descriptor.path) {
				None => diff.connected.push(descriptor.clone()),
				Some(old) => match (&old.session, &descriptor.session) {
					(None, Some(_)) => diff.acquired.push(descriptor.clone()),
					(Some(_), None) => diff.released.push(descriptor.clone()),
					_ => {}
				},
			}
		}
		for descriptor in previous {
			if !after.contains_key(&descriptor.path) {
				diff.disconnected.push(descriptor.clone());
			}
		}

		diff
	}

	pub fn is_empty(&self) -> bool {
		self.connected.is_empty() && self.disconnected.is_empty() && self.acquired.is_empty() && self.released.is_empty()
	}
}
