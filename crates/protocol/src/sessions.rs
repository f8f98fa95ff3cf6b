//! Messages exchanged with the sessions background.
//!
//! The sessions background is the single writer of the path -> session
//! mapping. Clients talk to it either in-process or over a local socket; in
//! both cases the shapes below are what travels. Over a socket every message
//! is one line of JSON:
//!
//! 1. Client sends one [`SessionsRequest`]
//! 2. Background answers with one [`SessionsResponse`]
//! 3. After [`SessionsRequest::Subscribe`] the connection instead carries a
//!    stream of [`SessionsEvent`] lines until the client disconnects

use serde::{Deserialize, Serialize};

use crate::device::{CallerToken, DeviceDescriptor, DevicePath, SessionId, SessionsInfo};

/// Request sent by a client to the sessions background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionsRequest {
	/// Liveness and version check.
	Handshake,
	/// Reports a fresh enumeration; the background reconciles sessions with it.
	///
	/// Each `source` replaces only the devices it reported last time, so
	/// callers on different backends can share one background.
	Enumerate {
		/// Backend kind that produced the listing (`usb`, `bridge`, `emulator`).
		#[serde(default)]
		source: String,
		/// Devices physically present, as seen by the reporting backend.
		descriptors: Vec<DeviceDescriptor>,
	},
	/// Asks for exclusive ownership of `path`.
	Acquire {
		path: DevicePath,
		/// Session the caller believes it holds, enabling cooperative handoff.
		#[serde(default)]
		previous: Option<SessionId>,
		owner: CallerToken,
	},
	/// Gives up a session.
	Release { session: SessionId },
	/// Read-only ownership snapshot.
	GetSessions,
	/// Resolves the path a session is bound to.
	GetPathBySession { session: SessionId },
	/// Switches the connection to an event stream.
	Subscribe,
	/// Stops the background.
	Shutdown,
}

/// Response sent by the sessions background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionsResponse {
	Handshake {
		/// Background version for compatibility checks.
		version: String,
	},
	Enumerated {
		/// The reported devices, each decorated with its current session.
		descriptors: Vec<DeviceDescriptor>,
		/// Sessions invalidated because their path disappeared.
		lost: Vec<LostSession>,
	},
	Acquired {
		path: DevicePath,
		session: SessionId,
		/// Session taken over by this grant; the device may still be open under it.
		#[serde(default)]
		replaced: Option<SessionId>,
	},
	Released {
		path: DevicePath,
		session: SessionId,
	},
	Sessions {
		sessions: SessionsInfo,
	},
	Path {
		path: Option<DevicePath>,
	},
	Subscribed,
	Ok,
	/// The request failed. `code` is a stable snake_case identifier.
	Error {
		code: String,
		message: String,
	},
}

/// A session that stopped being valid without being released by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostSession {
	pub path: DevicePath,
	pub session: SessionId,
}

/// Why a session stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
	/// Its owner released it.
	Released,
	/// A caller presenting it as `previous` took the device over.
	Handoff,
	/// Its device disappeared from enumeration.
	Disconnected,
}

/// Event pushed by the sessions background to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionsEvent {
	/// A session is no longer valid; any handle bound to it must be closed.
	Invalidated {
		path: DevicePath,
		session: SessionId,
		reason: InvalidationReason,
	},
	/// The decorated descriptor list changed (presence or ownership).
	DescriptorsChanged { descriptors: Vec<DeviceDescriptor> },
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_wire_shape() {
		let request = SessionsRequest::Acquire {
			path: "1-4".into(),
			previous: None,
			owner: "tab-1".into(),
		};
		let json = serde_json::to_value(&request).unwrap();
		assert_eq!(
			json,
			serde_json::json!({"type": "acquire", "path": "1-4", "previous": null, "owner": "tab-1"})
		);
	}

	#[test]
	fn acquire_previous_defaults_to_none() {
		let request: SessionsRequest = serde_json::from_str(r#"{"type":"acquire","path":"p","owner":"o"}"#).unwrap();
		assert!(matches!(request, SessionsRequest::Acquire { previous: None, .. }));
	}

	#[test]
	fn enumerate_source_defaults_to_empty() {
		let request: SessionsRequest = serde_json::from_str(r#"{"type":"enumerate","descriptors":[]}"#).unwrap();
		assert_eq!(
			request,
			SessionsRequest::Enumerate {
				source: String::new(),
				descriptors: Vec::new()
			}
		);
	}

	#[test]
	fn unit_requests_parse() {
		let request: SessionsRequest = serde_json::from_str(r#"{"type":"get_sessions"}"#).unwrap();
		assert_eq!(request, SessionsRequest::GetSessions);
	}

	#[test]
	fn event_wire_shape() {
		let event = SessionsEvent::Invalidated {
			path: "1-4".into(),
			session: "3".into(),
			reason: InvalidationReason::Handoff,
		};
		let line = serde_json::to_string(&event).unwrap();
		assert_eq!(line, r#"{"event":"invalidated","path":"1-4","session":"3","reason":"handoff"}"#);
	}

	#[test]
	fn error_response_round_trips() {
		let response = SessionsResponse::Error {
			code: "device_used_elsewhere".to_string(),
			message: "in use".to_string(),
		};
		let back: SessionsResponse = serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
		assert_eq!(back, response);
	}
}
