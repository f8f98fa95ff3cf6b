//! Logical protocol messages and the bridge's hex message body.

use serde::{Deserialize, Serialize};

use crate::chunk::CodecError;

/// Size of the `type || length` header used by the bridge body.
const BRIDGE_HEADER_LEN: usize = 6;

/// One logical message exchanged with a device.
///
/// The payload is opaque to this layer; firmware message schemas live above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	/// Message type identifier.
	#[serde(rename = "type")]
	pub message_type: u16,
	/// Raw message payload.
	#[serde(with = "hex_payload")]
	pub payload: Vec<u8>,
}

impl Message {
	pub fn new(message_type: u16, payload: impl Into<Vec<u8>>) -> Self {
		Self {
			message_type,
			payload: payload.into(),
		}
	}

	/// Encodes this message as a bridge request body.
	///
	/// Layout: `type: u16 BE || length: u32 BE || payload`, lowercase hex.
	pub fn to_bridge_hex(&self) -> Result<String, CodecError> {
		let length = u32::try_from(self.payload.len()).map_err(|_| CodecError::PayloadTooLarge { len: self.payload.len() })?;
		let mut raw = Vec::with_capacity(BRIDGE_HEADER_LEN + self.payload.len());
		raw.extend_from_slice(&self.message_type.to_be_bytes());
		raw.extend_from_slice(&length.to_be_bytes());
		raw.extend_from_slice(&self.payload);
		Ok(hex::encode(raw))
	}

	/// Decodes a bridge response body.
	pub fn from_bridge_hex(body: &str) -> Result<Self, CodecError> {
		let raw = hex::decode(body.trim()).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
		if raw.len() < BRIDGE_HEADER_LEN {
			return Err(CodecError::MalformedHeader { len: raw.len() });
		}

		let message_type = u16::from_be_bytes([raw[0], raw[1]]);
		let declared = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]) as usize;
		let payload = &raw[BRIDGE_HEADER_LEN..];
		if payload.len() != declared {
			return Err(CodecError::LengthMismatch {
				declared,
				actual: payload.len(),
			});
		}

		Ok(Self::new(message_type, payload))
	}
}

/// Serde helper carrying payload bytes as a hex string in JSON.
mod hex_payload {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&hex::encode(bytes))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s: String = Deserialize::deserialize(deserializer)?;
		hex::decode(s).map_err(serde::de::Error::custom)
	}
}
