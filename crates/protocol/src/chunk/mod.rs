//! Fixed-size chunk framing for USB and emulator links.
//!
//! A logical [`Message`] travels as a sequence of equally sized chunks. Every
//! chunk starts with the report marker `'?'`. The first chunk of a message
//! (the head) continues with `"##"`, the message type as a big-endian `u16`
//! and the payload length as a big-endian `u32`:
//!
//! ```text
//! head:          '?' '#' '#' [type: 2] [length: 4] [payload ...........]
//! continuation:  '?' [payload .......................................]
//! ```
//!
//! The last chunk is zero-padded to the chunk size, so trailing bytes beyond
//! the declared length are ignored on decode.


use thiserror::Error;

use crate::message::Message;

/// Chunk size spoken by USB and emulator devices.
pub const CHUNK_SIZE: usize = 64;
/// Smallest chunk able to carry a head header and one payload byte.
pub const MIN_CHUNK_SIZE: usize = HEAD_HEADER_LEN + 1;
/// Upper bound on a declared payload length accepted by a [`Decoder`].
pub const DEFAULT_MAX_MESSAGE_LEN: u32 = 32 * 1024 * 1024;

const REPORT_MARKER: u8 = b'?';
const HEAD_MAGIC: [u8; 2] = *b"##";
const HEAD_HEADER_LEN: usize = 9;

/// Errors produced while framing or reassembling messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
	/// A chunk arrived where a head chunk was required.
	#[error("unexpected chunk boundary: continuation chunk without a head chunk")]
	UnexpectedChunkBoundary,

	/// A zero-length chunk was read.
	#[error("empty chunk")]
	EmptyChunk,

	/// The chunk does not start with the report marker.
	#[error("chunk does not start with the report marker (got 0x{found:02x})")]
	MissingMarker { found: u8 },

	/// The header is shorter than required.
	#[error("malformed header: {len} bytes")]
	MalformedHeader { len: usize },

	/// The declared payload length exceeds the configured limit.
	#[error("declared message length {declared} exceeds limit {limit}")]
	LengthTooLarge { declared: u32, limit: u32 },

	/// The declared payload length does not match the bytes received.
	#[error("declared message length {declared} does not match payload length {actual}")]
	LengthMismatch { declared: usize, actual: usize },

	/// The payload cannot be described by a 32-bit length.
	#[error("payload of {len} bytes is too large to frame")]
	PayloadTooLarge { len: usize },

	/// The chunk stream ended before the message was complete.
	#[error("chunk stream ended after {received} of {expected} payload bytes")]
	Truncated { expected: usize, received: usize },

	/// A bridge body was not valid hex.
	#[error("invalid hex body: {0}")]
	InvalidHex(String),
}

/// One wire chunk. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk(Vec<u8>);

impl Chunk {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn into_vec(self) -> Vec<u8> {
		self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Always `false`; present for API symmetry with `len`.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Returns `true` for the first chunk of a message.
	pub fn is_head(&self) -> bool {
		is_head(&self.0)
	}
}

impl AsRef<[u8]> for Chunk {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

/// Chunk framing parameters for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
	chunk_size: usize,
	max_message_len: u32,
}

impl Default for ChunkCodec {
	fn default() -> Self {
		Self::new(CHUNK_SIZE)
	}
}

impl ChunkCodec {
	/// Creates a codec for `chunk_size`-byte chunks (at least [`MIN_CHUNK_SIZE`]).
	pub fn new(chunk_size: usize) -> Self {
		Self {
			chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
			max_message_len: DEFAULT_MAX_MESSAGE_LEN,
		}
	}

	pub fn with_max_message_len(mut self, max_message_len: u32) -> Self {
		self.max_message_len = max_message_len;
		self
	}

	pub fn chunk_size(&self) -> usize {
		self.chunk_size
	}

	/// Splits a message into chunks.
	pub fn encode(&self, message_type: u16, payload: &[u8]) -> Result<Vec<Chunk>, CodecError> {
		let length = u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge { len: payload.len() })?;

		let head_room = self.chunk_size - HEAD_HEADER_LEN;
		let cont_room = self.chunk_size - 1;
		let (first, rest) = payload.split_at(payload.len().min(head_room));

		let mut chunks = Vec::with_capacity(1 + rest.len().div_ceil(cont_room));

		let mut head = Vec::with_capacity(self.chunk_size);
		head.push(REPORT_MARKER);
		head.extend_from_slice(&HEAD_MAGIC);
		head.extend_from_slice(&message_type.to_be_bytes());
		head.extend_from_slice(&length.to_be_bytes());
		head.extend_from_slice(first);
		head.resize(self.chunk_size, 0);
		chunks.push(Chunk(head));

		for slice in rest.chunks(cont_room) {
			let mut chunk = Vec::with_capacity(self.chunk_size);
			chunk.push(REPORT_MARKER);
			chunk.extend_from_slice(slice);
			chunk.resize(self.chunk_size, 0);
			chunks.push(Chunk(chunk));
		}

		Ok(chunks)
	}

	/// Encodes a [`Message`].
	pub fn encode_message(&self, message: &Message) -> Result<Vec<Chunk>, CodecError> {
		self.encode(message.message_type, &message.payload)
	}

	/// Returns a fresh reassembly state bound to this codec's limits.
	pub fn decoder(&self) -> Decoder {
		Decoder::new(self.max_message_len)
	}

	/// Decodes exactly one message from a complete chunk sequence.
	pub fn decode<I, C>(&self, chunks: I) -> Result<Message, CodecError>
	where
		I: IntoIterator<Item = C>,
		C: AsRef<[u8]>,
	{
		let mut decoder = self.decoder();
		let mut chunks = chunks.into_iter();

		for chunk in chunks.by_ref() {
			if let Some(message) = decoder.push(chunk.as_ref())? {
				if chunks.next().is_some() {
					return Err(CodecError::UnexpectedChunkBoundary);
				}
				return Ok(message);
			}
		}

		Err(decoder.truncated())
	}
}

/// Message currently being reassembled.
#[derive(Debug)]
struct Pending {
	message_type: u16,
	expected: usize,
	payload: Vec<u8>,
}

/// Stateful chunk reassembly.
///
/// Chunks of one message must arrive in order and before any chunk of the
/// next. Any error resets the decoder to idle.
#[derive(Debug)]
pub struct Decoder {
	max_message_len: u32,
	pending: Option<Pending>,
}

impl Default for Decoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_MESSAGE_LEN)
	}
}

impl Decoder {
	pub fn new(max_message_len: u32) -> Self {
		Self {
			max_message_len,
			pending: None,
		}
	}

	/// Returns `true` when no message is partially assembled.
	pub fn is_idle(&self) -> bool {
		self.pending.is_none()
	}

	/// Drops any partially assembled message.
	pub fn reset(&mut self) {
		self.pending = None;
	}

	/// Feeds one chunk; returns the message once its last chunk arrives.
	pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Message>, CodecError> {
		let result = self.push_inner(chunk);
		if result.is_err() {
			self.pending = None;
		}
		result
	}

	fn push_inner(&mut self, chunk: &[u8]) -> Result<Option<Message>, CodecError> {
		let Some(&marker) = chunk.first() else {
			return Err(CodecError::EmptyChunk);
		};
		if marker != REPORT_MARKER {
			return Err(CodecError::MissingMarker { found: marker });
		}

		let pending = match self.pending.take() {
			Some(mut pending) => {
				let want = pending.expected - pending.payload.len();
				let data = &chunk[1..];
				pending.payload.extend_from_slice(&data[..data.len().min(want)]);
				pending
			}
			None => {
				if !is_head(chunk) {
					return Err(CodecError::UnexpectedChunkBoundary);
				}
				if chunk.len() < HEAD_HEADER_LEN {
					return Err(CodecError::MalformedHeader { len: chunk.len() });
				}

				let message_type = u16::from_be_bytes([chunk[3], chunk[4]]);
				let declared = u32::from_be_bytes([chunk[5], chunk[6], chunk[7], chunk[8]]);
				if declared > self.max_message_len {
					return Err(CodecError::LengthTooLarge {
						declared,
						limit: self.max_message_len,
					});
				}

				let expected = declared as usize;
				let data = &chunk[HEAD_HEADER_LEN..];
				let mut payload = Vec::with_capacity(expected.min(64 * 1024));
				payload.extend_from_slice(&data[..data.len().min(expected)]);
				Pending {
					message_type,
					expected,
					payload,
				}
			}
		};

		if pending.payload.len() == pending.expected {
			return Ok(Some(Message::new(pending.message_type, pending.payload)));
		}

		self.pending = Some(pending);
		Ok(None)
	}

	/// Error describing an incomplete stream in the current state.
	fn truncated(&self) -> CodecError {
		match &self.pending {
			Some(pending) => CodecError::Truncated {
				expected: pending.expected,
				received: pending.payload.len(),
			},
			None => CodecError::Truncated { expected: 0, received: 0 },
		}
	}
}

fn is_head(chunk: &[u8]) -> bool {
	chunk.len() >= 3 && chunk[0] == REPORT_MARKER && chunk[1..3] == HEAD_MAGIC
}
