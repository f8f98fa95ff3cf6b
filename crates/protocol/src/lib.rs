//! Wire types for hwlink.
//!
//! This crate contains the data shapes that cross a boundary: the chunk
//! framing spoken by USB and emulator devices, the hex message body spoken
//! by the bridge daemon, device descriptors as reported by enumeration, and
//! the request/response/event messages exchanged with the sessions
//! background that arbitrates device ownership.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: no I/O, no async, no global state
//! - **1:1 with the wire**: field names and byte layouts match what peers expect
//! - **Stable**: changes only when a wire format changes
//!
//! Session arbitration and device I/O are built on top of these types in
//! `hwlink-runtime`.

pub mod chunk;
pub mod device;
pub mod message;
pub mod sessions;

pub use chunk::{CHUNK_SIZE, Chunk, ChunkCodec, CodecError, DEFAULT_MAX_MESSAGE_LEN, Decoder};
pub use device::{CallerToken, DescriptorDiff, DeviceDescriptor, DevicePath, SessionId, SessionInfo, SessionsInfo};
pub use message::Message;
pub use sessions::{InvalidationReason, LostSession, SessionsEvent, SessionsRequest, SessionsResponse};
