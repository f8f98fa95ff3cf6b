//! hwlink runtime - device backends, session arbitration and the transport facade
//!
//! This crate multiplexes many callers onto a few physical devices, each of
//! which accepts one exclusive session at a time:
//!
//! - **Backends**: chunk-level I/O over USB, the local bridge daemon, or the emulator
//! - **Session registry**: the path -> session table with handoff rules
//! - **Sessions background**: the single task that owns the registry, reachable
//!   in-process or over the daemon socket
//! - **Enumerator**: polling discovery and disconnect reconciliation
//! - **Transport**: `acquire`, `call`, `release` and device events for callers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │          Transport           │  acquire / call / release / listen
//! │  ┌──────────┐  ┌───────────┐ │
//! │  │ Backend  │  │ Sessions  │─┼──► SessionsBackground (local or daemon)
//! │  │ usb/brdg │  │  client   │ │          └─ SessionRegistry
//! │  │ emulator │  └───────────┘ │
//! │  └──────────┘                │
//! └──────────────────────────────┘
//! ```

pub mod backend;
pub mod config;
mod enumerator;
pub mod error;
pub mod registry;
pub mod sessions;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{Api, Backend, DeviceHandle};
pub use config::{BackendKind, Environment, TransportConfig};
pub use error::{Error, IoError, Result};
pub use registry::SessionRegistry;
pub use sessions::{Endpoint, IpcSessions, LocalSessions, SessionsBackground, SessionsClient, SessionsHandle, SessionsServer, SessionsSubscription};
pub use transport::{AcquireInput, CallInput, SessionState, Transport, TransportEvent};
