//! Polling device enumerator behind [`crate::Transport::listen`].
//!
//! Each pass lists devices on the backend, reconciles them with the sessions
//! background, then emits events for the difference to the previous pass.
//! Sessions lost in a pass are reported before any disconnect of that pass.

use std::sync::Weak;

use hwlink_protocol::{DescriptorDiff, DeviceDescriptor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::Inner;

pub(crate) async fn run(inner: Weak<Inner>, shutdown: CancellationToken) {
	let mut known: Option<Vec<DeviceDescriptor>> = None;
	info!(target = "hwlink.enumerator", "listening for device changes");

	loop {
		let Some(transport) = inner.upgrade() else {
			return;
		};
		let interval = transport.config.listen_interval();

		match transport.enumerate_pass().await {
			Ok((descriptors, lost)) => {
				let previous = match known.take() {
					Some(previous) => previous,
					None if transport.config.pending_transport_event => Vec::new(),
					None => descriptors.clone(),
				};
				let diff = DescriptorDiff::between(&previous, &descriptors);
				if !diff.is_empty() || !lost.is_empty() {
					debug!(
						target = "hwlink.enumerator",
						connected = diff.connected.len(),
						disconnected = diff.disconnected.len(),
						lost = lost.len(),
						"devices changed"
					);
				}
				let closing = transport.emit_pass(lost, &diff);
				transport.close_all(closing).await;
				known = Some(descriptors);
			}
			Err(err) if transport.config.transport_reconnect => {
				debug!(target = "hwlink.enumerator", error = %err, "enumeration failed, retrying");
			}
			Err(err) => {
				warn!(target = "hwlink.enumerator", error = %err, "enumeration failed, listener stopped");
				return;
			}
		}
		drop(transport);

		tokio::select! {
			_ = shutdown.cancelled() => return,
			_ = tokio::time::sleep(interval) => {}
		}
	}
}
