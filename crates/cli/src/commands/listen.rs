use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::shutdown_signal;
use crate::context::CommandContext;
use crate::error::Result;
use crate::output::print_line;

/// Streams transport events as NDJSON until interrupted.
pub async fn execute(ctx: &CommandContext) -> Result<()> {
	let transport = ctx.transport().await?;
	let mut events = transport.subscribe();
	transport.listen();

	let signal = shutdown_signal();
	tokio::pin!(signal);

	let result = loop {
		tokio::select! {
			stop = &mut signal => break stop,
			event = events.recv() => match event {
				Ok(event) => {
					if let Err(err) = print_line(&event) {
						break Err(err.into());
					}
				}
				Err(RecvError::Lagged(skipped)) => {
					warn!(target = "hwlink.cli", skipped, "event stream lagged");
				}
				Err(RecvError::Closed) => break Ok(()),
			},
		}
	};

	transport.stop().await;
	result
}
