use std::time::Duration;

use hwlink_protocol::Message;
use hwlink_runtime::{AcquireInput, CallInput, Transport};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::shutdown_signal;
use crate::cli::CallArgs;
use crate::context::CommandContext;
use crate::error::{CliError, Result};
use crate::output::{ResultBuilder, print_result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallData {
	path: String,
	session: String,
	#[serde(rename = "type")]
	message_type: u16,
	payload: String,
}

pub async fn execute(ctx: &CommandContext, args: CallArgs) -> Result<()> {
	let payload = decode_payload(&args.payload)?;
	let transport = ctx.transport().await?;

	let signal = CancellationToken::new();
	let interrupt = {
		let signal = signal.clone();
		tokio::spawn(async move {
			if shutdown_signal().await.is_ok() {
				signal.cancel();
			}
		})
	};

	let result = exchange(&transport, &args, payload, signal).await;
	interrupt.abort();
	transport.stop().await;

	let (session, reply) = result?;
	let data = CallData {
		path: args.path,
		session,
		message_type: reply.message_type,
		payload: hex::encode(&reply.payload),
	};
	print_result(&ResultBuilder::new("call").data(data).build());
	Ok(())
}

/// Acquire, one round trip, release. The session is released even when the call fails.
async fn exchange(transport: &Transport, args: &CallArgs, payload: Vec<u8>, signal: CancellationToken) -> Result<(String, Message)> {
	transport.enumerate().await?;

	let mut acquire = AcquireInput::new(args.path.as_str());
	if let Some(previous) = &args.previous {
		acquire = acquire.with_previous(previous.as_str());
	}
	let session = transport.acquire(acquire).await?;
	debug!(target = "hwlink.cli", path = %args.path, %session, "acquired");

	let mut call = CallInput::new(session.clone(), args.message_type, payload).with_signal(signal);
	if let Some(ms) = args.timeout_ms {
		call = call.with_timeout(Duration::from_millis(ms));
	}
	let reply = transport.call(call).await;

	if let Err(err) = transport.release(&session).await {
		warn!(target = "hwlink.cli", %session, error = %err, "release failed");
	}
	Ok((session.to_string(), reply?))
}

fn decode_payload(text: &str) -> Result<Vec<u8>> {
	let text = text.trim();
	let text = text.strip_prefix("0x").unwrap_or(text);
	hex::decode(text).map_err(|e| CliError::InvalidInput(format!("payload is not hex: {e}")))
}
