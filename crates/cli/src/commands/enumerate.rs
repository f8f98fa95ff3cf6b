use crate::context::CommandContext;
use crate::error::Result;
use crate::output::{ResultBuilder, print_result};

pub async fn execute(ctx: &CommandContext) -> Result<()> {
	let transport = ctx.transport().await?;
	let devices = transport.enumerate().await;
	transport.stop().await;

	print_result(&ResultBuilder::new("enumerate").data(devices?).build());
	Ok(())
}
