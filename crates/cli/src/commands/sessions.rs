use crate::context::CommandContext;
use crate::error::Result;
use crate::output::{ResultBuilder, print_result};

/// Ownership snapshot. Without a daemon this only covers the current process, so it is empty.
pub async fn execute(ctx: &CommandContext) -> Result<()> {
	let sessions = ctx.sessions().await;
	let info = sessions.sessions_info().await?;

	print_result(&ResultBuilder::new("sessions").data(info).build());
	Ok(())
}
