use clap::Parser;
use hwlink_cli::cli::Cli;
use hwlink_cli::error::CliError;
use hwlink_cli::output::{self, CommandResult, ResultBuilder};
use hwlink_cli::{commands, logging};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let command = cli.command.name();
	if let Err(err) = commands::dispatch(cli).await {
		handle_error(err, command);
		std::process::exit(1);
	}
}

fn handle_error(err: CliError, command: &str) {
	let cmd_error = err.to_command_error();

	// Humans read stderr, agents read the envelope on stdout.
	output::print_error_stderr(&cmd_error);
	let result: CommandResult<()> = ResultBuilder::new(command).error(cmd_error).build();
	output::print_result(&result);
}
