use clap::Parser;
use heal_proxy::{cli::Cli, logging, server};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = server::run(cli).await {
		error!(target = "heal", error = %err, "proxy exited with error");
		eprintln!("Error: {err:#}");
		std::process::exit(1);
	}
}
