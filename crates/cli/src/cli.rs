use std::path::PathBuf;

use clap::Parser;

/// Intercepting CDP proxy: sits between an automation client and a real
/// browser's remote-debugging endpoint and records broken locators.
#[derive(Parser, Debug)]
#[command(name = "heal-proxy", version, about)]
pub struct Cli {
	/// Interface the proxy listens on
	#[arg(long, default_value = "127.0.0.1")]
	pub host: String,

	/// Port the proxy listens on
	#[arg(short, long, default_value_t = 9223)]
	pub port: u16,

	/// HTTP base URL of the real browser's remote-debugging endpoint
	#[arg(long, default_value = "http://localhost:9222")]
	pub browser_url: String,

	/// File broken-locator reports are appended to, one JSON object per line
	#[arg(long, default_value = "broken-locators.jsonl")]
	pub report_file: PathBuf,

	/// Also dump every relayed frame to this file (for debugging)
	#[arg(long)]
	pub dump_file: Option<PathBuf>,

	/// Increase log verbosity (-v, -vv)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,
}
