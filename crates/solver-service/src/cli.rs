//! Command-line interface definitions.

use clap::{Args as ClapArgs, Parser, Subcommand};
use solver_types::CacheExportMode;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "buildsolve")]
#[command(about = "Solve build graphs and export their results", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
	/// Path to configuration file
	#[arg(short, long, env = "BUILDSOLVE_CONFIG")]
	pub config: Option<PathBuf>,

	/// Log level override (trace, debug, info, warn, error)
	#[arg(short, long, env = "BUILDSOLVE_LOG_LEVEL")]
	pub log_level: Option<String>,

	/// Emit logs as JSON lines
	#[arg(long)]
	pub json_logs: bool,

	/// Subcommand to execute
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Solve a definition or frontend request and export the result
	Solve(SolveArgs),

	/// Validate the configuration
	#[command(about = "Load and validate a solver configuration")]
	Validate,

	/// Generate example configuration
	#[command(about = "Write the default configuration as TOML")]
	GenerateConfig {
		/// Output file path
		#[arg(short, long, default_value = "buildsolve.toml")]
		output: PathBuf,
	},
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct SolveArgs {
	/// JSON graph definition. With --frontend it is passed as the
	/// frontend's `definition` option instead.
	#[arg(short = 'f', long, value_name = "FILE")]
	pub definition: Option<PathBuf>,

	/// Frontend to solve with, e.g. multiplatform.v0
	#[arg(long)]
	pub frontend: Option<String>,

	/// Frontend option as key=value; repeatable
	#[arg(long = "opt", value_name = "KEY=VALUE", value_parser = parse_key_value)]
	pub opts: Vec<(String, String)>,

	/// Content exporter: local or image
	#[arg(long)]
	pub export: Option<String>,

	/// Destination directory for the local exporter
	#[arg(short, long, value_name = "DIR")]
	pub output: Option<PathBuf>,

	/// Name recorded by the image exporter
	#[arg(long)]
	pub image_name: Option<String>,

	/// Cache export destination, e.g. local:/var/cache/build
	#[arg(long, value_name = "REF")]
	pub cache_to: Option<String>,

	/// Cache import source; repeatable
	#[arg(long, value_name = "REF")]
	pub cache_from: Vec<String>,

	/// Cache export mode: min, max or remote-only
	#[arg(long)]
	pub cache_mode: Option<CacheExportMode>,

	/// Job id; generated when omitted
	#[arg(long)]
	pub job_id: Option<String>,

	/// Print vertex progress to stderr while solving
	#[arg(long)]
	pub progress: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
	s.split_once('=')
		.filter(|(k, _)| !k.is_empty())
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.ok_or_else(|| format!("expected KEY=VALUE, got {}", s))
}
