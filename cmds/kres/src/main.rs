use anyhow::Result;
use clap::{Parser, Subcommand};
use kres::{
	commands::{self, util::BrokenPipeGuard},
	telemetry::{self, LogFormat},
};

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "kres")]
#[command(about = "Kubernetes resource lifecycle for rendered manifests", long_about = None)]
#[command(version = env!("KRES_VERSION"))]
struct Cli {
	/// Log level (error, warn, info, debug, trace). Overrides RUST_LOG
	#[arg(long, global = true)]
	log_level: Option<tracing::Level>,

	/// Log line format
	#[arg(long, global = true, default_value = "auto", value_enum)]
	log_format: LogFormat,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Create, update and delete resources to match a manifests file
	Apply(commands::apply::ApplyArgs),

	/// Differences between the manifests file and the cluster
	Plan(commands::plan::PlanArgs),

	/// Delete a single resource by ID
	Delete(commands::delete::DeleteArgs),

	/// Adopt an existing resource by ID
	Import(commands::import::ImportArgs),

	/// Refresh the state file from the cluster
	Read(commands::read::ReadArgs),
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	let _telemetry = telemetry::init(cli.log_level, cli.log_format)?;

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	match cli.command {
		Commands::Apply(args) => commands::apply::run(args, stdout),
		Commands::Plan(args) => commands::plan::run(args, stdout),
		Commands::Delete(args) => commands::delete::run(args, stdout),
		Commands::Import(args) => commands::import::run(args, stdout),
		Commands::Read(args) => commands::read::run(args, stdout),
	}
}
