use clap::Parser;
use ksvm::{
    cmd::Commands,
    config::{Config, Overrides},
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLine {
    #[clap(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./ksvm.toml when present)
    #[clap(long, short, env = "KSVM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[clap(long, num_args = 0, global = true)]
    debug: bool,

    #[clap(flatten)]
    overrides: Overrides,
}

pub fn main() -> ExitCode {
    // Parse command line options before we configure logging so we can set the
    // default level
    let command_line = CommandLine::parse();

    let default_filter = if command_line.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load(command_line.config.as_deref())
        .and_then(|config| config.with_overrides(&command_line.overrides))
    {
        Ok(config) => {
            debug!("Loaded: {:#?}", &config);
            config
        }
        Err(error) => {
            error!("Failed to load config: {:?}", error);
            return ExitCode::FAILURE;
        }
    };

    match command_line.command {
        Commands::Iso { command } => ksvm::cmd::iso::run(command, &config),
        Commands::Vm { command } => ksvm::cmd::vm::run(command, &config),
    }
}
