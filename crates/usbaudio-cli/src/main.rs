//! usbaudio CLI - drive the isochronous streaming engine from the shell.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "usbaudio")]
#[command(author, version, about = "USB audio isochronous streaming engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a duplex loopback against the simulated device
    Simulate(commands::simulate::SimulateArgs),

    /// Print or check stream settings
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so report output stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => commands::simulate::run(args),
        Commands::Config(args) => commands::config::run(args),
    }
}
