mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = dispatch(cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    tracing::debug!(cwd = %cwd.display(), command = cli.command.name(), "Dispatching");
    match cli.command {
        Command::Run(args) => commands::run::run(args, cwd).await,
        Command::Check => commands::check::check(cwd).await,
        Command::Config(args) => commands::config::config(args, cwd).await,
        Command::Decode(args) => commands::decode::decode(args),
    }
}

/// `TUNSOCKS_LOG` takes an `EnvFilter` directive (e.g.
/// `tunsocks_bridge=trace`) and wins over `-v`. A directive that fails to
/// parse falls back to the `-v` level.
fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let (filter, rejected) = match std::env::var("TUNSOCKS_LOG") {
        Ok(directive) => match EnvFilter::try_new(&directive) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new(level), Some((directive, e))),
        },
        Err(_) => (EnvFilter::new(level), None),
    };
    let resolved = filter.to_string();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some((directive, e)) = rejected {
        tracing::warn!(directive = %directive, error = %e, "Ignoring invalid TUNSOCKS_LOG");
    }
    tracing::debug!(filter = %resolved, "Logging initialised");
}
