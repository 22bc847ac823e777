//! CLI for the brig VM sandbox.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod inspect;
mod run;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the host log filter.
const LOG_ENV: &str = "BRIG_LOG";

#[derive(Parser)]
#[command(
    name = "brig",
    version,
    about = "Run a command inside a throwaway user-mode Linux guest"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a guest, run one command in it, and exit with its status.
    Run(Box<run::RunArgs>),

    /// Decode and print a configuration image.
    Inspect(inspect::InspectArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity());
    match cli.dispatch() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("brig: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Host-side subscriber: `BRIG_LOG` wins, else `-v` picks the level.
fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity).unwrap_or("warn")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Log level for a `-v` count; `None` below one.
pub(crate) const fn level_for(verbosity: u8) -> Option<&'static str> {
    match verbosity {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

impl Cli {
    /// `-v` count of the chosen subcommand.
    fn verbosity(&self) -> u8 {
        match &self.command {
            Command::Run(args) => args.verbose,
            Command::Inspect(_) | Command::Completion { .. } => 0,
        }
    }

    /// Runs the subcommand, returning the process exit code.
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Run(args) => args.run(),
            Command::Inspect(args) => args.run().map(|()| 0),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "brig", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}
