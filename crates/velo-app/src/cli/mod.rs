use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

mod jobs;

pub use jobs::{JobsArgs, JobsCommands, JobsReapArgs, JobsStatusArgs, JobsStatusFormat};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "velo",
    version,
    author,
    about = "Velo face redaction service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            command: None,
            verbose: 0,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the Velo HTTP server.
    Serve(ServeArgs),
    /// Run the redaction worker loop.
    Worker(WorkerArgs),
    /// Inspect or reap redaction jobs.
    Jobs(JobsArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct WorkerArgs;
