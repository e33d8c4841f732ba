use clap::{ArgAction, Args, Subcommand, ValueEnum};

/// Redaction job management command namespace.
#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommands,
}

/// Supported job subcommands.
#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// Display counts for pending, processing, completed, and failed jobs.
    Status(JobsStatusArgs),
    /// Return expired-lease jobs to pending (or fail exhausted ones).
    Reap(JobsReapArgs),
}

/// Options for the `jobs status` command.
#[derive(Debug, Args)]
pub struct JobsStatusArgs {
    /// Output format (json or table).
    #[arg(long, default_value = "table")]
    pub format: JobsStatusFormat,
}

/// Format for jobs status output.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JobsStatusFormat {
    Json,
    Table,
}

/// Options for the `jobs reap` command.
#[derive(Debug, Args)]
pub struct JobsReapArgs {
    /// Dry run mode (report without modifying jobs).
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}
