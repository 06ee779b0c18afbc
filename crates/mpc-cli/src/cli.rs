use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mpc",
    about = "MAPI proxy stream cache tools",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the messages, attachments and streams in a cache
    Index(IndexArgs),
    /// Check every complete stream against its blob
    Verify(VerifyArgs),
    /// Run a recorded trace through the cache
    Replay(ReplayArgs),
}

#[derive(Args)]
pub struct IndexArgs {
    /// Cache root directory
    #[arg(long)]
    pub root: PathBuf,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Cache root directory
    #[arg(long)]
    pub root: PathBuf,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Cache configuration file; an in-memory cache is used without one
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// JSON trace of recorded exchanges
    pub trace: PathBuf,
}
