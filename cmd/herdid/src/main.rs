//! herdid - groups animal sightings into individuals.
//!
//! A run goes through three stages, each a subcommand over the same store:
//!
//!   - `cluster`: apply finished reviews, then cluster and queue conflicts
//!   - `pending` / `claim` / `resolve` / `await`: the review loop
//!   - `finalize`: apply reviews, assign identities, write the report

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{
    AwaitCommand, ClaimCommand, ClusterCommand, FinalizeCommand, HeartbeatCommand, HistoryCommand,
    PendingCommand, ReleaseCommand, ResolveCommand, StatsCommand,
};

/// Exit status of `finalize` when tracks span several identities.
const EXIT_STRUCTURAL_CONFLICT: u8 = 2;

/// Clusters animal sightings into individuals, with human review of the
/// ambiguous cases.
#[derive(Parser)]
#[command(name = "herdid")]
#[command(about = "Animal identity clustering and review")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Run name; prefixes every key in the store
    #[arg(long, global = true)]
    pub run: Option<String>,

    /// Store file (redb)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Annotation records (JSON array)
    #[arg(long, global = true)]
    pub annotations: Option<PathBuf>,

    /// Embeddings keyed by embedding_ref (JSON object)
    #[arg(long, global = true)]
    pub embeddings: Option<PathBuf>,

    /// Precomputed pair scores (JSON array)
    #[arg(long, global = true)]
    pub pairs: Option<PathBuf>,

    /// Minimum quality score for clustering
    #[arg(long, global = true)]
    pub identify_threshold: Option<f32>,

    /// Lead required to commit a merge without review
    #[arg(long, global = true)]
    pub margin: Option<f32>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<PathBuf>,

    /// Output as JSON instead of YAML
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply resolved reviews, then cluster and queue new conflicts
    Cluster(ClusterCommand),
    /// List pending conflicts
    Pending(PendingCommand),
    /// Reserve the next pending conflict for a reviewer
    Claim(ClaimCommand),
    /// Keep a claim from expiring
    Heartbeat(HeartbeatCommand),
    /// Record a review decision
    Resolve(ResolveCommand),
    /// Give up claims
    Release(ReleaseCommand),
    /// Queue summary
    Stats(StatsCommand),
    /// Status history of one pair
    History(HistoryCommand),
    /// Wait until every pending conflict is reviewed
    #[command(name = "await")]
    Await(AwaitCommand),
    /// Apply reviews, assign identities and write the report
    Finalize(FinalizeCommand),
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Runs the chosen command and returns the process exit status.
async fn execute(cli: &Cli) -> anyhow::Result<u8> {
    match &cli.command {
        Commands::Cluster(cmd) => cmd.run(cli)?,
        Commands::Pending(cmd) => cmd.run(cli)?,
        Commands::Claim(cmd) => cmd.run(cli)?,
        Commands::Heartbeat(cmd) => cmd.run(cli)?,
        Commands::Resolve(cmd) => cmd.run(cli)?,
        Commands::Release(cmd) => cmd.run(cli)?,
        Commands::Stats(cmd) => cmd.run(cli)?,
        Commands::History(cmd) => cmd.run(cli)?,
        Commands::Await(cmd) => cmd.run(cli).await?,
        Commands::Finalize(cmd) => {
            if !cmd.run(cli)? {
                return Ok(EXIT_STRUCTURAL_CONFLICT);
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    Ok(ExitCode::from(execute(&cli).await?))
}
