use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use testloom::step::Step;

mod cmd;

#[derive(Parser)]
#[command(name = "testloom")]
#[command(version, about = "Human-in-the-loop test artifact pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Root directory for trace state and frozen artifacts
    #[arg(long, global = true)]
    pub out_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run or resume the pipeline for a trace
    Run {
        /// Trace identifier (doubles as the trace directory name)
        #[arg(short, long)]
        trace_id: String,

        /// Default epic title offered when collecting a fresh epic
        #[arg(long)]
        epic_title: Option<String>,

        /// Start directly at this step (earlier steps must be confirmed)
        #[arg(long)]
        start_step: Option<Step>,

        /// Directory of prompt template overrides
        #[arg(long)]
        prompts_dir: Option<PathBuf>,
    },
    /// List traces and where each one stands
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let out_dir = cli.out_dir.clone().unwrap_or_else(cmd::default_out_dir);

    match &cli.command {
        Commands::Run {
            trace_id,
            epic_title,
            start_step,
            prompts_dir,
        } => cmd::cmd_run(
            &out_dir,
            trace_id,
            epic_title.as_deref(),
            *start_step,
            prompts_dir.as_deref(),
        ),
        Commands::Status => cmd::cmd_status(&out_dir),
    }
}
