mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// Default state database used when no pipeline file names one.
const DEFAULT_STATE_DB: &str = ".gantry/state.db";

#[derive(Parser)]
#[command(
    name = "gantry",
    version,
    about = "Vendor-neutral CI pipeline orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more pipelines for a trigger
    Run {
        /// Paths to pipeline YAML files
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
        /// Branch or pull-request ref that triggered the run
        #[arg(long = "ref")]
        git_ref: String,
        /// Commit being tested
        #[arg(long)]
        commit: String,
        /// Treat the ref as protected (never superseded)
        #[arg(long)]
        protected: bool,
    },
    /// Validate a pipeline and probe its state backend and workspace
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Print the instances and stage order a pipeline expands to
    Plan {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List recorded runs
    Runs {
        /// State database
        #[arg(long, default_value = DEFAULT_STATE_DB)]
        state: PathBuf,
        /// Only runs of this pipeline
        #[arg(long)]
        pipeline: Option<String>,
        /// Only runs for this ref
        #[arg(long = "ref")]
        git_ref: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Also list each run's instances
        #[arg(long)]
        instances: bool,
    },
    /// Cancel a run (no-op if it already finished)
    Cancel {
        /// Run id as shown by `gantry runs`
        run_id: i64,
        /// State database
        #[arg(long, default_value = DEFAULT_STATE_DB)]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipelines,
            git_ref,
            commit,
            protected,
        } => commands::run::execute(&pipelines, &git_ref, &commit, protected).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
        Commands::Plan { pipeline } => commands::plan::execute(&pipeline),
        Commands::Runs {
            state,
            pipeline,
            git_ref,
            limit,
            instances,
        } => commands::runs::execute(&state, pipeline, git_ref, limit, instances),
        Commands::Cancel { run_id, state } => commands::cancel::execute(&state, run_id),
    }
}
