mod checkpoints;
mod run;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "weir", version, about = "Weir workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow definition file (JSON or YAML).
    Run(run::RunArgs),
    /// Resume a workflow from a stored checkpoint.
    Resume(run::ResumeArgs),
    /// Validate a workflow definition without executing it.
    Validate(validate::ValidateArgs),
    /// Inspect or delete stored checkpoints.
    #[command(subcommand)]
    Checkpoints(checkpoints::CheckpointCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    weir_core::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Run(args)) => run::run(args).await,
        Some(Command::Resume(args)) => run::resume(args).await,
        Some(Command::Validate(args)) => validate::validate(args).await,
        Some(Command::Checkpoints(command)) => checkpoints::checkpoints(command).await,
        None => {
            println!("weir v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
