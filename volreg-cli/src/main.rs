//! volreg CLI - worker entry point and operator tools.
//!
//! `volreg run` starts one worker process; launch the same command on as
//! many machines or shells as you like against the same output directory
//! and they will coordinate through the filesystem alone.

use clap::{Parser, Subcommand};

mod commands;
mod error;

#[derive(Parser)]
#[command(name = "volreg")]
#[command(about = "Filesystem-coordinated multi-stage volume registration", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one worker process of the registration pipeline
    Run(commands::run::RunArgs),
    /// Build the voxel-wise mean of a directory of volumes
    Average(commands::average::AverageArgs),
    /// Validate a pipeline configuration file
    Check(commands::check::CheckArgs),
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => commands::run::execute(args),
        Command::Average(args) => commands::average::execute(args),
        Command::Check(args) => commands::check::execute(args),
    };

    if let Err(e) = result {
        e.exit();
    }
}
