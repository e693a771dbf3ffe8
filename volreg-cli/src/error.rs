//! CLI error handling with user-facing messages and exit codes.

use std::fmt;
use std::path::PathBuf;
use std::process;

use volreg::average::AverageError;
use volreg::config::ConfigError;
use volreg::pipeline::PipelineError;
use volreg::volume::VolumeError;

/// CLI-level errors, each mapped to a message and exit code 1.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    Logging(std::io::Error),
    /// Configuration error
    Config(ConfigError),
    /// Pipeline run failed
    Pipeline(PipelineError),
    /// Average construction failed
    Average(AverageError),
    /// Failed to write an output volume
    VolumeWrite { path: PathBuf, source: VolumeError },
}

impl CliError {
    /// Exits the process with an error message and, where useful, a hint.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Pipeline(PipelineError::Coordinator(_)) = self {
            eprintln!();
            eprintln!("Markers for completed work remain on disk; re-running the same");
            eprintln!("command resumes the pipeline where it left off.");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Logging(e) => write!(f, "failed to initialize logging: {}", e),
            CliError::Config(e) => write!(f, "{}", e),
            CliError::Pipeline(e) => write!(f, "{}", e),
            CliError::Average(e) => write!(f, "{}", e),
            CliError::VolumeWrite { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}
