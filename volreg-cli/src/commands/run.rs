//! `volreg run` - one worker's pipeline run.

use std::path::PathBuf;

use clap::Args;
use tracing::info;
use volreg::clock::SystemClock;
use volreg::config::PipelineConfig;
use volreg::logging::init_logging;
use volreg::pipeline::PipelineDriver;
use volreg::registration::ElastixRegistrator;

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Directory holding one input volume per specimen
    pub inputs_dir: PathBuf,

    /// Pipeline configuration file (YAML)
    pub config: PathBuf,

    /// Output directory shared by every worker in the run
    pub output_dir: PathBuf,

    /// Path to the elastix binary
    #[arg(long, default_value = "elastix")]
    pub elastix: PathBuf,

    /// Log directory (defaults to <output_dir>/logs)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

pub fn execute(args: RunArgs) -> Result<(), CliError> {
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| args.output_dir.join("logs"));
    let _guard = init_logging(&log_dir, "volreg.log").map_err(CliError::Logging)?;

    let config = PipelineConfig::load_from(&args.config).map_err(CliError::Config)?;
    config.validate_paths().map_err(CliError::Config)?;

    info!(
        inputs = %args.inputs_dir.display(),
        output = %args.output_dir.display(),
        stages = config.stages.len(),
        "worker starting"
    );

    let registrator = ElastixRegistrator::new(args.elastix.clone(), config.threads);
    PipelineDriver::new(
        &config,
        &args.inputs_dir,
        &args.output_dir,
        &registrator,
        &SystemClock,
    )
    .run()
    .map_err(CliError::Pipeline)
}
