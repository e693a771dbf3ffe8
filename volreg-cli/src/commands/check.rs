//! `volreg check` - validate a pipeline configuration file.

use std::path::PathBuf;

use clap::Args;
use volreg::config::PipelineConfig;

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Pipeline configuration file (YAML)
    pub config: PathBuf,

    /// Also verify that referenced paths exist on this machine
    #[arg(long)]
    pub paths: bool,
}

pub fn execute(args: CheckArgs) -> Result<(), CliError> {
    let config = PipelineConfig::load_from(&args.config).map_err(CliError::Config)?;
    if args.paths {
        config.validate_paths().map_err(CliError::Config)?;
    }

    println!("{} is valid", args.config.display());
    println!("  fixed volume: {}", config.fixed_volume.display());
    println!("  filetype:     {}", config.filetype);
    println!("  threads:      {}", config.threads);
    println!("  stages:");
    for stage in &config.stages {
        println!(
            "    {} ({} parameters)",
            stage.stage_id,
            stage.elastix_parameters.len()
        );
    }
    Ok(())
}
