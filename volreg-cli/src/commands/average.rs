//! `volreg average` - operator tool to average a directory of volumes.
//!
//! Useful for rebuilding a stage average by hand after clearing a stuck
//! election marker, or for sanity-checking inputs.

use std::path::PathBuf;

use clap::Args;
use volreg::average::average_directory;

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct AverageArgs {
    /// Directory containing the volumes to average
    pub dir: PathBuf,

    /// Output path for the mean volume
    pub out: PathBuf,

    /// Volume file extension to include
    #[arg(long, default_value = "nrrd")]
    pub filetype: String,
}

pub fn execute(args: AverageArgs) -> Result<(), CliError> {
    let mean = average_directory(&args.dir, &args.filetype).map_err(CliError::Average)?;
    mean.write(&args.out).map_err(|source| CliError::VolumeWrite {
        path: args.out.clone(),
        source,
    })?;

    println!(
        "Wrote mean of {} ({} voxels) to {}",
        args.dir.display(),
        mean.len(),
        args.out.display()
    );
    Ok(())
}
