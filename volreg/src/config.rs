//! Pipeline configuration.
//!
//! A YAML file describes one pipeline run: the initial fixed volume, the
//! volume file extension, the elastix thread budget, and the ordered list
//! of registration stages with their parameter maps. Every worker process
//! loads the same file; all coordination state derives from it plus the
//! shared output directory.
//!
//! ```yaml
//! fixed_volume: targets/population_target.nrrd
//! filetype: nrrd
//! threads: 4
//! stages:
//!   - stage_id: rigid
//!     elastix_parameters:
//!       Transform: EulerTransform
//!       NumberOfResolutions: 4
//!   - stage_id: affine
//!     elastix_parameters:
//!       Transform: AffineTransform
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registration::ParamValue;

/// Default volume file extension.
pub const DEFAULT_FILETYPE: &str = "nrrd";

/// Default elastix thread budget per registration call.
pub const DEFAULT_THREADS: usize = 4;

/// Configuration errors. All fatal and surfaced immediately; a bad
/// config is never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yml::Error,
    },

    #[error("config declares no registration stages")]
    NoStages,

    #[error("duplicate stage id '{0}'")]
    DuplicateStage(String),

    #[error("invalid stage id '{0}': must be non-empty and contain no path separators")]
    InvalidStageId(String),

    #[error("invalid filetype '{0}': must be a bare extension like 'nrrd'")]
    InvalidFiletype(String),

    #[error("threads must be at least 1")]
    ZeroThreads,

    #[error("fixed volume not found at {0}")]
    FixedVolumeMissing(PathBuf),
}

/// One registration stage definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage_id: String,

    /// Elastix parameter map rendered to this stage's parameter file.
    #[serde(default)]
    pub elastix_parameters: BTreeMap<String, ParamValue>,
}

/// Whole-pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fixed/target volume for stage 0. Later stages use the previous
    /// stage's population average instead.
    pub fixed_volume: PathBuf,

    #[serde(default = "default_filetype")]
    pub filetype: String,

    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(alias = "registration_stage_params")]
    pub stages: Vec<StageConfig>,
}

fn default_filetype() -> String {
    DEFAULT_FILETYPE.to_string()
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

impl PipelineConfig {
    /// Loads and structurally validates a config file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: stage list shape, ids, extension, threads.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.filetype.is_empty() || !self.filetype.chars().all(char::is_alphanumeric) {
            return Err(ConfigError::InvalidFiletype(self.filetype.clone()));
        }

        let mut seen = BTreeSet::new();
        for stage in &self.stages {
            let id = stage.stage_id.as_str();
            if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
                return Err(ConfigError::InvalidStageId(id.to_string()));
            }
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateStage(id.to_string()));
            }
        }
        Ok(())
    }

    /// Path validation, separate from `load_from` so configs can be
    /// checked on machines that do not mount the data.
    pub fn validate_paths(&self) -> Result<(), ConfigError> {
        if !self.fixed_volume.is_file() {
            return Err(ConfigError::FixedVolumeMissing(self.fixed_volume.clone()));
        }
        Ok(())
    }
}
