//! Registration invoker seam.
//!
//! Registration itself is an external collaborator: an image-registration
//! engine invoked as a black box that deposits an output volume at a
//! deterministic path and reports success or failure. The coordinator
//! only depends on the [`Registrator`] trait; [`ElastixRegistrator`]
//! bridges it to the elastix binary.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::layout::SpecimenId;

/// Errors from one specimen's registration attempt.
///
/// All of these are fatal to the worker's participation in the stage; no
/// retry happens at this layer. Re-invoking the whole pipeline is the
/// supported retry path and is safe because of the idempotent markers.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("registration of {specimen} failed with {status}: {stderr}")]
    Failed {
        specimen: String,
        status: String,
        stderr: String,
    },

    #[error("registration of {specimen} reported success but produced no output at {path}")]
    MissingOutput { specimen: String, path: PathBuf },

    #[error("failed to move registration output to {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One registration request: warp `moving` onto `fixed` under the stage's
/// parameters, leaving the result at `output` inside `work_dir`.
#[derive(Debug)]
pub struct RegistrationRequest<'a> {
    pub specimen: &'a SpecimenId,
    pub param_file: &'a Path,
    pub moving: &'a Path,
    pub fixed: &'a Path,
    pub work_dir: &'a Path,
    /// Deterministic output path the caller will read the result from.
    pub output: &'a Path,
}

/// The registration engine, as the coordinator sees it.
///
/// `register` may block for minutes to hours; that is expected. Success
/// implies the output volume exists at `request.output`.
pub trait Registrator: Send + Sync {
    fn register(&self, request: &RegistrationRequest<'_>) -> Result<(), RegistrationError>;
}

/// Invokes the elastix binary for target-based registration.
#[derive(Debug, Clone)]
pub struct ElastixRegistrator {
    binary: PathBuf,
    threads: usize,
}

impl ElastixRegistrator {
    pub fn new(binary: impl Into<PathBuf>, threads: usize) -> Self {
        Self {
            binary: binary.into(),
            threads,
        }
    }
}

impl Registrator for ElastixRegistrator {
    fn register(&self, request: &RegistrationRequest<'_>) -> Result<(), RegistrationError> {
        info!(
            specimen = %request.specimen,
            moving = %request.moving.display(),
            fixed = %request.fixed.display(),
            "running elastix"
        );

        let output = Command::new(&self.binary)
            .arg("-f")
            .arg(request.fixed)
            .arg("-m")
            .arg(request.moving)
            .arg("-p")
            .arg(request.param_file)
            .arg("-out")
            .arg(request.work_dir)
            .arg("-threads")
            .arg(self.threads.to_string())
            .output()
            .map_err(|source| RegistrationError::Spawn {
                command: self.binary.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(RegistrationError::Failed {
                specimen: request.specimen.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        // Elastix names its result after the parameter-file index; move it
        // to the deterministic per-specimen path the rest of the pipeline
        // reads.
        let ext = request
            .output
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let elastix_result = request.work_dir.join(format!("result.0.{ext}"));
        if elastix_result.is_file() {
            fs::rename(&elastix_result, request.output).map_err(|source| {
                RegistrationError::Io {
                    path: request.output.to_path_buf(),
                    source,
                }
            })?;
        }

        if !request.output.is_file() {
            return Err(RegistrationError::MissingOutput {
                specimen: request.specimen.to_string(),
                path: request.output.to_path_buf(),
            });
        }

        debug!(specimen = %request.specimen, output = %request.output.display(), "elastix finished");
        Ok(())
    }
}

/// A value in an elastix parameter map.
///
/// Mirrors what stage configurations may carry; rendering is the only
/// operation the pipeline performs on these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    fn render_into(&self, out: &mut String) {
        match self {
            // Elastix booleans are quoted strings.
            ParamValue::Bool(b) => {
                let _ = write!(out, "\"{b}\"");
            }
            ParamValue::Int(i) => {
                let _ = write!(out, "{i}");
            }
            ParamValue::Float(f) => {
                let _ = write!(out, "{f:?}");
            }
            ParamValue::Str(s) => {
                let _ = write!(out, "\"{s}\"");
            }
            ParamValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    item.render_into(out);
                }
            }
        }
    }
}

/// Renders a stage's parameter map as elastix parameter-file text.
///
/// The map is ordered, so the output is deterministic from configuration;
/// this is what makes concurrent parameter-file writes harmless.
pub fn elastix_parameter_text(params: &BTreeMap<String, ParamValue>) -> String {
    let mut out = String::new();
    for (key, value) in params {
        out.push('(');
        out.push_str(key);
        out.push(' ');
        value.render_into(&mut out);
        out.push_str(")\n");
    }
    out
}
