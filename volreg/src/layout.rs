//! On-disk layout of a pipeline run.
//!
//! The filesystem is the authoritative shared state of the whole pipeline:
//! every path a worker reads or writes is derived here, so all workers
//! agree on the layout without exchanging a single message.
//!
//! ```text
//! <output root>/
//! ├── averages/
//! │   └── <stage_id>.<ext>          population average per completed stage
//! └── <stage_id>/
//!     ├── elastix_params_<stage_id>.txt
//!     ├── avg_started                election marker (exclusive create)
//!     ├── avg_done                   stage-advance gate
//!     └── <specimen>/
//!         ├── <specimen>.<ext>       registered output volume
//!         └── spec_done              per-specimen completion marker
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

/// Per-specimen completion marker filename.
pub const SPEC_DONE: &str = "spec_done";

/// Election marker filename: exactly one worker creates it exclusively.
pub const AVG_STARTED: &str = "avg_started";

/// Stage-advance gate filename: written by the election winner after the
/// average volume is on disk.
pub const AVG_DONE: &str = "avg_done";

/// Directory holding one average volume per completed stage.
pub const AVERAGES_DIR: &str = "averages";

/// Prefix for the per-stage elastix parameter file.
pub const ELX_PARAM_PREFIX: &str = "elastix_params_";

/// Identifies one biological specimen tracked through every stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecimenId(String);

impl SpecimenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecimenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one registration stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path derivations for one pipeline run rooted at an output directory.
///
/// Cheap to clone; holds only the root path and the volume file extension.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    extension: String,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Volume file extension without the leading dot (e.g. `nrrd`).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn averages_dir(&self) -> PathBuf {
        self.root.join(AVERAGES_DIR)
    }

    /// The population-average volume for a stage. Consumed by every worker
    /// as the next stage's fixed volume.
    pub fn average_path(&self, stage: &StageId) -> PathBuf {
        self.averages_dir()
            .join(format!("{}.{}", stage, self.extension))
    }

    pub fn stage_dir(&self, stage: &StageId) -> PathBuf {
        self.root.join(stage.as_str())
    }

    /// A specimen's working directory within a stage. Its existence is the
    /// specimen's (advisory) claim.
    pub fn specimen_dir(&self, stage: &StageId, specimen: &SpecimenId) -> PathBuf {
        self.stage_dir(stage).join(specimen.as_str())
    }

    /// Deterministic location of a specimen's registered output volume.
    pub fn output_volume(&self, stage: &StageId, specimen: &SpecimenId) -> PathBuf {
        self.specimen_dir(stage, specimen)
            .join(format!("{}.{}", specimen, self.extension))
    }

    pub fn spec_done_marker(&self, stage: &StageId, specimen: &SpecimenId) -> PathBuf {
        self.specimen_dir(stage, specimen).join(SPEC_DONE)
    }

    pub fn avg_started_marker(&self, stage: &StageId) -> PathBuf {
        self.stage_dir(stage).join(AVG_STARTED)
    }

    pub fn avg_done_marker(&self, stage: &StageId) -> PathBuf {
        self.stage_dir(stage).join(AVG_DONE)
    }

    pub fn param_file(&self, stage: &StageId) -> PathBuf {
        self.stage_dir(stage)
            .join(format!("{ELX_PARAM_PREFIX}{stage}.txt"))
    }

    /// A specimen's raw input volume under the inputs directory. Used as
    /// the moving volume for stage 0 only.
    pub fn input_volume(&self, inputs_dir: &Path, specimen: &SpecimenId) -> PathBuf {
        inputs_dir.join(format!("{}.{}", specimen, self.extension))
    }
}
