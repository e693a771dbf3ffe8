//! Coordination store: existence-only markers plus advisory claims.
//!
//! Workers never exchange messages; the only shared resource is this
//! store. Three kinds of durable signal drive the whole protocol:
//!
//! - `SpecDone` - a specimen's registration for a stage has finished.
//!   Written once by the worker that did the work, checked by everyone.
//! - `AvgStarted` - the average-builder election marker. Created with the
//!   store's single mutual-exclusion primitive: atomic create-if-absent.
//!   Exactly one racer observes [`Acquire::Acquired`].
//! - `AvgDone` - the stage-advance gate, written by the election winner
//!   after the average volume is fully on disk.
//!
//! Markers carry no content (their existence is the entire payload), are
//! created once, and are never deleted by the pipeline.
//!
//! Claims are deliberately weaker: a specimen is claimed by creating its
//! working directory, which is *not* exclusive. Two workers racing to the
//! same specimen is an accepted inefficiency, not a correctness bug,
//! because registration is idempotent and the completion marker is
//! existence-only.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;

use dashmap::{DashMap, DashSet};
use thiserror::Error;

use crate::layout::{RunLayout, SpecimenId, StageId};

/// A durable coordination signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Marker {
    /// This specimen's registration for this stage has finished.
    SpecDone {
        stage: StageId,
        specimen: SpecimenId,
    },
    /// Average construction for this stage has started (election marker).
    AvgStarted { stage: StageId },
    /// Average construction for this stage has finished (advance gate).
    AvgDone { stage: StageId },
}

/// Outcome of an exclusive marker acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// This worker created the marker and holds the right it confers.
    Acquired,
    /// Another worker created the marker first.
    AlreadyHeld,
}

/// Errors from the coordination store.
///
/// A lost acquisition race is *not* an error; it is reported through
/// [`Acquire::AlreadyHeld`]. Anything here is fatal to the worker's run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("marker I/O failed at {path}: {source}")]
    Marker {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to claim specimen directory {path}: {source}")]
    Claim {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to list stage directory {path}: {source}")]
    ListStage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write stage parameter file {path}: {source}")]
    Params {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The coordination seam between the stage coordinator and its storage
/// substrate.
///
/// The production implementation is [`FsStore`]; [`MemStore`] lets the
/// protocol run entirely in memory for unit tests. Any substrate must
/// guarantee that `try_acquire` is genuinely atomic (first creator wins,
/// all others observe `AlreadyHeld`) - advisory locks are not a valid
/// substitute.
pub trait CoordinationStore: Send + Sync {
    /// Atomically creates the marker if absent.
    ///
    /// Errors other than "already exists" propagate and are fatal.
    fn try_acquire(&self, marker: &Marker) -> Result<Acquire, StoreError>;

    /// Creates the marker non-exclusively.
    ///
    /// Used for single-writer markers (`SpecDone`, `AvgDone`) where the
    /// creating worker is the only one entitled to write.
    fn mark(&self, marker: &Marker) -> Result<(), StoreError>;

    fn is_set(&self, marker: &Marker) -> Result<bool, StoreError>;

    /// Specimens with a working directory present in this stage.
    fn claimed(&self, stage: &StageId) -> Result<BTreeSet<SpecimenId>, StoreError>;

    /// Claims a specimen by creating its working directory, returning the
    /// directory path. Not exclusive; racing claims are tolerated.
    fn claim(&self, stage: &StageId, specimen: &SpecimenId) -> Result<PathBuf, StoreError>;

    /// Writes the stage parameter file if no worker has written it yet,
    /// returning its path. Write races are tolerated: the content is
    /// deterministic from configuration, so last-writer-wins is harmless.
    fn ensure_stage_params(&self, stage: &StageId, content: &str) -> Result<PathBuf, StoreError>;

    /// Deterministic location of a specimen's registered output volume.
    fn specimen_output(&self, stage: &StageId, specimen: &SpecimenId) -> PathBuf;
}

/// Production store over the shared filesystem.
///
/// The mutual-exclusion primitive is the `create_new` open flag, which a
/// POSIX filesystem (including the network filesystems these pipelines
/// run on) implements as an atomic create-if-absent.
#[derive(Debug, Clone)]
pub struct FsStore {
    layout: RunLayout,
}

impl FsStore {
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    fn marker_path(&self, marker: &Marker) -> PathBuf {
        match marker {
            Marker::SpecDone { stage, specimen } => self.layout.spec_done_marker(stage, specimen),
            Marker::AvgStarted { stage } => self.layout.avg_started_marker(stage),
            Marker::AvgDone { stage } => self.layout.avg_done_marker(stage),
        }
    }
}

impl CoordinationStore for FsStore {
    fn try_acquire(&self, marker: &Marker) -> Result<Acquire, StoreError> {
        let path = self.marker_path(marker);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Acquire::Acquired),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(Acquire::AlreadyHeld),
            Err(source) => Err(StoreError::Marker { path, source }),
        }
    }

    fn mark(&self, marker: &Marker) -> Result<(), StoreError> {
        let path = self.marker_path(marker);
        fs::File::create(&path)
            .map(|_| ())
            .map_err(|source| StoreError::Marker { path, source })
    }

    fn is_set(&self, marker: &Marker) -> Result<bool, StoreError> {
        Ok(self.marker_path(marker).is_file())
    }

    fn claimed(&self, stage: &StageId) -> Result<BTreeSet<SpecimenId>, StoreError> {
        let stage_dir = self.layout.stage_dir(stage);
        let entries = match fs::read_dir(&stage_dir) {
            Ok(entries) => entries,
            // Stage not started anywhere yet: nothing is claimed.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(StoreError::ListStage {
                    path: stage_dir,
                    source,
                })
            }
        };

        let mut claimed = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::ListStage {
                path: stage_dir.clone(),
                source,
            })?;
            if entry.path().is_dir() {
                claimed.insert(SpecimenId::new(entry.file_name().to_string_lossy()));
            }
        }
        Ok(claimed)
    }

    fn claim(&self, stage: &StageId, specimen: &SpecimenId) -> Result<PathBuf, StoreError> {
        let dir = self.layout.specimen_dir(stage, specimen);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Claim {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    fn ensure_stage_params(&self, stage: &StageId, content: &str) -> Result<PathBuf, StoreError> {
        let path = self.layout.param_file(stage);
        if !path.is_file() {
            fs::write(&path, content).map_err(|source| StoreError::Params {
                path: path.clone(),
                source,
            })?;
        }
        Ok(path)
    }

    fn specimen_output(&self, stage: &StageId, specimen: &SpecimenId) -> PathBuf {
        self.layout.output_volume(stage, specimen)
    }
}

/// In-memory store for protocol unit tests.
///
/// Implements the same contract as [`FsStore`] - including atomic
/// first-wins acquisition - over concurrent sets, so the coordinator's
/// state machine can be exercised with no filesystem and no real clock.
#[derive(Debug, Default)]
pub struct MemStore {
    extension: String,
    markers: DashSet<Marker>,
    claims: DashSet<(StageId, SpecimenId)>,
    params: DashMap<StageId, String>,
}

impl MemStore {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            ..Self::default()
        }
    }

    /// Parameter-file content recorded for a stage, if any worker wrote it.
    pub fn params_for(&self, stage: &StageId) -> Option<String> {
        self.params.get(stage).map(|entry| entry.value().clone())
    }
}

impl CoordinationStore for MemStore {
    fn try_acquire(&self, marker: &Marker) -> Result<Acquire, StoreError> {
        if self.markers.insert(marker.clone()) {
            Ok(Acquire::Acquired)
        } else {
            Ok(Acquire::AlreadyHeld)
        }
    }

    fn mark(&self, marker: &Marker) -> Result<(), StoreError> {
        self.markers.insert(marker.clone());
        Ok(())
    }

    fn is_set(&self, marker: &Marker) -> Result<bool, StoreError> {
        Ok(self.markers.contains(marker))
    }

    fn claimed(&self, stage: &StageId) -> Result<BTreeSet<SpecimenId>, StoreError> {
        Ok(self
            .claims
            .iter()
            .filter(|entry| &entry.0 == stage)
            .map(|entry| entry.1.clone())
            .collect())
    }

    fn claim(&self, stage: &StageId, specimen: &SpecimenId) -> Result<PathBuf, StoreError> {
        self.claims.insert((stage.clone(), specimen.clone()));
        Ok(PathBuf::from(format!("/mem/{stage}/{specimen}")))
    }

    fn ensure_stage_params(&self, stage: &StageId, content: &str) -> Result<PathBuf, StoreError> {
        self.params
            .entry(stage.clone())
            .or_insert_with(|| content.to_string());
        Ok(PathBuf::from(format!("/mem/{stage}/params.txt")))
    }

    fn specimen_output(&self, stage: &StageId, specimen: &SpecimenId) -> PathBuf {
        PathBuf::from(format!(
            "/mem/{stage}/{specimen}/{specimen}.{}",
            self.extension
        ))
    }
}
