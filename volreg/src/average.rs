//! Population-average construction.
//!
//! After every specimen in a stage has registered, exactly one worker
//! (the election winner) computes the voxel-wise arithmetic mean of the
//! stage's output volumes and writes it to `averages/<stage_id>.<ext>`.
//! That file becomes the next stage's fixed volume.
//!
//! Shape mismatches are an upstream defect (registration guarantees
//! geometrically aligned, identically shaped outputs) and must surface
//! immediately; they are never retried or masked.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::layout::{RunLayout, StageId};
use crate::volume::{Volume, VolumeError};

/// Errors from average construction.
#[derive(Debug, Error)]
pub enum AverageError {
    #[error("no volumes found under {dir}")]
    NoVolumes { dir: PathBuf },

    #[error("volume shape mismatch in {path}: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("failed to prepare averages directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to list stage directory {path}: {source}")]
    ListStage {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Seam between the stage coordinator and average construction, so the
/// election protocol can be unit-tested with a recording fake.
pub trait AverageBuilder: Send + Sync {
    /// Builds and persists the population average for a completed stage.
    fn build(&self, stage: &StageId) -> Result<(), AverageError>;
}

/// Production builder: scans the stage directory for per-specimen output
/// volumes and writes the mean to the layout's average path.
#[derive(Debug, Clone)]
pub struct FsAverageBuilder {
    layout: RunLayout,
}

impl FsAverageBuilder {
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    /// Output volume paths, one per claimed specimen directory.
    fn specimen_volumes(&self, stage: &StageId) -> Result<Vec<PathBuf>, AverageError> {
        let stage_dir = self.layout.stage_dir(stage);
        let entries = fs::read_dir(&stage_dir).map_err(|source| AverageError::ListStage {
            path: stage_dir.clone(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AverageError::ListStage {
                path: stage_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            paths.push(path.join(format!("{}.{}", name, self.layout.extension())));
        }
        paths.sort();
        Ok(paths)
    }
}

impl AverageBuilder for FsAverageBuilder {
    fn build(&self, stage: &StageId) -> Result<(), AverageError> {
        let paths = self.specimen_volumes(stage)?;
        if paths.is_empty() {
            return Err(AverageError::NoVolumes {
                dir: self.layout.stage_dir(stage),
            });
        }

        info!(stage = %stage, volumes = paths.len(), "building stage average");
        let average = average_files(&paths)?;

        let avg_dir = self.layout.averages_dir();
        fs::create_dir_all(&avg_dir).map_err(|source| AverageError::Io {
            path: avg_dir,
            source,
        })?;

        let out = self.layout.average_path(stage);
        average.write(&out)?;
        info!(stage = %stage, path = %out.display(), "stage average written");
        Ok(())
    }
}

/// Voxel-wise arithmetic mean across identically shaped volumes.
///
/// Accumulates in `f64` so long specimen lists do not lose precision.
pub fn average_files(paths: &[PathBuf]) -> Result<Volume, AverageError> {
    let first_path = paths.first().ok_or_else(|| AverageError::NoVolumes {
        dir: PathBuf::new(),
    })?;
    let first = Volume::read(first_path)?;
    let dims = first.dims();

    let mut sums: Vec<f64> = first.voxels().iter().map(|&v| f64::from(v)).collect();
    for path in &paths[1..] {
        let vol = Volume::read(path)?;
        if vol.dims() != dims {
            return Err(AverageError::ShapeMismatch {
                path: path.clone(),
                expected: dims,
                actual: vol.dims(),
            });
        }
        for (sum, &v) in sums.iter_mut().zip(vol.voxels()) {
            *sum += f64::from(v);
        }
    }

    let count = paths.len() as f64;
    let voxels = sums.into_iter().map(|s| (s / count) as f32).collect();
    Ok(Volume::new(dims, voxels)?)
}

/// Averages every volume with the given extension directly under a
/// directory. Operator-facing helper behind the `average` CLI command.
pub fn average_directory(dir: &Path, extension: &str) -> Result<Volume, AverageError> {
    let entries = fs::read_dir(dir).map_err(|source| AverageError::ListStage {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| AverageError::ListStage {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        return Err(AverageError::NoVolumes {
            dir: dir.to_path_buf(),
        });
    }
    paths.sort();
    average_files(&paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SpecimenId;
    use tempfile::TempDir;

    fn write_vol(path: &Path, dims: [usize; 3], fill: f32) {
        let n = dims[0] * dims[1] * dims[2];
        Volume::new(dims, vec![fill; n]).unwrap().write(path).unwrap();
    }

    #[test]
    fn mean_of_three_constant_volumes() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = [1.0f32, 2.0, 6.0]
            .iter()
            .enumerate()
            .map(|(i, &fill)| {
                let path = dir.path().join(format!("v{i}.nrrd"));
                write_vol(&path, [2, 2, 1], fill);
                path
            })
            .collect();

        let avg = average_files(&paths).unwrap();
        assert_eq!(avg.dims(), [2, 2, 1]);
        assert!(avg.voxels().iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.nrrd");
        let b = dir.path().join("b.nrrd");
        write_vol(&a, [2, 2, 1], 1.0);
        write_vol(&b, [2, 2, 2], 1.0);

        let err = average_files(&[a, b]).unwrap_err();
        assert!(matches!(
            err,
            AverageError::ShapeMismatch {
                expected: [2, 2, 1],
                actual: [2, 2, 2],
                ..
            }
        ));
    }

    #[test]
    fn empty_input_is_an_error() {
        let err = average_files(&[]).unwrap_err();
        assert!(matches!(err, AverageError::NoVolumes { .. }));
    }

    #[test]
    fn builder_reads_specimen_dirs_and_writes_average() {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path(), "nrrd");
        let stage = StageId::new("rigid");

        for (name, fill) in [("emb_a", 2.0f32), ("emb_b", 4.0)] {
            let spec = SpecimenId::new(name);
            let spec_dir = layout.specimen_dir(&stage, &spec);
            fs::create_dir_all(&spec_dir).unwrap();
            write_vol(&layout.output_volume(&stage, &spec), [2, 1, 1], fill);
        }

        FsAverageBuilder::new(layout.clone()).build(&stage).unwrap();

        let avg = Volume::read(&layout.average_path(&stage)).unwrap();
        assert!(avg.voxels().iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn builder_fails_on_empty_stage() {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path(), "nrrd");
        let stage = StageId::new("rigid");
        fs::create_dir_all(layout.stage_dir(&stage)).unwrap();

        let err = FsAverageBuilder::new(layout).build(&stage).unwrap_err();
        assert!(matches!(err, AverageError::NoVolumes { .. }));
    }

    #[test]
    fn directory_average_ignores_other_extensions() {
        let dir = TempDir::new().unwrap();
        write_vol(&dir.path().join("a.nrrd"), [1, 1, 1], 1.0);
        write_vol(&dir.path().join("b.nrrd"), [1, 1, 1], 3.0);
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let avg = average_directory(dir.path(), "nrrd").unwrap();
        assert_eq!(avg.voxels(), &[2.0]);
    }
}
