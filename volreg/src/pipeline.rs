//! Pipeline driver: one worker's walk through every stage in order.
//!
//! The driver owns the parts of the run that are not contended: reading
//! the specimen list, preparing directories, rendering stage parameters,
//! and threading the evolving fixed volume (stage *i*'s average becomes
//! stage *i+1*'s target). All contended work happens inside the
//! [`StageCoordinator`](crate::coordinator::StageCoordinator) it invokes
//! once per stage.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, info_span};

use crate::average::FsAverageBuilder;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::coordinator::{
    CoordinatorError, StageContext, StageCoordinator, DEFAULT_POLL_INTERVAL,
};
use crate::layout::{RunLayout, SpecimenId, StageId};
use crate::marker::FsStore;
use crate::registration::{elastix_parameter_text, Registrator};

/// Errors that terminate a worker's pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no input volumes with extension '{extension}' in {dir}")]
    NoSpecimens { dir: PathBuf, extension: String },

    #[error("failed to read inputs directory {path}: {source}")]
    ListInputs {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Runs this worker process through the whole pipeline.
pub struct PipelineDriver<'a> {
    config: &'a PipelineConfig,
    inputs_dir: PathBuf,
    layout: RunLayout,
    registrator: &'a dyn Registrator,
    clock: &'a dyn Clock,
    poll_interval: Duration,
}

impl<'a> PipelineDriver<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        inputs_dir: &Path,
        output_dir: &Path,
        registrator: &'a dyn Registrator,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            inputs_dir: inputs_dir.to_path_buf(),
            layout: RunLayout::new(output_dir, config.filetype.clone()),
            registrator,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the coordinator poll backoff (timing only, never
    /// protocol semantics).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Specimen ids: one per input volume file with the configured
    /// extension, identified by file stem.
    pub fn enumerate_specimens(&self) -> Result<BTreeSet<SpecimenId>, PipelineError> {
        let entries =
            fs::read_dir(&self.inputs_dir).map_err(|source| PipelineError::ListInputs {
                path: self.inputs_dir.clone(),
                source,
            })?;

        let mut specimens = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| PipelineError::ListInputs {
                path: self.inputs_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path
                .extension()
                .is_some_and(|e| e == self.config.filetype.as_str())
            {
                if let Some(stem) = path.file_stem() {
                    specimens.insert(SpecimenId::new(stem.to_string_lossy()));
                }
            }
        }

        if specimens.is_empty() {
            return Err(PipelineError::NoSpecimens {
                dir: self.inputs_dir.clone(),
                extension: self.config.filetype.clone(),
            });
        }
        Ok(specimens)
    }

    /// Runs every stage in order for this worker. Safe to invoke in any
    /// number of worker processes concurrently, and safe to re-invoke
    /// after a crash: completed work is skipped via the on-disk markers.
    pub fn run(&self) -> Result<(), PipelineError> {
        let span = info_span!("worker", pid = std::process::id());
        let _guard = span.enter();

        let specimens = self.enumerate_specimens()?;
        info!(
            specimens = specimens.len(),
            stages = self.config.stages.len(),
            output = %self.layout.root().display(),
            "starting pipeline run"
        );

        self.create_dir(&self.layout.root().to_path_buf())?;
        self.create_dir(&self.layout.averages_dir())?;

        let store = FsStore::new(self.layout.clone());
        let averager = FsAverageBuilder::new(self.layout.clone());

        let mut prev_stage: Option<StageId> = None;
        for stage_config in &self.config.stages {
            let stage = StageId::new(stage_config.stage_id.clone());

            // Another worker may have created it already; exist-ok.
            self.create_dir(&self.layout.stage_dir(&stage))?;

            // Stage 0 registers against the externally supplied target;
            // every later stage against the previous stage's average.
            let fixed = match &prev_stage {
                None => self.config.fixed_volume.clone(),
                Some(prev) => self.layout.average_path(prev),
            };

            let ctx = StageContext {
                stage: stage.clone(),
                specimens: specimens.clone(),
                param_text: elastix_parameter_text(&stage_config.elastix_parameters),
                extension: self.config.filetype.clone(),
                inputs_dir: self.inputs_dir.clone(),
                prev_stage: prev_stage.clone(),
                fixed,
            };

            StageCoordinator::new(&store, self.registrator, &averager, self.clock)
                .with_poll_interval(self.poll_interval)
                .run_stage(&ctx)?;

            prev_stage = Some(stage);
        }

        info!("pipeline run complete");
        Ok(())
    }

    fn create_dir(&self, path: &PathBuf) -> Result<(), PipelineError> {
        fs::create_dir_all(path).map_err(|source| PipelineError::CreateDir {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::volume::Volume;
    use tempfile::TempDir;

    struct NoopRegistrator;

    impl Registrator for NoopRegistrator {
        fn register(
            &self,
            _request: &crate::registration::RegistrationRequest<'_>,
        ) -> Result<(), crate::registration::RegistrationError> {
            Ok(())
        }
    }

    fn config(stages: &[&str]) -> PipelineConfig {
        PipelineConfig {
            fixed_volume: PathBuf::from("/targets/target.nrrd"),
            filetype: "nrrd".to_string(),
            threads: 1,
            stages: stages
                .iter()
                .map(|id| StageConfig {
                    stage_id: (*id).to_string(),
                    elastix_parameters: Default::default(),
                })
                .collect(),
        }
    }

    fn write_input(dir: &Path, name: &str) {
        Volume::new([1, 1, 1], vec![1.0])
            .unwrap()
            .write(&dir.join(name))
            .unwrap();
    }

    #[test]
    fn enumerates_specimens_by_stem_and_extension() {
        let inputs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_input(inputs.path(), "emb_b.nrrd");
        write_input(inputs.path(), "emb_a.nrrd");
        fs::write(inputs.path().join("readme.txt"), "not a volume").unwrap();

        let config = config(&["rigid"]);
        let clock = crate::clock::MockClock::new();
        let driver = PipelineDriver::new(
            &config,
            inputs.path(),
            out.path(),
            &NoopRegistrator,
            &clock,
        );

        let specimens = driver.enumerate_specimens().unwrap();
        let names: Vec<_> = specimens.iter().map(SpecimenId::as_str).collect();
        assert_eq!(names, vec!["emb_a", "emb_b"]);
    }

    #[test]
    fn empty_inputs_directory_is_an_error() {
        let inputs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let config = config(&["rigid"]);
        let clock = crate::clock::MockClock::new();
        let driver = PipelineDriver::new(
            &config,
            inputs.path(),
            out.path(),
            &NoopRegistrator,
            &clock,
        );

        let err = driver.enumerate_specimens().unwrap_err();
        assert!(matches!(err, PipelineError::NoSpecimens { .. }));
    }
}
