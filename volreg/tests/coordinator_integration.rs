//! Integration tests for the stage coordination protocol.
//!
//! These run the full pipeline driver against real temporary directories
//! with a fake registration engine, covering:
//! - the two-stage end-to-end flow with evolving fixed volumes
//! - resumability from pre-existing markers
//! - multi-worker races over a shared output directory

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use volreg::clock::SystemClock;
use volreg::config::{PipelineConfig, StageConfig};
use volreg::layout::{RunLayout, SpecimenId, StageId};
use volreg::pipeline::PipelineDriver;
use volreg::registration::{RegistrationError, RegistrationRequest, Registrator};
use volreg::volume::Volume;

// =============================================================================
// Test Helpers
// =============================================================================

#[derive(Debug, Clone)]
struct CallRecord {
    specimen: String,
    moving: PathBuf,
    fixed: PathBuf,
    /// Did the fixed volume exist when registration began?
    fixed_present: bool,
    /// Did the previous stage's `avg_done` gate exist when registration
    /// began? Only meaningful when the moving volume came from a stage
    /// directory (i.e. stage 1 onwards).
    prev_gate_open: bool,
}

/// Fake registration engine: "warps" the moving volume by adding 1.0 to
/// every voxel and deposits it at the deterministic output path.
struct FakeRegistrator {
    delay: Duration,
    calls: Mutex<Vec<CallRecord>>,
}

impl FakeRegistrator {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }
}

impl Registrator for FakeRegistrator {
    fn register(&self, request: &RegistrationRequest<'_>) -> Result<(), RegistrationError> {
        let fixed_present = request.fixed.is_file();
        // For a moving volume at <root>/<stage>/<spec>/<spec>.<ext>, the
        // previous stage's advance gate sits two levels up.
        let prev_gate_open = request
            .moving
            .parent()
            .and_then(Path::parent)
            .map(|stage_dir| stage_dir.join("avg_done").is_file())
            .unwrap_or(false);

        self.calls.lock().unwrap().push(CallRecord {
            specimen: request.specimen.to_string(),
            moving: request.moving.to_path_buf(),
            fixed: request.fixed.to_path_buf(),
            fixed_present,
            prev_gate_open,
        });

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let moving = Volume::read(request.moving).map_err(|e| RegistrationError::Failed {
            specimen: request.specimen.to_string(),
            status: "fake-registrator".to_string(),
            stderr: e.to_string(),
        })?;
        let warped = Volume::new(
            moving.dims(),
            moving.voxels().iter().map(|v| v + 1.0).collect(),
        )
        .map_err(|e| RegistrationError::Failed {
            specimen: request.specimen.to_string(),
            status: "fake-registrator".to_string(),
            stderr: e.to_string(),
        })?;
        warped
            .write(request.output)
            .map_err(|e| RegistrationError::Failed {
                specimen: request.specimen.to_string(),
                status: "fake-registrator".to_string(),
                stderr: e.to_string(),
            })?;
        Ok(())
    }
}

const DIMS: [usize; 3] = [2, 2, 1];

fn write_vol(path: &Path, fill: f32) {
    let n = DIMS[0] * DIMS[1] * DIMS[2];
    Volume::new(DIMS, vec![fill; n]).unwrap().write(path).unwrap();
}

/// Inputs emb_a=1.0, emb_b=2.0, emb_c=3.0. The initial target volume is
/// written next to them but outside the inputs directory, so it is not
/// mistaken for a specimen.
fn seed_inputs(inputs: &Path, target: &Path) {
    write_vol(&inputs.join("emb_a.nrrd"), 1.0);
    write_vol(&inputs.join("emb_b.nrrd"), 2.0);
    write_vol(&inputs.join("emb_c.nrrd"), 3.0);
    write_vol(target, 0.0);
}

fn make_config(fixed_volume: PathBuf, stage_ids: &[&str]) -> PipelineConfig {
    PipelineConfig {
        fixed_volume,
        filetype: "nrrd".to_string(),
        threads: 1,
        stages: stage_ids
            .iter()
            .map(|id| StageConfig {
                stage_id: (*id).to_string(),
                elastix_parameters: Default::default(),
            })
            .collect(),
    }
}

fn assert_constant_volume(path: &Path, expected: f32) {
    let vol = Volume::read(path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
    assert_eq!(vol.dims(), DIMS);
    for &v in vol.voxels() {
        assert!(
            (v - expected).abs() < 1e-6,
            "expected {expected} everywhere in {}, found {v}",
            path.display()
        );
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn end_to_end_two_stages_three_specimens() {
    let inputs = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let target = target_dir.path().join("target.nrrd");
    seed_inputs(inputs.path(), &target);

    let config = make_config(target.clone(), &["rigid", "affine"]);
    let registrator = FakeRegistrator::new(Duration::ZERO);
    let driver = PipelineDriver::new(
        &config,
        inputs.path(),
        out.path(),
        &registrator,
        &SystemClock,
    )
    .with_poll_interval(Duration::from_millis(1));

    driver.run().unwrap();

    let layout = RunLayout::new(out.path(), "nrrd");
    let rigid = StageId::new("rigid");
    let affine = StageId::new("affine");

    // Stage 0 outputs are inputs + 1 (2, 3, 4): mean 3.
    assert_constant_volume(&layout.average_path(&rigid), 3.0);
    // Stage 1 outputs are stage-0 outputs + 1 (3, 4, 5): mean 4.
    assert_constant_volume(&layout.average_path(&affine), 4.0);

    // Both stages left their full marker trail.
    for stage in [&rigid, &affine] {
        assert!(layout.avg_started_marker(stage).is_file());
        assert!(layout.avg_done_marker(stage).is_file());
        for id in ["emb_a", "emb_b", "emb_c"] {
            assert!(layout
                .spec_done_marker(stage, &SpecimenId::new(id))
                .is_file());
        }
    }

    let calls = registrator.calls();
    assert_eq!(calls.len(), 6);

    let stage1_calls: Vec<_> = calls
        .iter()
        .filter(|c| c.fixed == layout.average_path(&rigid))
        .collect();
    assert_eq!(stage1_calls.len(), 3);
    for call in stage1_calls {
        // Stage 1 moves each specimen's stage-0 output...
        assert_eq!(
            call.moving,
            layout.output_volume(&rigid, &SpecimenId::new(call.specimen.as_str()))
        );
        // ...against an average that already existed, behind an already
        // open advance gate.
        assert!(call.fixed_present);
        assert!(call.prev_gate_open);
    }

    // Stage 0 registered raw inputs against the supplied target.
    for call in calls.iter().filter(|c| c.fixed == target) {
        assert!(call.moving.starts_with(inputs.path()));
        assert!(call.fixed_present);
    }
}

#[test]
fn fresh_worker_resumes_from_preseeded_markers() {
    let inputs = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let target = target_dir.path().join("target.nrrd");
    seed_inputs(inputs.path(), &target);

    let layout = RunLayout::new(out.path(), "nrrd");
    let rigid = StageId::new("rigid");

    // A previous worker completed emb_a and emb_b (outputs + markers)
    // before dying.
    for (id, fill) in [("emb_a", 2.0f32), ("emb_b", 3.0)] {
        let specimen = SpecimenId::new(id);
        fs::create_dir_all(layout.specimen_dir(&rigid, &specimen)).unwrap();
        write_vol(&layout.output_volume(&rigid, &specimen), fill);
        fs::write(layout.spec_done_marker(&rigid, &specimen), "").unwrap();
    }

    let config = make_config(target, &["rigid"]);
    let registrator = FakeRegistrator::new(Duration::ZERO);
    PipelineDriver::new(
        &config,
        inputs.path(),
        out.path(),
        &registrator,
        &SystemClock,
    )
    .with_poll_interval(Duration::from_millis(1))
    .run()
    .unwrap();

    // Only the third specimen was processed, by this worker alone.
    let calls = registrator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].specimen, "emb_c");

    // Average over 2, 3, and emb_c's 3+1=4: mean 3.
    assert_constant_volume(&layout.average_path(&rigid), 3.0);
    assert!(layout.avg_done_marker(&rigid).is_file());
}

#[test]
fn five_workers_share_one_stage_without_duplicating_markers() {
    let inputs = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let target = target_dir.path().join("target.nrrd");
    seed_inputs(inputs.path(), &target);

    let config = make_config(target, &["rigid"]);
    // A small delay widens the claim race window between workers.
    let registrator = Arc::new(FakeRegistrator::new(Duration::from_millis(5)));

    std::thread::scope(|scope| {
        for _ in 0..5 {
            let config = &config;
            let registrator = Arc::clone(&registrator);
            let inputs = inputs.path();
            let out = out.path();
            scope.spawn(move || {
                PipelineDriver::new(config, inputs, out, &*registrator, &SystemClock)
                    .with_poll_interval(Duration::from_millis(1))
                    .run()
                    .unwrap();
            });
        }
    });

    let layout = RunLayout::new(out.path(), "nrrd");
    let rigid = StageId::new("rigid");

    // Registrations may have been duplicated by racing claims, but every
    // specimen was registered at least once and the outputs agree.
    let calls = registrator.calls();
    assert!(calls.len() >= 3, "expected >= 3 calls, got {}", calls.len());
    for id in ["emb_a", "emb_b", "emb_c"] {
        assert!(calls.iter().any(|c| c.specimen == id));
        assert!(layout
            .spec_done_marker(&rigid, &SpecimenId::new(id))
            .is_file());
    }

    // Exactly one average, from exactly one elected builder.
    assert!(layout.avg_started_marker(&rigid).is_file());
    assert!(layout.avg_done_marker(&rigid).is_file());
    let averages: Vec<_> = fs::read_dir(layout.averages_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(averages.len(), 1);
    assert_constant_volume(&layout.average_path(&rigid), 3.0);
}
