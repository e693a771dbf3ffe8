//! Stage coordinator: one worker's cooperative work loop for one stage.
//!
//! Every worker process runs this same state machine against the shared
//! coordination store. No worker is special; leadership for the averaging
//! step is decided at the last moment by an atomic marker acquisition.
//!
//! ```text
//!            ┌────────────┐ unclaimed specimen ┌──────────┐
//!      ─────►│ SelectWork ├───────────────────►│ Register │
//!            └─────┬──────┘                    └────┬─────┘
//!                  │ none left                      │ spec_done
//!                  ▼                                │
//!        ┌───────────────────┐◄─────────────────────┘
//!        │ AwaitStageBarrier │  poll: every specimen has spec_done?
//!        └────────┬──────────┘
//!                 ▼
//!        ┌─────────────────┐  avg_done?   ─► StageComplete
//!        │ AverageElection │  avg_started? ─► sleep, re-poll
//!        └─────────────────┘  else try_acquire(avg_started):
//!                             won  ─► build average, avg_done, done
//!                             lost ─► sleep, re-poll
//! ```
//!
//! Recovery properties: every transition is driven by durable markers, so
//! killing a worker and starting a fresh one reproduces a correct final
//! state. Two stuck states are preserved deliberately and require operator
//! intervention: a specimen claimed but never finished (its claim is never
//! reclaimed), and an `avg_started` whose creator died before `avg_done`
//! (no timeout expiry exists).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::average::{AverageBuilder, AverageError};
use crate::clock::Clock;
use crate::layout::{SpecimenId, StageId};
use crate::marker::{Acquire, CoordinationStore, Marker, StoreError};
use crate::registration::{RegistrationError, RegistrationRequest, Registrator};

/// Fixed backoff between polls of the barrier and election states.
///
/// Stage durations are minutes to hours, so polling overhead at this
/// interval is negligible.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors that end this worker's participation in a stage.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("registration failed for specimen {specimen}: {source}")]
    Registration {
        specimen: SpecimenId,
        source: RegistrationError,
    },

    #[error("average construction failed for stage {stage}: {source}")]
    Average {
        stage: StageId,
        source: AverageError,
    },
}

/// Everything one stage run needs to know, resolved by the pipeline
/// driver before the coordinator starts.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: StageId,

    /// Every specimen participating in the pipeline run.
    pub specimens: BTreeSet<SpecimenId>,

    /// Rendered parameter-file content, deterministic from configuration.
    pub param_text: String,

    /// Volume file extension, without the leading dot.
    pub extension: String,

    /// Raw-input directory; source of stage-0 moving volumes.
    pub inputs_dir: PathBuf,

    /// Previous stage, whose per-specimen outputs are this stage's moving
    /// volumes. `None` for stage 0.
    pub prev_stage: Option<StageId>,

    /// Fixed/target volume for this stage: the previous stage's average,
    /// or the externally supplied target for stage 0.
    pub fixed: PathBuf,
}

impl StageContext {
    fn spec_done(&self, specimen: &SpecimenId) -> Marker {
        Marker::SpecDone {
            stage: self.stage.clone(),
            specimen: specimen.clone(),
        }
    }

    fn avg_started(&self) -> Marker {
        Marker::AvgStarted {
            stage: self.stage.clone(),
        }
    }

    fn avg_done(&self) -> Marker {
        Marker::AvgDone {
            stage: self.stage.clone(),
        }
    }
}

/// Drives one worker through one stage until the stage is complete
/// application-wide (every specimen registered and the average written).
pub struct StageCoordinator<'a> {
    store: &'a dyn CoordinationStore,
    registrator: &'a dyn Registrator,
    averager: &'a dyn AverageBuilder,
    clock: &'a dyn Clock,
    poll_interval: Duration,
}

impl<'a> StageCoordinator<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        registrator: &'a dyn Registrator,
        averager: &'a dyn AverageBuilder,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            registrator,
            averager,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll backoff. Affects only how often this worker
    /// re-reads markers, never the protocol itself.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs the stage to completion for this worker.
    ///
    /// Returns once `avg_done` exists for the stage, whether this worker
    /// built the average or observed another worker's.
    pub fn run_stage(&self, ctx: &StageContext) -> Result<(), CoordinatorError> {
        info!(stage = %ctx.stage, specimens = ctx.specimens.len(), "entering stage");

        // SelectWork: claim and register until no unclaimed specimen
        // remains. Selection is advisory only - another worker may race
        // us to the same specimen, which costs a duplicate registration
        // but never correctness.
        loop {
            let claimed = self.store.claimed(&ctx.stage)?;
            match ctx.specimens.iter().find(|s| !claimed.contains(*s)) {
                Some(specimen) => self.register_one(ctx, specimen)?,
                None => break,
            }
        }

        self.await_barrier(ctx)?;
        self.finish_average(ctx)?;

        info!(stage = %ctx.stage, "stage complete");
        Ok(())
    }

    /// Register state: one specimen from claim to completion marker.
    fn register_one(&self, ctx: &StageContext, specimen: &SpecimenId) -> Result<(), CoordinatorError> {
        let work_dir = self.store.claim(&ctx.stage, specimen)?;
        let param_file = self.store.ensure_stage_params(&ctx.stage, &ctx.param_text)?;

        let moving = match &ctx.prev_stage {
            None => ctx
                .inputs_dir
                .join(format!("{}.{}", specimen, ctx.extension)),
            Some(prev) => self.store.specimen_output(prev, specimen),
        };
        let output = self.store.specimen_output(&ctx.stage, specimen);

        info!(
            stage = %ctx.stage,
            specimen = %specimen,
            moving = %moving.display(),
            "claimed specimen"
        );

        let request = RegistrationRequest {
            specimen,
            param_file: &param_file,
            moving: &moving,
            fixed: &ctx.fixed,
            work_dir: &work_dir,
            output: &output,
        };

        // May block for a long time; that is expected. Failure is fatal
        // to this worker's stage - the operator re-invokes the pipeline,
        // which resumes from the markers already on disk.
        self.registrator
            .register(&request)
            .map_err(|source| CoordinatorError::Registration {
                specimen: specimen.clone(),
                source,
            })?;

        self.store.mark(&ctx.spec_done(specimen))?;
        info!(stage = %ctx.stage, specimen = %specimen, "specimen registered");
        Ok(())
    }

    /// AwaitStageBarrier: poll until every specimen has its completion
    /// marker. Exits only when the barrier is fully down.
    fn await_barrier(&self, ctx: &StageContext) -> Result<(), CoordinatorError> {
        loop {
            let mut pending = 0usize;
            for specimen in &ctx.specimens {
                if !self.store.is_set(&ctx.spec_done(specimen))? {
                    pending += 1;
                }
            }
            if pending == 0 {
                return Ok(());
            }
            debug!(stage = %ctx.stage, pending, "waiting at stage barrier");
            self.clock.sleep(self.poll_interval);
        }
    }

    /// AverageElection: decide who builds the average, then wait for it.
    ///
    /// Exits only once `avg_done` exists. A lost race keeps polling for
    /// `avg_done` rather than assuming the winner finishes; if the winner
    /// crashed between the two markers this loop polls forever, which is
    /// the documented stuck state an operator resolves by removing
    /// `avg_started`.
    fn finish_average(&self, ctx: &StageContext) -> Result<(), CoordinatorError> {
        loop {
            if self.store.is_set(&ctx.avg_done())? {
                debug!(stage = %ctx.stage, "average already built");
                return Ok(());
            }

            if self.store.is_set(&ctx.avg_started())? {
                debug!(stage = %ctx.stage, "average in progress elsewhere");
                self.clock.sleep(self.poll_interval);
                continue;
            }

            match self.store.try_acquire(&ctx.avg_started())? {
                Acquire::Acquired => {
                    info!(stage = %ctx.stage, "won average election");
                    self.averager
                        .build(&ctx.stage)
                        .map_err(|source| CoordinatorError::Average {
                            stage: ctx.stage.clone(),
                            source,
                        })?;
                    self.store.mark(&ctx.avg_done())?;
                    return Ok(());
                }
                Acquire::AlreadyHeld => {
                    warn!(stage = %ctx.stage, "lost average election");
                    self.clock.sleep(self.poll_interval);
                }
            }
        }
    }
}
