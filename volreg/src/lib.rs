//! volreg - Filesystem-coordinated 3D volume registration pipeline
//!
//! This library coordinates a multi-stage image-registration workflow in
//! which multiple independent worker processes cooperate, through a shared
//! filesystem only, to register many specimen volumes against a series of
//! evolving population averages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PipelineDriver                          │
//! │  Iterate stage definitions, thread the fixed volume through  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                     StageCoordinator                         │
//! │  SelectWork → Register → AwaitStageBarrier → AverageElection │
//! ├───────────────────┬──────────────────┬───────────────────────┤
//! │ CoordinationStore │    Registrator   │    AverageBuilder     │
//! │ existence markers │ elastix (extern) │   voxel-wise mean     │
//! └───────────────────┴──────────────────┴───────────────────────┘
//! ```
//!
//! # Coordination model
//!
//! There is no scheduler, message bus, or shared memory. Workers agree on
//! who registers which specimen, when a stage is complete, and which single
//! worker builds the stage's population average using one filesystem
//! primitive: atomic create-if-absent file creation. Markers are
//! existence-only; their presence is the entire payload. They are created
//! once and never deleted.
//!
//! # Example
//!
//! ```ignore
//! use volreg::clock::SystemClock;
//! use volreg::config::PipelineConfig;
//! use volreg::pipeline::PipelineDriver;
//! use volreg::registration::ElastixRegistrator;
//!
//! let config = PipelineConfig::load_from(&config_path)?;
//! let registrator = ElastixRegistrator::new("elastix", config.threads);
//! let driver = PipelineDriver::new(&config, &inputs_dir, &output_dir, &registrator, &SystemClock);
//!
//! // Run this worker's share of every stage. Safe to run concurrently
//! // with any number of other worker processes on the same directories.
//! driver.run()?;
//! ```

pub mod average;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod layout;
pub mod logging;
pub mod marker;
pub mod pipeline;
pub mod registration;
pub mod volume;
