//! CLI command implementations.

pub mod average;
pub mod check;
pub mod run;
