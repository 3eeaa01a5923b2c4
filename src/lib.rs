// src/lib.rs
//
// =============================================================================
// REPX-LAB: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.
//
// Bottom-up: resources/params -> stage -> wiring/scatter -> pipeline ->
// workflow (run graph) -> lab -> packager.

// 1. Declare Modules
pub mod config;
pub mod core;
pub mod error;
pub mod lab;
pub mod logs;
pub mod packager;
pub mod params;
pub mod pipeline;
pub mod provenance;
pub mod resources;
pub mod scatter;
pub mod stage;
pub mod wiring;
pub mod workflow;

pub mod dsl;

// 2. Re-exports (The Public API)

pub use config::BuildConfig;
pub use core::{DependencyKind, InputMapping, InputSource, Job, JobId, Params, StageType};
pub use error::{BuildError, ErrorKind, Result};
pub use lab::{LabSpec, ResolvedLab, ResolvedRun, RunSpec};
pub use packager::{package, verify, PackageReport};
pub use resources::ResourceHint;
pub use scatter::ScatterGatherPlan;
pub use stage::StageSpec;
pub use workflow::RunGraph;
