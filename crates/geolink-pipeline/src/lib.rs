//! The stage pipeline: ingest through event packaging.
//!
//! Stages run in a fixed order (`manifest → ingest → raw → standard →
//! spatial → link → features → model → plots`) over a shared
//! [`context::StageContext`]. Each stage reads the previous stage's
//! committed outputs, writes its own append-only artifacts, and always
//! leaves a DQ report behind, even on the empty path.

pub mod context;
pub mod features;
pub mod ingest;
pub mod link;
pub mod model;
pub mod package;
pub mod plots;
pub mod raw;
pub mod report;
pub mod runner;
pub mod spatial;
pub mod standard;
pub mod summary;

pub use context::{Providers, StageContext};
pub use runner::{parse_stages, run_stages, Stage, StageTiming, STAGE_ORDER};
