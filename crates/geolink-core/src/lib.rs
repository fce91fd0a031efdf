//! Core types for the geolink multi-source event pipeline: the canonical
//! record schema, quality flags, configuration with its fingerprint, the
//! event catalog, and the unified error type.

pub mod config;
pub mod error;
pub mod event;
pub mod record;
pub mod time;

pub use config::{compute_params_hash, deep_merge, load_config, PipelineConfig};
pub use error::{GeolinkError, GeolinkResult};
pub use event::Event;
pub use record::{FilterParams, ProcStage, QualityFlags, Record, Source};
