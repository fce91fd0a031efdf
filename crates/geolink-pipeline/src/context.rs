//! Shared, read-only state handed to every stage.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use geolink_core::config::{compute_params_hash, PipelineConfig};
use geolink_core::event::Event;
use geolink_io::seismic::TraceProvider;
use geolink_io::vlf::SpectrogramProvider;
use geolink_store::OutputPaths;

/// Pluggable decoders for the formats the core does not parse itself.
#[derive(Clone, Default)]
pub struct Providers {
    pub seismic: Option<Arc<dyn TraceProvider>>,
    pub vlf: Option<Arc<dyn SpectrogramProvider>>,
}

/// Immutable snapshot a run is executed against. Computed once at run
/// start; no stage mutates it.
#[derive(Clone)]
pub struct StageContext {
    pub base_dir: PathBuf,
    pub config: PipelineConfig,
    pub paths: OutputPaths,
    pub run_id: String,
    pub params_hash: String,
    pub strict: bool,
    pub event_id: Option<String>,
    pub providers: Providers,
}

impl StageContext {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        config: PipelineConfig,
        run_id: impl Into<String>,
        strict: bool,
        event_id: Option<String>,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        let params_hash = compute_params_hash(&config)?;
        let output_root = if config.outputs.root.is_absolute() {
            config.outputs.root.clone()
        } else {
            base_dir.join(&config.outputs.root)
        };
        let paths = OutputPaths::new(output_root);
        paths.ensure()?;
        Ok(StageContext {
            base_dir,
            config,
            paths,
            run_id: run_id.into(),
            params_hash,
            strict,
            event_id,
            providers: Providers::default(),
        })
    }

    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    /// The event this run targets: the `--event_id` selection, or the
    /// first configured event.
    pub fn event(&self) -> Result<&Event> {
        self.config.event(self.event_id.as_deref())
    }

    pub fn proc_version(&self) -> &str {
        &self.config.pipeline.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn context_creates_layout_and_hash() {
        let dir = tempdir().unwrap();
        let ctx = StageContext::new(
            dir.path(),
            PipelineConfig::default(),
            "run1",
            false,
            None,
        )
        .unwrap();
        assert_eq!(ctx.params_hash.len(), 12);
        assert!(ctx.paths.reports.is_dir());
        assert!(ctx.paths.raw.is_dir());
        assert!(ctx.event().is_err()); // no events configured
    }
}
