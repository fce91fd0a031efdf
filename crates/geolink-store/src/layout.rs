//! The output directory tree. `OutputPaths` is the single owner of the
//! layout; stages receive an immutable reference and never invent paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub root: PathBuf,
    pub manifests: PathBuf,
    pub ingest: PathBuf,
    pub raw: PathBuf,
    pub raw_index: PathBuf,
    pub standard: PathBuf,
    pub linked: PathBuf,
    pub features: PathBuf,
    pub models: PathBuf,
    pub plots: PathBuf,
    pub reports: PathBuf,
    pub events: PathBuf,
}

impl OutputPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        OutputPaths {
            manifests: root.join("manifests"),
            ingest: root.join("ingest"),
            raw: root.join("raw"),
            raw_index: root.join("raw").join("index"),
            standard: root.join("standard"),
            linked: root.join("linked"),
            features: root.join("features"),
            models: root.join("models"),
            plots: root.join("plots"),
            reports: root.join("reports"),
            events: root.join("events"),
            root,
        }
    }

    /// Create every directory; safe to call repeatedly.
    pub fn ensure(&self) -> Result<()> {
        for path in [
            &self.root,
            &self.manifests,
            &self.ingest,
            &self.raw,
            &self.raw_index,
            &self.standard,
            &self.linked,
            &self.features,
            &self.models,
            &self.plots,
            &self.reports,
            &self.events,
        ] {
            fs::create_dir_all(path)
                .with_context(|| format!("creating output directory '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Per-event linked artifacts directory.
    pub fn linked_event(&self, event_id: &str) -> PathBuf {
        self.linked.join(event_id)
    }

    /// Per-event features artifacts directory.
    pub fn features_event(&self, event_id: &str) -> PathBuf {
        self.features.join(event_id)
    }

    /// Final packaged event directory.
    pub fn event_package(&self, event_id: &str) -> PathBuf {
        self.events.join(event_id)
    }
}

/// Create a directory (and parents) if needed.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating directory '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(dir.path().join("out"));
        paths.ensure().unwrap();
        paths.ensure().unwrap();
        assert!(paths.raw_index.is_dir());
        assert!(paths.events.is_dir());
    }

    #[test]
    fn event_paths_nest_under_their_sections() {
        let paths = OutputPaths::new("out");
        assert_eq!(paths.linked_event("ev1"), PathBuf::from("out/linked/ev1"));
        assert_eq!(paths.event_package("ev1"), PathBuf::from("out/events/ev1"));
    }
}
