//! Event packaging: assemble the per-event artifact tree in a scratch
//! directory, verify it against the required-file list, and commit it with
//! a single rename so readers only ever see a complete package.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::ZipWriter;

use geolink_store::layout::{ensure_dir, OutputPaths};

use crate::report::write_json;
use crate::summary::{render_event_summary, SummaryFormat};

/// Files a complete package must contain, relative to the event directory.
pub const REQUIRED_FILES: [&str; 15] = [
    "event.json",
    "linked/summary.json",
    "linked/aligned.parquet",
    "linked/stations.json",
    "features/summary.json",
    "features/features.parquet",
    "features/anomaly.parquet",
    "plots/html/plot_aligned_timeseries.html",
    "plots/html/plot_station_map.html",
    "plots/html/plot_filter_effect.html",
    "reports/dq_event_link.json",
    "reports/dq_event_features.json",
    "reports/dq_plots.json",
    "reports/filter_effect.json",
    "reports/event_summary.md",
];

pub const OPTIONAL_FILES: [&str; 1] = ["plots/html/plot_vlf_spectrogram.html"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub exists: bool,
    pub bytes: u64,
    pub mtime_utc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsManifest {
    pub required_files: Vec<FileInfo>,
    pub optional_files: Vec<FileInfo>,
    pub missing_required: Vec<String>,
    pub completeness_ratio_required: f64,
}

fn file_info(event_dir: &Path, rel: &str) -> FileInfo {
    let path = event_dir.join(rel);
    match path.metadata() {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .map(|stamp| {
                    let stamp: DateTime<Utc> = stamp.into();
                    stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
                });
            FileInfo {
                path: rel.to_string(),
                exists: true,
                bytes: meta.len(),
                mtime_utc: mtime,
            }
        }
        Err(_) => FileInfo {
            path: rel.to_string(),
            exists: false,
            bytes: 0,
            mtime_utc: None,
        },
    }
}

/// Inventory the required/optional files of an assembled event directory.
pub fn build_artifacts_manifest(event_dir: &Path) -> ArtifactsManifest {
    let required: Vec<FileInfo> = REQUIRED_FILES
        .iter()
        .map(|rel| file_info(event_dir, rel))
        .collect();
    let optional: Vec<FileInfo> = OPTIONAL_FILES
        .iter()
        .map(|rel| file_info(event_dir, rel))
        .collect();
    let missing_required: Vec<String> = required
        .iter()
        .filter(|info| !info.exists)
        .map(|info| info.path.clone())
        .collect();
    let completeness_ratio_required = if required.is_empty() {
        0.0
    } else {
        1.0 - missing_required.len() as f64 / required.len() as f64
    };
    ArtifactsManifest {
        required_files: required,
        optional_files: optional,
        missing_required,
        completeness_ratio_required,
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("relativizing copied path")?;
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        std::fs::copy(entry.path(), &target).with_context(|| {
            format!(
                "copying '{}' to '{}'",
                entry.path().display(),
                target.display()
            )
        })?;
    }
    Ok(())
}

/// Assemble and commit `events/<event_id>`.
///
/// In strict mode a missing required file renames the scratch to
/// `.failed_<run_id>`, writes a `FAIL` marker plus `finalize_fail.json`,
/// and returns an error (the CLI exits 1). Otherwise the scratch replaces
/// the final directory atomically and `DONE` is touched.
pub fn finalize_event_package(
    paths: &OutputPaths,
    event_id: &str,
    run_id: &str,
    strict: bool,
) -> Result<PathBuf> {
    let tmp_name = format!(".tmp_{event_id}_{run_id}");
    let tmp_dir = paths.events.join(&tmp_name);
    let final_dir = paths.event_package(event_id);
    if tmp_dir.exists() {
        std::fs::remove_dir_all(&tmp_dir)
            .with_context(|| format!("clearing stale scratch '{}'", tmp_dir.display()))?;
    }
    ensure_dir(&tmp_dir.join("reports"))?;

    let linked_dir = paths.linked_event(event_id);
    let features_dir = paths.features_event(event_id);
    copy_tree(&linked_dir, &tmp_dir.join("linked"))?;
    copy_tree(&features_dir, &tmp_dir.join("features"))?;
    copy_tree(
        &paths.plots.join("html").join(event_id),
        &tmp_dir.join("plots/html"),
    )?;
    copy_tree(
        &paths.plots.join("spec").join(event_id),
        &tmp_dir.join("plots/spec"),
    )?;

    if linked_dir.join("event.json").exists() {
        std::fs::copy(linked_dir.join("event.json"), tmp_dir.join("event.json"))
            .context("copying event.json")?;
    }

    // Event-level DQ reports under their packaged names.
    let report_sources = [
        ("dq_event_link.json", linked_dir.join("dq_linked.json")),
        ("dq_event_features.json", features_dir.join("dq_features.json")),
        (
            "dq_plots.json",
            paths.plots.join("spec").join(event_id).join("dq_plots.json"),
        ),
        ("filter_effect.json", paths.reports.join("filter_effect.json")),
    ];
    for (name, src) in report_sources {
        if src.exists() {
            std::fs::copy(&src, tmp_dir.join("reports").join(name))
                .with_context(|| format!("copying report '{name}'"))?;
        }
    }

    // Summary is rendered after the assets are in place so its plot links
    // and DQ notes reflect the assembled tree.
    render_event_summary(&tmp_dir, event_id, SummaryFormat::Md)?;

    let manifest = build_artifacts_manifest(&tmp_dir);
    write_json(
        &tmp_dir.join("reports/artifacts_manifest.json"),
        &manifest,
    )?;

    if !manifest.missing_required.is_empty() && strict {
        warn!(
            event_id,
            missing = manifest.missing_required.len(),
            "strict finalize failed"
        );
        write_json(
            &tmp_dir.join("reports/finalize_fail.json"),
            &serde_json::json!({
                "missing_required": &manifest.missing_required,
                "run_id": &tmp_name,
            }),
        )?;
        File::create(tmp_dir.join("FAIL")).context("writing FAIL marker")?;
        let failed_dir = paths.events.join(format!(".failed_{tmp_name}"));
        if failed_dir.exists() {
            std::fs::remove_dir_all(&failed_dir)
                .with_context(|| format!("clearing '{}'", failed_dir.display()))?;
        }
        std::fs::rename(&tmp_dir, &failed_dir)
            .with_context(|| format!("renaming scratch to '{}'", failed_dir.display()))?;
        return Err(anyhow!(
            "finalize failed for event '{event_id}': {} required file(s) missing",
            manifest.missing_required.len()
        ));
    }

    if final_dir.exists() {
        std::fs::remove_dir_all(&final_dir)
            .with_context(|| format!("replacing '{}'", final_dir.display()))?;
    }
    std::fs::rename(&tmp_dir, &final_dir)
        .with_context(|| format!("committing '{}'", final_dir.display()))?;
    File::create(final_dir.join("DONE")).context("writing DONE marker")?;
    info!(
        event_id,
        completeness = manifest.completeness_ratio_required,
        "event package committed"
    );
    Ok(final_dir)
}

/// Zip the final event directory into `event_bundle.zip` (refreshing the
/// summary first). The bundle itself is excluded from the archive.
pub fn make_event_bundle(event_dir: &Path, event_id: &str) -> Result<PathBuf> {
    if !event_dir.exists() {
        return Err(anyhow!(
            "event directory not found: {}",
            event_dir.display()
        ));
    }
    render_event_summary(event_dir, event_id, SummaryFormat::Md)?;

    let bundle_path = event_dir.join("event_bundle.zip");
    if bundle_path.exists() {
        std::fs::remove_file(&bundle_path).context("removing stale bundle")?;
    }
    let file = File::create(&bundle_path)
        .with_context(|| format!("creating '{}'", bundle_path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(event_dir) {
        let entry = entry.context("walking event directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path() == bundle_path {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(event_dir)
            .context("relativizing bundle path")?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        writer
            .start_file(&rel, options)
            .with_context(|| format!("adding '{rel}' to bundle"))?;
        let mut input = File::open(entry.path())
            .with_context(|| format!("opening '{}'", entry.path().display()))?;
        io::copy(&mut input, &mut writer)
            .with_context(|| format!("compressing '{rel}'"))?;
    }
    writer.finish().context("finishing bundle")?;
    Ok(bundle_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed_minimal_event(paths: &OutputPaths, event_id: &str, with_link_dq: bool) {
        use geolink_store::frame::write_parquet_file;

        paths.ensure().unwrap();
        let linked = paths.linked_event(event_id);
        std::fs::create_dir_all(&linked).unwrap();
        std::fs::write(
            linked.join("event.json"),
            serde_json::json!({"event_id": event_id}).to_string(),
        )
        .unwrap();
        std::fs::write(linked.join("summary.json"), "{}").unwrap();
        crate::link::write_aligned(&[], &linked.join("aligned.parquet"), "zstd").unwrap();
        std::fs::write(linked.join("stations.json"), "{}").unwrap();
        if with_link_dq {
            std::fs::write(linked.join("dq_linked.json"), "{}").unwrap();
        }

        let features = paths.features_event(event_id);
        std::fs::create_dir_all(&features).unwrap();
        std::fs::write(features.join("summary.json"), "{}").unwrap();
        let mut features_df = crate::features::features_to_frame(&[]).unwrap();
        write_parquet_file(&mut features_df, &features.join("features.parquet"), "zstd").unwrap();
        let mut anomaly_df = crate::model::anomalies_to_frame(&[]).unwrap();
        write_parquet_file(&mut anomaly_df, &features.join("anomaly.parquet"), "zstd").unwrap();
        std::fs::write(features.join("dq_features.json"), "{}").unwrap();

        let html = paths.plots.join("html").join(event_id);
        std::fs::create_dir_all(&html).unwrap();
        for name in [
            "plot_aligned_timeseries.html",
            "plot_station_map.html",
            "plot_filter_effect.html",
        ] {
            std::fs::write(html.join(name), "<html></html>").unwrap();
        }
        let spec = paths.plots.join("spec").join(event_id);
        std::fs::create_dir_all(&spec).unwrap();
        std::fs::write(spec.join("dq_plots.json"), "{}").unwrap();
        std::fs::write(paths.reports.join("filter_effect.json"), "{}").unwrap();
    }

    #[test]
    fn strict_failure_leaves_fail_marker_and_failed_dir() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(dir.path().join("outputs"));
        // dq_linked.json missing -> reports/dq_event_link.json missing.
        seed_minimal_event(&paths, "ev1", false);

        let result = finalize_event_package(&paths, "ev1", "run1", true);
        assert!(result.is_err());

        let failed_dir = paths.events.join(".failed_.tmp_ev1_run1");
        assert!(failed_dir.is_dir());
        assert!(failed_dir.join("FAIL").exists());
        assert!(!paths.event_package("ev1").exists());

        let fail: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(failed_dir.join("reports/finalize_fail.json")).unwrap(),
        )
        .unwrap();
        let missing: Vec<String> = fail["missing_required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(missing.contains(&"reports/dq_event_link.json".to_string()));
    }

    #[test]
    fn complete_package_commits_with_done_marker() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(dir.path().join("outputs"));
        seed_minimal_event(&paths, "ev1", true);

        let final_dir = finalize_event_package(&paths, "ev1", "run1", true).unwrap();
        assert!(final_dir.join("DONE").exists());
        assert!(!final_dir.join("FAIL").exists());
        assert!(final_dir.join("reports/artifacts_manifest.json").exists());
        assert!(final_dir.join("reports/event_summary.md").exists());

        let manifest: ArtifactsManifest = serde_json::from_str(
            &std::fs::read_to_string(final_dir.join("reports/artifacts_manifest.json")).unwrap(),
        )
        .unwrap();
        assert!(manifest.missing_required.is_empty());
        assert_eq!(manifest.completeness_ratio_required, 1.0);
    }

    #[test]
    fn finalize_is_idempotent() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(dir.path().join("outputs"));
        seed_minimal_event(&paths, "ev1", true);

        finalize_event_package(&paths, "ev1", "run1", false).unwrap();
        let final_dir = finalize_event_package(&paths, "ev1", "run2", false).unwrap();
        assert!(final_dir.join("DONE").exists());
        let manifest: ArtifactsManifest = serde_json::from_str(
            &std::fs::read_to_string(final_dir.join("reports/artifacts_manifest.json")).unwrap(),
        )
        .unwrap();
        assert!(manifest.missing_required.is_empty());
    }

    #[test]
    fn bundle_contains_the_tree_but_not_itself() {
        let dir = tempdir().unwrap();
        let paths = OutputPaths::new(dir.path().join("outputs"));
        seed_minimal_event(&paths, "ev1", true);
        let final_dir = finalize_event_package(&paths, "ev1", "run1", false).unwrap();

        let bundle = make_event_bundle(&final_dir, "ev1").unwrap();
        assert!(bundle.exists());
        // Re-bundling replaces the archive without recursing into it.
        let bundle = make_event_bundle(&final_dir, "ev1").unwrap();
        let file = std::fs::File::open(&bundle).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"event.json"));
        assert!(names.contains(&"reports/event_summary.md"));
        assert!(!names.contains(&"event_bundle.zip"));
    }
}
