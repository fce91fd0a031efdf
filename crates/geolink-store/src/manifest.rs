//! Input-file manifest: enumerate the configured source files with size,
//! mtime, and SHA-256 so a run's inputs are reproducible.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use geolink_core::config::PipelineConfig;
use geolink_core::time::utc_now_iso;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub source: String,
    pub path: String,
    pub size_bytes: u64,
    pub mtime_utc: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub params_hash: String,
    pub generated_at_utc: String,
    pub total_files: usize,
    pub total_bytes: u64,
    pub files: Vec<ManifestFile>,
}

/// SHA-256 of a file, streamed in 1 MiB chunks.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// Files under `root` matching any of the glob `patterns`, sorted, capped
/// at `max_files`. A missing root yields an empty list.
pub fn collect_files(
    root: &Path,
    patterns: &[String],
    max_files: Option<usize>,
) -> Result<Vec<PathBuf>> {
    if patterns.is_empty() || !root.exists() {
        return Ok(Vec::new());
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("invalid file pattern '{pattern}'"))?;
        builder.add(glob);
    }
    let set = builder.build().context("building file pattern set")?;

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.strip_prefix(root)
                .map(|rel| set.is_match(rel) || rel.file_name().is_some_and(|n| set.is_match(n)))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    if let Some(cap) = max_files {
        files.truncate(cap);
    }
    Ok(files)
}

fn mtime_utc(path: &Path) -> Result<String> {
    let modified = path
        .metadata()
        .and_then(|meta| meta.modified())
        .with_context(|| format!("reading mtime of '{}'", path.display()))?;
    let stamp: DateTime<Utc> = modified.into();
    Ok(stamp.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Enumerate every configured input file with size/mtime/sha256.
pub fn build_manifest(
    base_dir: &Path,
    config: &PipelineConfig,
    run_id: &str,
    params_hash: &str,
) -> Result<RunManifest> {
    let max_files = config.limits.max_files_per_source;

    // Source name -> (root, patterns)
    let mut spec: BTreeMap<&str, (PathBuf, Vec<String>)> = BTreeMap::new();
    spec.insert(
        "geomag",
        (
            base_dir.join(&config.paths.geomag.root),
            config.paths.geomag.resolve_patterns(),
        ),
    );
    spec.insert(
        "aef",
        (
            base_dir.join(&config.paths.aef.root),
            config.paths.aef.resolve_patterns(),
        ),
    );
    let mut seismic_patterns = config.paths.seismic.mseed_patterns.clone();
    seismic_patterns.extend(config.paths.seismic.sac_patterns.iter().cloned());
    if let Some(stationxml) = &config.paths.seismic.stationxml {
        if let Some(name) = Path::new(stationxml).file_name() {
            seismic_patterns.push(name.to_string_lossy().to_string());
        }
    }
    spec.insert(
        "seismic",
        (base_dir.join(&config.paths.seismic.root), seismic_patterns),
    );
    spec.insert(
        "vlf",
        (
            base_dir.join(&config.paths.vlf.root),
            config.paths.vlf.patterns.clone(),
        ),
    );

    let mut files = Vec::new();
    for (source, (root, patterns)) in spec {
        for path in collect_files(&root, &patterns, max_files)? {
            let size_bytes = path.metadata().map(|meta| meta.len()).unwrap_or(0);
            let rel = path
                .strip_prefix(base_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            files.push(ManifestFile {
                source: source.to_string(),
                path: rel,
                size_bytes,
                mtime_utc: mtime_utc(&path)?,
                sha256: compute_sha256(&path)?,
            });
        }
    }

    Ok(RunManifest {
        run_id: run_id.to_string(),
        params_hash: params_hash.to_string(),
        generated_at_utc: utc_now_iso(),
        total_files: files.len(),
        total_bytes: files.iter().map(|file| file.size_bytes).sum(),
        files,
    })
}

/// Write the manifest as pretty JSON.
pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating manifest directory '{}'", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(manifest).context("serializing run manifest")?;
    std::fs::write(path, json)
        .with_context(|| format!("writing run manifest '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn sha256_matches_known_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn collect_honors_patterns_and_cap() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.min"), "x").unwrap();
        fs::write(dir.path().join("b.min"), "x").unwrap();
        fs::write(dir.path().join("c.sec"), "x").unwrap();

        let all = collect_files(dir.path(), &["*.min".to_string()], None).unwrap();
        assert_eq!(all.len(), 2);

        let capped = collect_files(dir.path(), &["*.min".to_string()], Some(1)).unwrap();
        assert_eq!(capped.len(), 1);

        let missing = collect_files(&dir.path().join("nope"), &["*.min".to_string()], None).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn manifest_totals_add_up() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("geomag");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("abk.min"), b"0123456789").unwrap();

        let mut config = PipelineConfig::default();
        config.paths.geomag.root = "geomag".to_string();
        config.paths.geomag.patterns = vec!["*.min".to_string()];

        let manifest = build_manifest(dir.path(), &config, "run1", "abcdef012345").unwrap();
        assert_eq!(manifest.total_files, 1);
        assert_eq!(manifest.total_bytes, 10);
        assert_eq!(manifest.files[0].source, "geomag");
        assert_eq!(manifest.files[0].path, "geomag/abk.min");
        assert_eq!(manifest.files[0].sha256.len(), 64);

        let out = dir.path().join("manifests/run_run1.json");
        write_manifest(&out, &manifest).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        let parsed: RunManifest = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.total_files, 1);
    }
}
