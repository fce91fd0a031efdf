//! Ingest: parse IAGA files into canonical records, index seismic traces
//! (joined against the StationXML inventory), and catalog VLF
//! spectrograms. Parser failures on individual files are recorded in the
//! DQ reports and skipped; one bad file never aborts a source.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use geolink_core::record::{Record, Source};
use geolink_io::iaga;
use geolink_io::stationxml::{join_station_metadata, load_station_metadata, StationMatchReport};
use geolink_io::vlf::{gap_report, GapReport};
use geolink_store::manifest::collect_files;
use geolink_store::partition::write_partitioned;

use crate::context::StageContext;
use crate::report::{basic_stats, write_dq_report, write_json};

#[derive(Debug, Clone, Serialize)]
struct VlfCatalogEntry {
    station_id: String,
    file: String,
    ts_start_ns: Option<i64>,
    ts_end_ns: Option<i64>,
    n_time: usize,
    n_freq: usize,
    freq_min: Option<f64>,
    freq_max: Option<f64>,
}

fn ingest_iaga(ctx: &StageContext, source: Source) -> Result<(Vec<Record>, Vec<String>)> {
    let section = match source {
        Source::Geomag => &ctx.config.paths.geomag,
        _ => &ctx.config.paths.aef,
    };
    let root = ctx.base_dir.join(&section.root);
    let files = collect_files(
        &root,
        &section.resolve_patterns(),
        ctx.config.limits.max_files_per_source,
    )?;
    let max_rows = ctx.config.limits.max_rows_per_source;
    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for path in files {
        match iaga::parse_file(&path, source, &ctx.params_hash, ctx.proc_version()) {
            Ok(parsed) => records.extend(parsed),
            Err(err) => {
                warn!(
                    file = %path.display(),
                    error = %err,
                    "skipping unparseable IAGA file"
                );
                skipped.push(path.display().to_string());
            }
        }
        if let Some(cap) = max_rows {
            if records.len() >= cap {
                records.truncate(cap);
                break;
            }
        }
    }
    Ok((records, skipped))
}

pub fn run_ingest(ctx: &StageContext) -> Result<()> {
    let parquet = &ctx.config.storage.parquet;
    let mut dq_iaga = BTreeMap::new();

    // IAGA sources land unpartitioned under ingest/<source>; the raw stage
    // repartitions them.
    for source in [Source::Geomag, Source::Aef] {
        let (records, skipped) = ingest_iaga(ctx, source)?;
        let ingest_dir = ctx.paths.ingest.join(source.as_str());
        if ingest_dir.exists() {
            std::fs::remove_dir_all(&ingest_dir)?;
        }
        write_partitioned(
            &records,
            &ingest_dir,
            &[],
            &parquet.compression,
            parquet.batch_rows,
            None,
        )?;
        info!(source = source.as_str(), rows = records.len(), "ingested");
        let mut stats = serde_json::to_value(basic_stats(&records))?;
        if let serde_json::Value::Object(map) = &mut stats {
            map.insert("skipped_files".into(), serde_json::json!(skipped));
        }
        dq_iaga.insert(source.as_str().to_string(), stats);
    }
    write_dq_report(
        &ctx.paths.reports.join("dq_ingest_iaga.json"),
        serde_json::json!(dq_iaga),
    )?;

    ingest_seismic_index(ctx)?;
    ingest_vlf_catalog(ctx)?;
    Ok(())
}

fn ingest_seismic_index(ctx: &StageContext) -> Result<()> {
    let mut metas = Vec::new();
    let mut station_report = StationMatchReport::default();

    if let Some(provider) = &ctx.providers.seismic {
        let seismic_cfg = &ctx.config.paths.seismic;
        let traces = provider.traces(
            &ctx.base_dir.join(&seismic_cfg.root),
            &seismic_cfg.mseed_patterns,
            ctx.config.limits.max_files_per_source,
        )?;
        metas = traces.iter().map(|trace| trace.meta()).collect();

        if let Some(stationxml) = &seismic_cfg.stationxml {
            let xml_path = ctx.base_dir.join(stationxml);
            if xml_path.exists() && !metas.is_empty() {
                match load_station_metadata(&xml_path) {
                    Ok(inventory) => {
                        station_report = join_station_metadata(&mut metas, &inventory);
                    }
                    Err(err) => {
                        warn!(error = %err, "StationXML unreadable; traces keep no coordinates");
                    }
                }
            }
        }
    }

    write_json(&ctx.paths.ingest.join("seismic_index.json"), &metas)?;
    let dq = if metas.is_empty() {
        serde_json::json!({ "trace_count": 0, "ts_min": null, "ts_max": null })
    } else {
        serde_json::json!({
            "trace_count": metas.len(),
            "ts_min": metas.iter().map(|m| m.start_ms).min(),
            "ts_max": metas.iter().map(|m| m.end_ms).max(),
        })
    };
    write_dq_report(&ctx.paths.reports.join("dq_ingest_mseed.json"), dq)?;
    write_json(&ctx.paths.reports.join("station_match.json"), &station_report)?;
    Ok(())
}

fn ingest_vlf_catalog(ctx: &StageContext) -> Result<()> {
    let mut entries: Vec<VlfCatalogEntry> = Vec::new();
    let mut gap_reports: BTreeMap<String, GapReport> = BTreeMap::new();
    let mut dt_medians: Vec<f64> = Vec::new();

    if let Some(provider) = &ctx.providers.vlf {
        let vlf_cfg = &ctx.config.paths.vlf;
        let spectrograms = provider.spectrograms(
            &ctx.base_dir.join(&vlf_cfg.root),
            &vlf_cfg.patterns,
            ctx.config.limits.max_files_per_source,
        )?;
        for spec in &spectrograms {
            let gaps = gap_report(&spec.epoch_ns);
            if let Some(dt) = gaps.dt_median_s {
                dt_medians.push(dt);
            }
            let file_stem = Path::new(&spec.file_path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| spec.file_path.clone());
            gap_reports.insert(format!("{}/{}", spec.station_id, file_stem), gaps);
            entries.push(VlfCatalogEntry {
                station_id: spec.station_id.clone(),
                file: spec.file_path.clone(),
                ts_start_ns: spec.epoch_ns.first().copied(),
                ts_end_ns: spec.epoch_ns.last().copied(),
                n_time: spec.n_time(),
                n_freq: spec.n_freq(),
                freq_min: spec.freq_hz.iter().copied().reduce(f64::min),
                freq_max: spec.freq_hz.iter().copied().reduce(f64::max),
            });
        }
    }

    write_json(&ctx.paths.raw.join("vlf_catalog.json"), &entries)?;
    write_json(&ctx.paths.raw.join("vlf_gap_reports.json"), &gap_reports)?;

    let stations: std::collections::BTreeSet<&str> =
        entries.iter().map(|entry| entry.station_id.as_str()).collect();
    let dt_median_s = if dt_medians.is_empty() {
        None
    } else {
        let mut sorted = dt_medians.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted[sorted.len() / 2])
    };
    write_dq_report(
        &ctx.paths.reports.join("dq_ingest_vlf.json"),
        serde_json::json!({
            "files": entries.len(),
            "stations": stations.len(),
            "dt_median_s": dt_median_s,
        }),
    )?;
    Ok(())
}
