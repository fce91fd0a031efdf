//! Raw stage: restamp ingested geomag/AEF records into the partitioned raw
//! store and window seismic traces into coarse amplitude rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use tracing::info;

use geolink_core::record::{ProcStage, Record, Source};
use geolink_io::seismic::TraceMeta;
use geolink_store::partition::{read_records, PartitionedWriter};

use crate::context::StageContext;
use crate::report::{basic_stats, load_json, write_dq_report, write_json};

fn aggregate_window(data: &[f64], mode: &str) -> f64 {
    match mode {
        "mean_abs" => data.iter().map(|v| v.abs()).sum::<f64>() / data.len() as f64,
        "max_abs" => data.iter().fold(0.0f64, |acc, v| acc.max(v.abs())),
        _ => (data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64).sqrt(),
    }
}

fn clear_source(ctx: &StageContext, source: Source) -> Result<()> {
    let dir = ctx.paths.raw.join(format!("source={}", source.as_str()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("clearing '{}'", dir.display()))?;
    }
    Ok(())
}

pub fn run_raw(ctx: &StageContext) -> Result<()> {
    let parquet = &ctx.config.storage.parquet;
    let max_rows = ctx.config.limits.max_rows_per_source;
    let mut stats: BTreeMap<String, serde_json::Value> = BTreeMap::new();

    // Geomag / AEF: ingest output -> partitioned raw store.
    for source in [Source::Geomag, Source::Aef] {
        let ingest_dir = ctx.paths.ingest.join(source.as_str());
        if !ingest_dir.exists() {
            continue;
        }
        let mut records = read_records(&ingest_dir, None, max_rows)?;
        for rec in records.iter_mut() {
            rec.proc_stage = ProcStage::Raw;
            rec.proc_version = ctx.proc_version().to_string();
            rec.params_hash = ctx.params_hash.clone();
        }
        clear_source(ctx, source)?;
        let mut writer = PartitionedWriter::new(
            &ctx.paths.raw,
            &parquet.partition_cols,
            &parquet.compression,
            parquet.batch_rows,
        );
        writer.write(&records)?;
        info!(source = source.as_str(), rows = records.len(), "raw store written");
        stats.insert(
            source.as_str().to_string(),
            serde_json::to_value(basic_stats(&records))?,
        );
    }

    // Seismic: trace windows at the raw cadence, coordinates from the
    // ingest index.
    if let Some(provider) = &ctx.providers.seismic {
        let seismic_cfg = &ctx.config.paths.seismic;
        let traces = provider.traces(
            &ctx.base_dir.join(&seismic_cfg.root),
            &seismic_cfg.mseed_patterns,
            ctx.config.limits.max_files_per_source,
        )?;
        if !traces.is_empty() {
            let coords: HashMap<String, (Option<f64>, Option<f64>, Option<f64>)> =
                load_json(&ctx.paths.ingest.join("seismic_index.json"))
                    .and_then(|value| serde_json::from_value::<Vec<TraceMeta>>(value).ok())
                    .map(|metas| {
                        metas
                            .into_iter()
                            .map(|meta| (meta.station_id, (meta.lat, meta.lon, meta.elev)))
                            .collect()
                    })
                    .unwrap_or_default();

            let interval_sec = ctx.config.seismic.raw_interval_sec.max(1);
            let value_mode = ctx.config.seismic.raw_value_mode.to_ascii_lowercase();
            clear_source(ctx, Source::Seismic)?;
            let mut writer = PartitionedWriter::new(
                &ctx.paths.raw,
                &parquet.partition_cols,
                &parquet.compression,
                parquet.batch_rows,
            );
            let mut rows_written = 0usize;
            let mut ts_min: Option<i64> = None;
            let mut ts_max: Option<i64> = None;
            let mut stations: BTreeSet<String> = BTreeSet::new();

            'traces: for trace in &traces {
                let sr = trace.sampling_rate_hz;
                let window = (sr * interval_sec as f64) as usize;
                if window == 0 || trace.samples.len() < window {
                    continue;
                }
                let station_id = trace.station_id();
                stations.insert(station_id.clone());
                let (lat, lon, elev) = coords
                    .get(&station_id)
                    .copied()
                    .unwrap_or((None, None, None));

                let mut records = Vec::new();
                let mut offset = 0usize;
                while offset + window <= trace.samples.len() {
                    let ts_ms = trace.start_ms + ((offset as f64 / sr) * 1_000.0) as i64;
                    let value =
                        aggregate_window(&trace.samples[offset..offset + window], &value_mode);
                    let mut rec = Record::new(
                        ts_ms,
                        Source::Seismic,
                        station_id.clone(),
                        format!("{}_{value_mode}", trace.channel),
                        Some(value),
                    )
                    .with_provenance(ProcStage::Raw, ctx.proc_version(), &ctx.params_hash);
                    rec.lat = lat;
                    rec.lon = lon;
                    rec.elev = elev;
                    records.push(rec);
                    rows_written += 1;
                    ts_min = Some(ts_min.map_or(ts_ms, |t| t.min(ts_ms)));
                    ts_max = Some(ts_max.map_or(ts_ms, |t| t.max(ts_ms)));
                    offset += window;
                    if max_rows.is_some_and(|cap| rows_written >= cap) {
                        writer.write(&records)?;
                        break 'traces;
                    }
                }
                writer.write(&records)?;
            }
            stats.insert(
                "seismic".to_string(),
                serde_json::json!({
                    "rows": rows_written,
                    "station_count": stations.len(),
                    "ts_min": ts_min,
                    "ts_max": ts_max,
                }),
            );
        }
    }

    // VLF spectrograms stay in their catalog; surface the counts.
    if let Some(value) = load_json(&ctx.paths.raw.join("vlf_catalog.json")) {
        if let Some(entries) = value.as_array() {
            let stations: BTreeSet<&str> = entries
                .iter()
                .filter_map(|entry| entry["station_id"].as_str())
                .collect();
            stats.insert(
                "vlf".to_string(),
                serde_json::json!({
                    "files": entries.len(),
                    "stations": stations.len(),
                }),
            );
        }
    }

    write_dq_report(
        &ctx.paths.reports.join("dq_raw.json"),
        serde_json::json!({ "sources": stats }),
    )?;

    // Per-source on-disk footprint.
    let mut compression: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for source in stats.keys() {
        let dir = ctx.paths.raw.join(format!("source={source}"));
        if dir.exists() {
            let bytes: u64 = walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.metadata().ok())
                .map(|meta| meta.len())
                .sum();
            compression.insert(source.clone(), serde_json::json!({ "bytes": bytes }));
        }
    }
    write_json(&ctx.paths.reports.join("compression_stats.json"), &compression)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_aggregations() {
        let data = [3.0, -4.0];
        assert_eq!(aggregate_window(&data, "mean_abs"), 3.5);
        assert_eq!(aggregate_window(&data, "max_abs"), 4.0);
        assert!((aggregate_window(&data, "rms") - (12.5f64).sqrt()).abs() < 1e-12);
        // Unknown modes fall back to rms
        assert_eq!(aggregate_window(&data, "other"), aggregate_window(&data, "rms"));
    }
}
