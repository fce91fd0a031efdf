//! Per-(source, station, channel) features over the aligned table.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use geolink_core::record::Source;
use geolink_store::frame::{read_parquet_file, write_parquet_file};
use geolink_store::layout::ensure_dir;

use crate::context::StageContext;
use crate::link::{read_aligned, AlignedRow};
use crate::report::write_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub event_id: String,
    pub source: String,
    pub station_id: String,
    pub channel: String,
    pub feature: String,
    pub value: f64,
}

pub fn features_to_frame(rows: &[FeatureRow]) -> Result<DataFrame> {
    DataFrame::new(vec![
        Series::new(
            "event_id",
            rows.iter().map(|r| r.event_id.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "source",
            rows.iter().map(|r| r.source.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "station_id",
            rows.iter().map(|r| r.station_id.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "channel",
            rows.iter().map(|r| r.channel.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "feature",
            rows.iter().map(|r| r.feature.clone()).collect::<Vec<_>>(),
        ),
        Series::new("value", rows.iter().map(|r| r.value).collect::<Vec<_>>()),
    ])
    .context("building features frame")
}

pub fn frame_to_features(df: &DataFrame) -> Result<Vec<FeatureRow>> {
    let text = |name: &str| -> Result<Utf8Chunked> {
        Ok(df
            .column(name)
            .with_context(|| format!("features frame missing '{name}'"))?
            .utf8()?
            .clone())
    };
    let event_id = text("event_id")?;
    let source = text("source")?;
    let station_id = text("station_id")?;
    let channel = text("channel")?;
    let feature = text("feature")?;
    let value = df.column("value")?.f64()?.clone();
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        rows.push(FeatureRow {
            event_id: event_id.get(i).unwrap_or_default().to_string(),
            source: source.get(i).unwrap_or_default().to_string(),
            station_id: station_id.get(i).unwrap_or_default().to_string(),
            channel: channel.get(i).unwrap_or_default().to_string(),
            feature: feature.get(i).unwrap_or_default().to_string(),
            value: value.get(i).unwrap_or(f64::NAN),
        });
    }
    Ok(rows)
}

pub fn read_features(path: &Path) -> Result<Vec<FeatureRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    frame_to_features(&read_parquet_file(path)?)
}

fn sample_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// `|Δvalue| / Δt` statistics over consecutive present samples; `None`
/// below two points or without a positive time step.
fn gradient_stats(points: &[(i64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let mut grads = Vec::with_capacity(points.len() - 1);
    for pair in points.windows(2) {
        let dt_s = (pair[1].0 - pair[0].0) as f64 / 1_000.0;
        if dt_s > 0.0 {
            grads.push(((pair[1].1 - pair[0].1) / dt_s).abs());
        }
    }
    if grads.is_empty() {
        return None;
    }
    let mean = grads.iter().sum::<f64>() / grads.len() as f64;
    let max = grads.iter().fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));
    Some((mean, max))
}

/// Seconds from event origin to the group's maximum value.
fn arrival_offset_s(points: &[(i64, f64)], origin_ms: i64) -> Option<f64> {
    let (ts, _) = points
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .copied()?;
    Some((ts - origin_ms) as f64 / 1_000.0)
}

/// Compute the feature table for one aligned dataset.
pub fn compute_features(rows: &[AlignedRow], event_id: &str, origin_ms: i64) -> Vec<FeatureRow> {
    let mut groups: BTreeMap<(String, String, String), Vec<(i64, f64)>> = BTreeMap::new();
    for row in rows {
        let Some(value) = row.record.value else { continue };
        groups
            .entry((
                row.record.source.as_str().to_string(),
                row.record.station_id.clone(),
                row.record.channel.clone(),
            ))
            .or_default()
            .push((row.record.ts_ms, value));
    }

    let mut out = Vec::new();
    for ((source, station_id, channel), mut points) in groups {
        points.sort_by_key(|(ts, _)| *ts);
        let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        if values.is_empty() {
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let std = sample_std(&values, mean);
        let min = values.iter().fold(f64::INFINITY, |acc, v| acc.min(*v));
        let max = values.iter().fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));
        let rms = (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt();

        let mut push = |feature: &str, value: f64| {
            out.push(FeatureRow {
                event_id: event_id.to_string(),
                source: source.clone(),
                station_id: station_id.clone(),
                channel: channel.clone(),
                feature: feature.to_string(),
                value,
            });
        };
        push("count", values.len() as f64);
        push("mean", mean);
        push("std", std);
        push("variance", std * std);
        push("min", min);
        push("max", max);
        push("peak", max);
        push("rms", rms);

        if source == Source::Geomag.as_str() {
            if let Some((grad_mean, grad_max)) = gradient_stats(&points) {
                push("gradient_abs_mean", grad_mean);
                push("gradient_abs_max", grad_max);
            }
        }
        if source == Source::Seismic.as_str() {
            if channel.ends_with("_rms") {
                if let Some(offset) = arrival_offset_s(&points, origin_ms) {
                    push("p_arrival_offset_s", offset);
                }
            }
            if channel.ends_with("_mean_abs") {
                if let Some(offset) = arrival_offset_s(&points, origin_ms) {
                    push("s_arrival_offset_s", offset);
                }
            }
        }
    }
    out
}

pub fn run_features(ctx: &StageContext) -> Result<()> {
    let event = ctx.event()?.clone();
    let origin_ms = event.origin_ms()?;
    let linked_dir = ctx.paths.linked_event(&event.event_id);
    let aligned_path = linked_dir.join("aligned.parquet");
    if !aligned_path.exists() {
        return Err(anyhow!(
            "aligned table not found: {} (run the link stage first)",
            aligned_path.display()
        ));
    }
    let aligned = read_aligned(&aligned_path)?;
    let features = compute_features(&aligned, &event.event_id, origin_ms);

    let features_dir = ctx.paths.features_event(&event.event_id);
    ensure_dir(&features_dir)?;
    let mut df = features_to_frame(&features)?;
    write_parquet_file(
        &mut df,
        &features_dir.join("features.parquet"),
        &ctx.config.storage.parquet.compression,
    )?;

    let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
    for row in &features {
        *source_counts.entry(row.source.clone()).or_default() += 1;
    }
    let summary = serde_json::json!({
        "event_id": event.event_id,
        "feature_rows": features.len(),
        "sources": source_counts,
    });
    write_json(&features_dir.join("summary.json"), &summary)?;
    write_json(&features_dir.join("dq_features.json"), &summary)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geolink_core::record::Record;

    fn aligned(source: Source, station: &str, channel: &str, points: &[(i64, f64)]) -> Vec<AlignedRow> {
        points
            .iter()
            .map(|(ts, value)| AlignedRow {
                record: Record::new(*ts, source, station, channel, Some(*value)),
                event_id: "ev1".into(),
                distance_km: None,
            })
            .collect()
    }

    #[test]
    fn base_statistics_for_a_group() {
        let rows = aligned(
            Source::Aef,
            "KAK",
            "E",
            &[(0, 1.0), (60_000, 2.0), (120_000, 3.0)],
        );
        let features = compute_features(&rows, "ev1", 0);
        let get = |name: &str| {
            features
                .iter()
                .find(|row| row.feature == name)
                .map(|row| row.value)
                .unwrap()
        };
        assert_eq!(get("count"), 3.0);
        assert_eq!(get("mean"), 2.0);
        assert_eq!(get("min"), 1.0);
        assert_eq!(get("max"), 3.0);
        assert_eq!(get("peak"), 3.0);
        assert!((get("std") - 1.0).abs() < 1e-12);
        assert!((get("variance") - 1.0).abs() < 1e-12);
        assert!((get("rms") - (14.0f64 / 3.0).sqrt()).abs() < 1e-12);
        // No gradient features outside geomag
        assert!(!features.iter().any(|row| row.feature.starts_with("gradient")));
    }

    #[test]
    fn geomag_groups_emit_gradients() {
        let rows = aligned(
            Source::Geomag,
            "ABK",
            "X",
            &[(0, 0.0), (60_000, 6.0), (120_000, 6.0)],
        );
        let features = compute_features(&rows, "ev1", 0);
        let grad_mean = features
            .iter()
            .find(|row| row.feature == "gradient_abs_mean")
            .unwrap()
            .value;
        let grad_max = features
            .iter()
            .find(|row| row.feature == "gradient_abs_max")
            .unwrap()
            .value;
        // Steps: |6-0|/60 = 0.1, |6-6|/60 = 0.0
        assert!((grad_mean - 0.05).abs() < 1e-12);
        assert!((grad_max - 0.1).abs() < 1e-12);
    }

    #[test]
    fn seismic_rms_channels_emit_arrival_offsets() {
        let rows = aligned(
            Source::Seismic,
            "IU.ANMO.00.BHZ",
            "BHZ_rms",
            &[(0, 0.1), (60_000, 5.0), (120_000, 0.2)],
        );
        let features = compute_features(&rows, "ev1", 30_000);
        let offset = features
            .iter()
            .find(|row| row.feature == "p_arrival_offset_s")
            .unwrap()
            .value;
        assert_eq!(offset, 30.0); // peak at 60s, origin at 30s
        assert!(!features.iter().any(|row| row.feature == "s_arrival_offset_s"));
    }

    #[test]
    fn missing_values_are_ignored() {
        let mut rows = aligned(Source::Aef, "KAK", "E", &[(0, 1.0)]);
        rows.push(AlignedRow {
            record: Record::new(60_000, Source::Aef, "KAK", "E", None),
            event_id: "ev1".into(),
            distance_km: None,
        });
        let features = compute_features(&rows, "ev1", 0);
        let count = features
            .iter()
            .find(|row| row.feature == "count")
            .unwrap()
            .value;
        assert_eq!(count, 1.0);
    }
}
