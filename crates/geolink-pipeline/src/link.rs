//! Linking: select the event window from the standard store, filter by
//! station distance, snap timestamps onto the alignment grid, and tag
//! every surviving row with the event.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use geolink_core::record::{Record, Source};
use geolink_core::time::{ms_to_iso, parse_interval_ms};
use geolink_store::frame::{frame_to_records, records_to_frame, write_parquet_file};
use geolink_store::partition::{read_records, Predicate};
use geolink_store::layout::ensure_dir;

use crate::context::StageContext;
use crate::report::write_json;
use crate::spatial::haversine_km;

/// One aligned row: the standardized record plus its event tag and
/// epicentral distance (absent when the station has no coordinates).
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRow {
    pub record: Record,
    pub event_id: String,
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSummary {
    pub station_id: String,
    pub source: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elev: Option<f64>,
    pub distance_km: Option<f64>,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSummary {
    pub event_id: String,
    pub origin_time_utc: String,
    pub time_window: TimeWindow,
    pub sources: BTreeMap<String, usize>,
    pub unique_bins: usize,
    pub expected_bins: usize,
    pub join_coverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

/// Truncate toward negative infinity onto the alignment grid.
pub fn align_ts(ts_ms: i64, interval_ms: i64) -> i64 {
    ts_ms.div_euclid(interval_ms) * interval_ms
}

/// Distance-filter one source's rows.
///
/// When no row carries coordinates the filter is a no-op (nothing to
/// measure against); otherwise rows without coordinates or beyond the
/// radius are dropped.
fn filter_by_distance(
    records: Vec<Record>,
    lat: f64,
    lon: f64,
    radius_km: f64,
) -> Vec<(Record, Option<f64>)> {
    let any_coords = records
        .iter()
        .any(|rec| rec.lat.is_some() && rec.lon.is_some());
    if !any_coords {
        return records.into_iter().map(|rec| (rec, None)).collect();
    }
    records
        .into_iter()
        .filter_map(|rec| match (rec.lat, rec.lon) {
            (Some(rec_lat), Some(rec_lon)) => {
                let distance = haversine_km(lat, lon, rec_lat, rec_lon);
                (distance <= radius_km).then_some((rec, Some(distance)))
            }
            _ => None,
        })
        .collect()
}

/// Write the aligned table; an empty input still produces the canonical
/// schema plus `event_id` / `distance_km`.
pub fn write_aligned(rows: &[AlignedRow], path: &Path, compression: &str) -> Result<()> {
    let records: Vec<Record> = rows.iter().map(|row| row.record.clone()).collect();
    let mut df = records_to_frame(&records)?;
    let event_ids: Vec<String> = rows.iter().map(|row| row.event_id.clone()).collect();
    let distances: Vec<Option<f64>> = rows.iter().map(|row| row.distance_km).collect();
    df.with_column(Series::new("event_id", event_ids))
        .context("adding event_id column")?;
    df.with_column(Series::new("distance_km", distances))
        .context("adding distance_km column")?;
    write_parquet_file(&mut df, path, compression)
}

/// Read an aligned table back into rows.
pub fn read_aligned(path: &Path) -> Result<Vec<AlignedRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let df = geolink_store::frame::read_parquet_file(path)?;
    let records = frame_to_records(&df, &[])?;
    let event_ids = df
        .column("event_id")
        .and_then(|s| s.utf8().map(|ca| ca.clone()))
        .ok();
    let distances = df
        .column("distance_km")
        .and_then(|s| s.f64().map(|ca| ca.clone()))
        .ok();
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(i, record)| AlignedRow {
            record,
            event_id: event_ids
                .as_ref()
                .and_then(|col| col.get(i))
                .unwrap_or_default()
                .to_string(),
            distance_km: distances.as_ref().and_then(|col| col.get(i)),
        })
        .collect())
}

pub fn run_link(ctx: &StageContext) -> Result<()> {
    let event = ctx.event()?.clone();
    let window = &ctx.config.time.event_window;
    let (start_ms, end_ms) = event.window_ms(window.pre_hours, window.post_hours)?;
    let interval_ms = parse_interval_ms(&ctx.config.time.align_interval)?;
    let radius_km = ctx.config.link.spatial_km;
    let require_location = ctx.config.link.require_station_location;

    let mut aligned: Vec<AlignedRow> = Vec::new();
    let mut stations: Vec<StationSummary> = Vec::new();

    for source in Source::ALL {
        let predicate = Predicate::All(vec![
            Predicate::SourceEq(source.as_str().to_string()),
            Predicate::TsBetween { start_ms, end_ms },
        ]);
        let mut records = read_records(&ctx.paths.standard, Some(&predicate), None)?;
        if require_location {
            records.retain(|rec| rec.lat.is_some() && rec.lon.is_some());
        }
        if records.is_empty() {
            continue;
        }
        let filtered = filter_by_distance(records, event.lat, event.lon, radius_km);
        if filtered.is_empty() {
            continue;
        }

        // Per-station first-seen coordinates, minimum distance, row count.
        let mut per_station: BTreeMap<String, StationSummary> = BTreeMap::new();
        for (rec, distance) in &filtered {
            let entry = per_station
                .entry(rec.station_id.clone())
                .or_insert_with(|| StationSummary {
                    station_id: rec.station_id.clone(),
                    source: source.as_str().to_string(),
                    lat: rec.lat,
                    lon: rec.lon,
                    elev: rec.elev,
                    distance_km: *distance,
                    rows: 0,
                });
            entry.rows += 1;
            entry.distance_km = match (entry.distance_km, distance) {
                (Some(a), Some(b)) => Some(a.min(*b)),
                (None, Some(b)) => Some(*b),
                (current, None) => current,
            };
        }
        stations.extend(per_station.into_values());

        for (mut rec, distance) in filtered {
            rec.ts_ms = align_ts(rec.ts_ms, interval_ms);
            aligned.push(AlignedRow {
                record: rec,
                event_id: event.event_id.clone(),
                distance_km: distance,
            });
        }
    }

    let linked_dir = ctx.paths.linked_event(&event.event_id);
    ensure_dir(&linked_dir)?;
    write_aligned(
        &aligned,
        &linked_dir.join("aligned.parquet"),
        &ctx.config.storage.parquet.compression,
    )?;
    write_json(
        &linked_dir.join("stations.json"),
        &serde_json::json!({ "stations": stations }),
    )?;

    let expected_bins = ((end_ms - start_ms) / interval_ms) as usize;
    let unique_bins = aligned
        .iter()
        .map(|row| row.record.ts_ms)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    let join_coverage = if expected_bins > 0 {
        unique_bins as f64 / expected_bins as f64
    } else {
        0.0
    };
    let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
    for row in &aligned {
        *source_counts
            .entry(row.record.source.as_str().to_string())
            .or_default() += 1;
    }
    info!(
        event_id = event.event_id.as_str(),
        rows = aligned.len(),
        join_coverage,
        "linked event window"
    );

    let summary = LinkSummary {
        event_id: event.event_id.clone(),
        origin_time_utc: event.origin_time_utc.clone(),
        time_window: TimeWindow {
            start: ms_to_iso(start_ms),
            end: ms_to_iso(end_ms),
        },
        sources: source_counts,
        unique_bins,
        expected_bins,
        join_coverage,
    };
    write_json(&linked_dir.join("summary.json"), &summary)?;
    write_json(&linked_dir.join("dq_linked.json"), &summary)?;

    let event_payload = serde_json::json!({
        "event_id": event.event_id,
        "name": event.name,
        "origin_time_utc": event.origin_time_utc,
        "lat": event.lat,
        "lon": event.lon,
        "depth_km": event.depth_km,
        "magnitude": event.magnitude,
        "pipeline_version": ctx.proc_version(),
        "params_hash": ctx.params_hash,
        "align_interval": ctx.config.time.align_interval,
        "window": { "pre_hours": window.pre_hours, "post_hours": window.post_hours },
        "spatial_km": radius_km,
    });
    write_json(&linked_dir.join("event.json"), &event_payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_truncates_toward_negative_infinity() {
        assert_eq!(align_ts(61_000, 60_000), 60_000);
        assert_eq!(align_ts(60_000, 60_000), 60_000);
        assert_eq!(align_ts(-1, 60_000), -60_000);
        assert_eq!(align_ts(119_999, 60_000), 60_000);
    }

    #[test]
    fn distance_filter_drops_far_stations() {
        let near = Record::new(0, Source::Geomag, "NEAR", "X", Some(1.0))
            .with_location(0.0, 0.0, 0.0);
        let far = Record::new(0, Source::Geomag, "FAR", "X", Some(1.0))
            .with_location(20.0, 20.0, 0.0);
        let kept = filter_by_distance(vec![near, far], 0.0, 0.0, 500.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0.station_id, "NEAR");
        assert!(kept[0].1.unwrap() < 1.0);
    }

    #[test]
    fn coordinate_free_sources_pass_through() {
        let rows = vec![
            Record::new(0, Source::Vlf, "KNY", "ch1_peak_freq", Some(7.0)),
            Record::new(60_000, Source::Vlf, "KNY", "ch1_peak_freq", Some(8.0)),
        ];
        let kept = filter_by_distance(rows, 0.0, 0.0, 100.0);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|(_, distance)| distance.is_none()));
    }

    #[test]
    fn mixed_coordinates_drop_unlocated_rows() {
        let located = Record::new(0, Source::Geomag, "NEAR", "X", Some(1.0))
            .with_location(0.0, 0.0, 0.0);
        let unlocated = Record::new(0, Source::Geomag, "NOWHERE", "X", Some(1.0));
        let kept = filter_by_distance(vec![located, unlocated], 0.0, 0.0, 500.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0.station_id, "NEAR");
    }

    #[test]
    fn aligned_round_trip_with_empty_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.parquet");
        write_aligned(&[], &path, "zstd").unwrap();
        let back = read_aligned(&path).unwrap();
        assert!(back.is_empty());

        let rows = vec![AlignedRow {
            record: Record::new(60_000, Source::Geomag, "ABK", "X", Some(2.0)),
            event_id: "ev1".into(),
            distance_km: Some(12.5),
        }];
        write_aligned(&rows, &path, "zstd").unwrap();
        let back = read_aligned(&path).unwrap();
        assert_eq!(back, rows);
    }
}
