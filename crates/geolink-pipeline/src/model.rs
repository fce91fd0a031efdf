//! Anomaly scoring and cross-source association.
//!
//! Anomalies: z-scores per (source, channel, feature) over the feature
//! table, ranked by magnitude. Association: pre/post change scores per
//! (source, channel) series plus a lagged Pearson correlation search over
//! every cross-source pair, fanned out with rayon since pairs are independent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{anyhow, Context, Result};
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use geolink_core::config::AssociationSection;
use geolink_core::event::Event;
use geolink_signal::stats::pearson;
use geolink_store::frame::write_parquet_file;
use geolink_store::layout::ensure_dir;

use crate::context::StageContext;
use crate::features::{read_features, FeatureRow};
use crate::link::{read_aligned, AlignedRow};
use crate::report::write_json;

// ---------------------------------------------------------------------------
// Anomalies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub rank: usize,
    pub source: String,
    pub station_id: String,
    pub feature: String,
    pub score: f64,
}

fn sample_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Score features against their (source, channel, feature) peer group,
/// keep `|score| >= threshold`, rank by magnitude, top-N.
pub fn compute_anomalies(
    features: &[FeatureRow],
    threshold: f64,
    topn: usize,
) -> Vec<AnomalyRow> {
    let mut groups: BTreeMap<(String, String, String), Vec<usize>> = BTreeMap::new();
    for (idx, row) in features.iter().enumerate() {
        if !row.value.is_finite() {
            continue;
        }
        groups
            .entry((row.source.clone(), row.channel.clone(), row.feature.clone()))
            .or_default()
            .push(idx);
    }

    let mut scored: Vec<(usize, f64)> = Vec::new();
    for indices in groups.values() {
        let values: Vec<f64> = indices.iter().map(|idx| features[*idx].value).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let mut std = sample_std(&values, mean);
        if std <= 0.0 || !std.is_finite() {
            std = 1.0;
        }
        for idx in indices {
            let score = (features[*idx].value - mean) / std;
            if score.abs() >= threshold {
                scored.push((*idx, score));
            }
        }
    }
    scored.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    scored
        .into_iter()
        .take(topn)
        .enumerate()
        .map(|(rank, (idx, score))| AnomalyRow {
            rank: rank + 1,
            source: features[idx].source.clone(),
            station_id: features[idx].station_id.clone(),
            feature: features[idx].feature.clone(),
            score,
        })
        .collect()
}

/// Read an anomaly table back; a missing file yields `None` so callers can
/// distinguish "no file" from "no anomalies".
pub fn read_anomalies(path: &std::path::Path) -> Result<Option<Vec<AnomalyRow>>> {
    if !path.exists() {
        return Ok(None);
    }
    let df = geolink_store::frame::read_parquet_file(path)?;
    let rank = df.column("rank")?.i64()?.clone();
    let source = df.column("source")?.utf8()?.clone();
    let station_id = df.column("station_id")?.utf8()?.clone();
    let feature = df.column("feature")?.utf8()?.clone();
    let score = df.column("score")?.f64()?.clone();
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        rows.push(AnomalyRow {
            rank: rank.get(i).unwrap_or_default() as usize,
            source: source.get(i).unwrap_or_default().to_string(),
            station_id: station_id.get(i).unwrap_or_default().to_string(),
            feature: feature.get(i).unwrap_or_default().to_string(),
            score: score.get(i).unwrap_or(f64::NAN),
        });
    }
    Ok(Some(rows))
}

pub(crate) fn anomalies_to_frame(rows: &[AnomalyRow]) -> Result<DataFrame> {
    DataFrame::new(vec![
        Series::new(
            "rank",
            rows.iter().map(|r| r.rank as i64).collect::<Vec<_>>(),
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
            "feature",
            rows.iter().map(|r| r.feature.clone()).collect::<Vec<_>>(),
        ),
        Series::new("score", rows.iter().map(|r| r.score).collect::<Vec<_>>()),
    ])
    .context("building anomaly frame")
}

// ---------------------------------------------------------------------------
// Association
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub event_id: String,
    pub source: String,
    pub channel: String,
    pub pre_mean: f64,
    pub pre_std: f64,
    pub post_mean: f64,
    pub post_std: f64,
    pub delta_mean: f64,
    pub change_score: f64,
    pub change_flag: bool,
    pub params_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRow {
    pub event_id: String,
    pub source_a: String,
    pub channel_a: String,
    pub source_b: String,
    pub channel_b: String,
    pub corr: f64,
    pub lag_minutes: i64,
    pub overlap_points: usize,
    pub similarity_flag: bool,
    pub params_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationSummary {
    pub event_id: String,
    pub origin_time_utc: String,
    pub change_threshold: f64,
    pub corr_threshold: f64,
    pub change_sources: Vec<String>,
    pub change_rows: usize,
    pub similarity_rows: usize,
    pub co_occurrence: bool,
    pub similarity_flag: bool,
    pub association_flag: bool,
    pub params_hash: String,
}

/// Collapse the aligned table into one series per (source, channel):
/// values at equal timestamps reduce to their median.
pub fn series_map(rows: &[AlignedRow]) -> BTreeMap<(String, String), Vec<(i64, f64)>> {
    let mut cells: BTreeMap<(String, String), BTreeMap<i64, Vec<f64>>> = BTreeMap::new();
    for row in rows {
        let Some(value) = row.record.value else { continue };
        if !value.is_finite() {
            continue;
        }
        cells
            .entry((
                row.record.source.as_str().to_string(),
                row.record.channel.clone(),
            ))
            .or_default()
            .entry(row.record.ts_ms)
            .or_default()
            .push(value);
    }
    cells
        .into_iter()
        .map(|(key, by_ts)| {
            let series = by_ts
                .into_iter()
                .map(|(ts, mut values)| {
                    values.sort_by(|a, b| a.total_cmp(b));
                    let mid = values.len() / 2;
                    let median = if values.len() % 2 == 1 {
                        values[mid]
                    } else {
                        (values[mid - 1] + values[mid]) / 2.0
                    };
                    (ts, median)
                })
                .collect();
            (key, series)
        })
        .collect()
}

fn zscore_series(points: &[(i64, f64)], min_points: usize) -> Option<Vec<(i64, f64)>> {
    if points.len() < min_points {
        return None;
    }
    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let std = sample_std(&values, mean);
    if std <= 0.0 || !std.is_finite() {
        return None;
    }
    Some(
        points
            .iter()
            .map(|(ts, v)| (*ts, (v - mean) / std))
            .collect(),
    )
}

/// Pearson correlation between `a` and `b` with `b` shifted forward by
/// `lag_ms`, inner-joined on timestamp.
fn corr_with_lag(
    a_by_ts: &HashMap<i64, f64>,
    b: &[(i64, f64)],
    lag_ms: i64,
    min_overlap: usize,
) -> Option<(f64, usize)> {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for (ts, value) in b {
        if let Some(a_value) = a_by_ts.get(&(ts + lag_ms)) {
            left.push(*a_value);
            right.push(*value);
        }
    }
    if left.len() < min_overlap {
        return None;
    }
    pearson(&left, &right).map(|corr| (corr, left.len()))
}

/// Change detection + lagged cross-source correlation over the aligned
/// table. `None` when the table is empty or has no usable series.
pub fn compute_association(
    rows: &[AlignedRow],
    event: &Event,
    cfg: &AssociationSection,
    params_hash: &str,
) -> Result<Option<(AssociationSummary, Vec<ChangeRow>, Vec<SimilarityRow>)>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let origin_ms = event.origin_ms()?;
    let series = series_map(rows);
    if series.is_empty() {
        return Ok(None);
    }

    // Pre/post change scores.
    let mut change_rows = Vec::new();
    let mut change_sources: BTreeSet<String> = BTreeSet::new();
    for ((source, channel), points) in &series {
        let pre: Vec<f64> = points
            .iter()
            .filter(|(ts, _)| *ts < origin_ms)
            .map(|(_, v)| *v)
            .collect();
        let post: Vec<f64> = points
            .iter()
            .filter(|(ts, _)| *ts >= origin_ms)
            .map(|(_, v)| *v)
            .collect();
        if pre.is_empty() || post.is_empty() {
            continue;
        }
        let pre_mean = pre.iter().sum::<f64>() / pre.len() as f64;
        let post_mean = post.iter().sum::<f64>() / post.len() as f64;
        let pre_std = sample_std(&pre, pre_mean);
        let post_std = sample_std(&post, post_mean);
        let delta_mean = post_mean - pre_mean;
        let change_score = delta_mean.abs() / pre_std.max(1.0);
        let change_flag = change_score >= cfg.change_threshold;
        if change_flag {
            change_sources.insert(source.clone());
        }
        change_rows.push(ChangeRow {
            event_id: event.event_id.clone(),
            source: source.clone(),
            channel: channel.clone(),
            pre_mean,
            pre_std,
            post_mean,
            post_std,
            delta_mean,
            change_score,
            change_flag,
            params_hash: params_hash.to_string(),
        });
    }

    // Lagged correlation over cross-source pairs.
    let lag_step = cfg.lag_step_minutes.max(1);
    let max_lag = cfg.max_lag_minutes.max(0);
    let lags: Vec<i64> = (-max_lag..=max_lag).step_by(lag_step as usize).collect();

    let zscored: Vec<((String, String), Vec<(i64, f64)>)> = series
        .iter()
        .filter_map(|(key, points)| {
            zscore_series(points, cfg.min_points).map(|z| (key.clone(), z))
        })
        .collect();
    let mut pairs = Vec::new();
    for i in 0..zscored.len() {
        for j in i + 1..zscored.len() {
            if zscored[i].0 .0 != zscored[j].0 .0 {
                pairs.push((i, j));
            }
        }
    }

    let mut similarity_rows: Vec<SimilarityRow> = pairs
        .par_iter()
        .filter_map(|(i, j)| {
            let ((source_a, channel_a), series_a) = &zscored[*i];
            let ((source_b, channel_b), series_b) = &zscored[*j];
            let a_by_ts: HashMap<i64, f64> = series_a.iter().copied().collect();
            let mut best: Option<(f64, i64, usize)> = None;
            for lag in &lags {
                let lag_ms = lag * 60_000;
                if let Some((corr, overlap)) =
                    corr_with_lag(&a_by_ts, series_b, lag_ms, cfg.min_overlap)
                {
                    let better = best
                        .map(|(best_corr, _, _)| corr.abs() > best_corr.abs())
                        .unwrap_or(true);
                    if better {
                        best = Some((corr, *lag, overlap));
                    }
                }
            }
            best.map(|(corr, lag_minutes, overlap_points)| SimilarityRow {
                event_id: event.event_id.clone(),
                source_a: source_a.clone(),
                channel_a: channel_a.clone(),
                source_b: source_b.clone(),
                channel_b: channel_b.clone(),
                corr,
                lag_minutes,
                overlap_points,
                similarity_flag: corr.abs() >= cfg.corr_threshold,
                params_hash: params_hash.to_string(),
            })
        })
        .collect();
    similarity_rows.sort_by(|a, b| b.corr.abs().total_cmp(&a.corr.abs()));
    similarity_rows.truncate(cfg.topn_pairs);

    let co_occurrence = change_sources.len() >= cfg.min_sources;
    let similarity_flag = similarity_rows.iter().any(|row| row.similarity_flag);
    let summary = AssociationSummary {
        event_id: event.event_id.clone(),
        origin_time_utc: event.origin_time_utc.clone(),
        change_threshold: cfg.change_threshold,
        corr_threshold: cfg.corr_threshold,
        change_sources: change_sources.into_iter().collect(),
        change_rows: change_rows.len(),
        similarity_rows: similarity_rows.len(),
        co_occurrence,
        similarity_flag,
        association_flag: co_occurrence || similarity_flag,
        params_hash: params_hash.to_string(),
    };
    Ok(Some((summary, change_rows, similarity_rows)))
}

fn changes_to_frame(rows: &[ChangeRow]) -> Result<DataFrame> {
    DataFrame::new(vec![
        Series::new("event_id", rows.iter().map(|r| r.event_id.clone()).collect::<Vec<_>>()),
        Series::new("source", rows.iter().map(|r| r.source.clone()).collect::<Vec<_>>()),
        Series::new("channel", rows.iter().map(|r| r.channel.clone()).collect::<Vec<_>>()),
        Series::new("pre_mean", rows.iter().map(|r| r.pre_mean).collect::<Vec<_>>()),
        Series::new("pre_std", rows.iter().map(|r| r.pre_std).collect::<Vec<_>>()),
        Series::new("post_mean", rows.iter().map(|r| r.post_mean).collect::<Vec<_>>()),
        Series::new("post_std", rows.iter().map(|r| r.post_std).collect::<Vec<_>>()),
        Series::new("delta_mean", rows.iter().map(|r| r.delta_mean).collect::<Vec<_>>()),
        Series::new("change_score", rows.iter().map(|r| r.change_score).collect::<Vec<_>>()),
        Series::new("change_flag", rows.iter().map(|r| r.change_flag).collect::<Vec<_>>()),
        Series::new("params_hash", rows.iter().map(|r| r.params_hash.clone()).collect::<Vec<_>>()),
    ])
    .context("building association change frame")
}

fn similarity_to_frame(rows: &[SimilarityRow]) -> Result<DataFrame> {
    DataFrame::new(vec![
        Series::new("event_id", rows.iter().map(|r| r.event_id.clone()).collect::<Vec<_>>()),
        Series::new("source_a", rows.iter().map(|r| r.source_a.clone()).collect::<Vec<_>>()),
        Series::new("channel_a", rows.iter().map(|r| r.channel_a.clone()).collect::<Vec<_>>()),
        Series::new("source_b", rows.iter().map(|r| r.source_b.clone()).collect::<Vec<_>>()),
        Series::new("channel_b", rows.iter().map(|r| r.channel_b.clone()).collect::<Vec<_>>()),
        Series::new("corr", rows.iter().map(|r| r.corr).collect::<Vec<_>>()),
        Series::new("lag_minutes", rows.iter().map(|r| r.lag_minutes).collect::<Vec<_>>()),
        Series::new(
            "overlap_points",
            rows.iter().map(|r| r.overlap_points as i64).collect::<Vec<_>>(),
        ),
        Series::new(
            "similarity_flag",
            rows.iter().map(|r| r.similarity_flag).collect::<Vec<_>>(),
        ),
        Series::new("params_hash", rows.iter().map(|r| r.params_hash.clone()).collect::<Vec<_>>()),
    ])
    .context("building association similarity frame")
}

// ---------------------------------------------------------------------------
// Stage entry point
// ---------------------------------------------------------------------------

pub fn run_model(ctx: &StageContext) -> Result<()> {
    let event = ctx.event()?.clone();
    let features_dir = ctx.paths.features_event(&event.event_id);
    let features_path = features_dir.join("features.parquet");
    if !features_path.exists() {
        return Err(anyhow!(
            "features.parquet not found: {} (run the features stage first)",
            features_path.display()
        ));
    }
    let features = read_features(&features_path)?;
    let threshold = ctx.config.features.anomaly_threshold;
    let topn = ctx.config.features.topn_anomalies;
    let anomalies = compute_anomalies(&features, threshold, topn);
    info!(
        event_id = event.event_id.as_str(),
        anomalies = anomalies.len(),
        "scored anomalies"
    );

    ensure_dir(&features_dir)?;
    let compression = ctx.config.storage.parquet.compression.clone();
    let mut anomaly_df = anomalies_to_frame(&anomalies)?;
    write_parquet_file(&mut anomaly_df, &features_dir.join("anomaly.parquet"), &compression)?;

    let aligned = read_aligned(&ctx.paths.linked_event(&event.event_id).join("aligned.parquet"))?;
    let association = compute_association(
        &aligned,
        &event,
        &ctx.config.features.association,
        &ctx.params_hash,
    )?;
    if let Some((summary, change_rows, similarity_rows)) = association {
        let mut change_df = changes_to_frame(&change_rows)?;
        write_parquet_file(
            &mut change_df,
            &features_dir.join("association_changes.parquet"),
            &compression,
        )?;
        let mut similarity_df = similarity_to_frame(&similarity_rows)?;
        write_parquet_file(
            &mut similarity_df,
            &features_dir.join("association_similarity.parquet"),
            &compression,
        )?;
        write_json(&features_dir.join("association.json"), &summary)?;
    }

    // Rulebook snapshot for the query façade.
    let rulebook = serde_json::json!({
        "anomaly_threshold": threshold,
        "topn": topn,
        "params_hash": ctx.params_hash,
    });
    ensure_dir(&ctx.paths.models)?;
    let yaml = serde_yaml::to_string(&rulebook).context("serializing rulebook")?;
    std::fs::write(ctx.paths.models.join("rulebook.yaml"), yaml)
        .context("writing rulebook.yaml")?;

    write_json(
        &features_dir.join("dq_anomaly.json"),
        &serde_json::json!({
            "event_id": event.event_id,
            "anomalies": anomalies.len(),
            "threshold": threshold,
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geolink_core::record::{Record, Source};

    fn feature(source: &str, station: &str, value: f64) -> FeatureRow {
        FeatureRow {
            event_id: "ev1".into(),
            source: source.into(),
            station_id: station.into(),
            channel: "X".into(),
            feature: "mean".into(),
            value,
        }
    }

    #[test]
    fn anomaly_ranking_keeps_the_extremes() {
        // Two stations with means 0 and 10: both sit ~0.707 sample-std
        // from the group mean, so a 0.5 threshold keeps both.
        let features = vec![feature("geomag", "A", 0.0), feature("geomag", "B", 10.0)];
        let anomalies = compute_anomalies(&features, 0.5, 10);
        assert!(!anomalies.is_empty());
        assert_eq!(anomalies[0].rank, 1);
        assert!(anomalies[0].score.abs() >= 0.5);
        for pair in anomalies.windows(2) {
            assert!(pair[0].score.abs() >= pair[1].score.abs());
            assert_eq!(pair[1].rank, pair[0].rank + 1);
        }
    }

    #[test]
    fn zero_std_groups_never_divide_by_zero() {
        let features = vec![feature("geomag", "A", 5.0), feature("geomag", "B", 5.0)];
        let anomalies = compute_anomalies(&features, 0.1, 10);
        assert!(anomalies.is_empty()); // all scores exactly 0
    }

    fn sine_rows(
        source: Source,
        channel: &str,
        shift_bins: i64,
        n: usize,
    ) -> Vec<AlignedRow> {
        (0..n)
            .map(|i| {
                let phase = (i as i64 + shift_bins) as f64 * 0.2;
                AlignedRow {
                    record: Record::new(
                        i as i64 * 60_000,
                        source,
                        "STA",
                        channel,
                        Some(phase.sin()),
                    ),
                    event_id: "ev1".into(),
                    distance_km: None,
                }
            })
            .collect()
    }

    fn event() -> Event {
        Event {
            event_id: "ev1".into(),
            origin_time_utc: "1970-01-01T02:00:00Z".into(),
            lat: 0.0,
            lon: 0.0,
            depth_km: None,
            magnitude: None,
            name: None,
        }
    }

    #[test]
    fn lag_search_recovers_a_five_minute_shift() {
        let mut rows = sine_rows(Source::Geomag, "X", 0, 240);
        rows.extend(sine_rows(Source::Aef, "E", 5, 240));
        let cfg = AssociationSection {
            max_lag_minutes: 30,
            ..Default::default()
        };
        let (summary, _, similarity) =
            compute_association(&rows, &event(), &cfg, "hash").unwrap().unwrap();
        let best = &similarity[0];
        assert_eq!(best.lag_minutes, 5);
        assert!(best.corr.abs() > 0.99);
        assert!(best.similarity_flag);
        assert!(summary.similarity_flag);
        assert!(summary.association_flag);
    }

    #[test]
    fn zero_max_lag_collapses_to_lag_zero() {
        let mut rows = sine_rows(Source::Geomag, "X", 0, 120);
        rows.extend(sine_rows(Source::Aef, "E", 0, 120));
        let cfg = AssociationSection {
            max_lag_minutes: 0,
            ..Default::default()
        };
        let (_, _, similarity) =
            compute_association(&rows, &event(), &cfg, "hash").unwrap().unwrap();
        assert_eq!(similarity.len(), 1);
        assert_eq!(similarity[0].lag_minutes, 0);
        assert!(similarity[0].corr > 0.99);
    }

    #[test]
    fn same_source_pairs_are_skipped() {
        let mut rows = sine_rows(Source::Geomag, "X", 0, 120);
        rows.extend(sine_rows(Source::Geomag, "Y", 3, 120));
        let cfg = AssociationSection::default();
        let (_, _, similarity) =
            compute_association(&rows, &event(), &cfg, "hash").unwrap().unwrap();
        assert!(similarity.is_empty());
    }

    #[test]
    fn change_detection_flags_a_step() {
        // Step from ~0 to ~10 at the origin (02:00).
        let mut rows: Vec<AlignedRow> = Vec::new();
        for source in [Source::Geomag, Source::Aef] {
            for i in 0..240i64 {
                let base = if i < 120 { 0.0 } else { 10.0 };
                let wobble = (i % 5) as f64 * 0.1;
                rows.push(AlignedRow {
                    record: Record::new(
                        i * 60_000,
                        source,
                        "STA",
                        "X",
                        Some(base + wobble),
                    ),
                    event_id: "ev1".into(),
                    distance_km: None,
                });
            }
        }
        let cfg = AssociationSection {
            change_threshold: 3.0,
            min_sources: 2,
            ..Default::default()
        };
        let (summary, changes, _) =
            compute_association(&rows, &event(), &cfg, "hash").unwrap().unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|row| row.change_flag));
        assert!(summary.co_occurrence);
        assert!(summary.association_flag);
        assert_eq!(summary.change_sources, vec!["aef", "geomag"]);
    }

    #[test]
    fn empty_aligned_table_yields_no_association() {
        let cfg = AssociationSection::default();
        assert!(compute_association(&[], &event(), &cfg, "hash")
            .unwrap()
            .is_none());
    }

    #[test]
    fn series_map_medians_duplicate_bins() {
        let rows = vec![
            AlignedRow {
                record: Record::new(0, Source::Geomag, "A", "X", Some(1.0)),
                event_id: "ev1".into(),
                distance_km: None,
            },
            AlignedRow {
                record: Record::new(0, Source::Geomag, "B", "X", Some(3.0)),
                event_id: "ev1".into(),
                distance_km: None,
            },
        ];
        let map = series_map(&rows);
        let series = map.get(&("geomag".to_string(), "X".to_string())).unwrap();
        assert_eq!(series, &vec![(0, 2.0)]);
    }
}
