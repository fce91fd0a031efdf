//! Standardization: raw store → cleaned standard store, in bounded memory.
//!
//! Geomag/AEF run through a two-pass group-wise streaming cleaner. Pass 1
//! scans the raw dataset once to fix per-(station, channel) sufficient
//! statistics; Pass 2 streams the same dataset in batches, cleaning each
//! group with a raw tail carried across batch boundaries so window
//! operations never see a truncated neighborhood.
//!
//! Seismic traces take a decimation path (detrend → taper → bandpass →
//! notch → per-interval RMS / mean-abs) and VLF spectrograms a band-power
//! path (line mask → band summaries → smoothing → baseline → grid
//! alignment); neither needs the group-wise cleaner.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use geolink_core::config::ResolvedPreprocess;
use geolink_core::record::{FilterParams, ProcStage, Record, Source};
use geolink_core::time::parse_interval_ms;
use geolink_signal::butterworth::{
    bandpass_sections, filter_forward, filtfilt, notch_sections, taper,
};
use geolink_signal::detrend::{detrend_constant, detrend_linear};
use geolink_signal::interp::interpolate_gaps;
use geolink_signal::rolling::{hampel, highpass_rolling_median, rolling_mean, rolling_median};
use geolink_signal::stats::{mad, median, robust_zscore, RunningStats};
use geolink_signal::wavelet::{denoise, ThresholdMode};
use geolink_store::partition::{scan_batches, write_partitioned, PartitionedWriter, Predicate, ScanFlow};

use crate::context::StageContext;
use crate::report::{write_dq_report, write_json, BasicStats};

type GroupKey = (String, String);

/// Standard deviation before/after the low-pass, per source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterEffect {
    pub before_std: Option<f64>,
    pub after_std: Option<f64>,
}

// ---------------------------------------------------------------------------
// Pass 1: group sufficient statistics
// ---------------------------------------------------------------------------

/// Scan the raw dataset once, accumulating `{count, sum, sum_sq}` per
/// `(station_id, channel)`. Stops early at `max_rows`.
pub fn collect_group_stats(
    root: &std::path::Path,
    predicate: &Predicate,
    batch_rows: usize,
    max_rows: Option<usize>,
) -> Result<HashMap<GroupKey, RunningStats>> {
    let mut stats: HashMap<GroupKey, RunningStats> = HashMap::new();
    let mut rows_seen = 0usize;
    scan_batches(root, Some(predicate), batch_rows, |batch| {
        for rec in &batch {
            if let Some(value) = rec.value {
                stats
                    .entry((rec.station_id.clone(), rec.channel.clone()))
                    .or_default()
                    .push(value);
            }
        }
        rows_seen += batch.len();
        if max_rows.is_some_and(|cap| rows_seen >= cap) {
            Ok(ScanFlow::Stop)
        } else {
            Ok(ScanFlow::Continue)
        }
    })?;
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Group cleaning
// ---------------------------------------------------------------------------

/// Clean one time-sorted group window: preprocessing, MAD outliers with the
/// Pass-1 fallback, bounded interpolation, optional low-pass.
fn clean_group(
    source: Source,
    rows: &[Record],
    cfg: &ResolvedPreprocess,
    fallback: Option<&RunningStats>,
    proc_version: &str,
    params_hash: &str,
) -> Vec<Record> {
    let mut recs: Vec<Record> = rows.to_vec();
    let mut values: Vec<Option<f64>> = recs.iter().map(|rec| rec.value).collect();
    let mut ops: Vec<String> = Vec::new();

    if matches!(source, Source::Geomag | Source::Aef) {
        if cfg.detrend.enabled {
            if cfg.detrend.method.eq_ignore_ascii_case("constant") {
                detrend_constant(&mut values);
                ops.push("detrend_constant".to_string());
            } else {
                detrend_linear(&mut values);
                ops.push("detrend_linear".to_string());
            }
        }
        if cfg.highpass.enabled {
            values = highpass_rolling_median(&values, cfg.highpass.window);
            ops.push("highpass_median".to_string());
        }
        if cfg.wavelet.enabled {
            if let Some(filled) = fill_for_transform(&values) {
                let mode = ThresholdMode::from_name(&cfg.wavelet.mode);
                let denoised = denoise(&filled, cfg.wavelet.threshold_scale, mode);
                for (slot, clean) in values.iter_mut().zip(denoised) {
                    if slot.is_some() {
                        *slot = Some(clean);
                    }
                }
                ops.push(format!("wavelet_{}", cfg.wavelet.family));
            }
        }
        if cfg.hampel.enabled {
            let replaced = hampel(&mut values, cfg.hampel.window, cfg.hampel.n_sigmas);
            for idx in replaced {
                let flags = &mut recs[idx].quality_flags;
                flags.is_outlier = true;
                flags.outlier_method = Some("hampel".to_string());
                flags.threshold = Some(cfg.hampel.n_sigmas);
            }
            ops.push("hampel".to_string());
        }
    }

    // Outlier detection: robust z on group-local median/MAD, global (mean,
    // std) from Pass 1 when MAD degenerates.
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let group_median = median(&present);
    let group_mad = mad(&present);
    let threshold = cfg.outlier.threshold;
    for (idx, slot) in values.iter_mut().enumerate() {
        let Some(value) = *slot else { continue };
        let (z, method) = match (group_median, group_mad) {
            (Some(center), Some(scale)) => match robust_zscore(value, center, scale) {
                Some(z) => (Some(z), "mad_zscore"),
                None => (global_z(value, fallback), "zscore_global"),
            },
            _ => (global_z(value, fallback), "zscore_global"),
        };
        if let Some(z) = z {
            if z.abs() > threshold {
                let flags = &mut recs[idx].quality_flags;
                flags.is_outlier = true;
                flags.outlier_method = Some(method.to_string());
                flags.threshold = Some(threshold);
                *slot = None;
            }
        }
    }

    // Interpolation over bounded missing runs.
    let (filled, filled_idx) = interpolate_gaps(&values, cfg.interpolate.max_gap_points);
    values = filled;
    for idx in filled_idx {
        let flags = &mut recs[idx].quality_flags;
        flags.is_interpolated = true;
        flags.interp_method = Some(cfg.interpolate.method.clone());
        flags.is_missing = false;
        flags.missing_reason = None;
    }
    for (idx, slot) in values.iter().enumerate() {
        if slot.is_none() {
            let flags = &mut recs[idx].quality_flags;
            flags.is_missing = true;
            if flags.missing_reason.is_none() {
                flags.missing_reason = Some("gap".to_string());
            }
        }
    }

    // Optional low-pass.
    if cfg.filter.enabled {
        values = rolling_mean(&values, cfg.filter.window);
        for rec in recs.iter_mut() {
            let flags = &mut rec.quality_flags;
            flags.is_filtered = true;
            flags.filter_type = Some("rolling_mean".to_string());
            flags.filter_params = Some(FilterParams::RollingMean {
                window: cfg.filter.window,
            });
        }
    }

    for (rec, value) in recs.iter_mut().zip(values) {
        rec.value = value;
        if !ops.is_empty() {
            rec.quality_flags.preprocess = ops.clone();
        }
        rec.proc_stage = ProcStage::Standard;
        rec.proc_version = proc_version.to_string();
        rec.params_hash = params_hash.to_string();
    }
    recs
}

fn global_z(value: f64, fallback: Option<&RunningStats>) -> Option<f64> {
    let stats = fallback?;
    let mean = stats.mean()?;
    let std = stats.std().filter(|s| *s > 0.0).unwrap_or(1.0);
    Some((value - mean) / std)
}

/// Linear fill over missing positions (edges held) so the wavelet transform
/// never sees a gap; `None` when the group has no present values.
fn fill_for_transform(values: &[Option<f64>]) -> Option<Vec<f64>> {
    let first = values.iter().flatten().next().copied()?;
    let (interpolated, _) = interpolate_gaps(values, values.len());
    let mut filled = Vec::with_capacity(values.len());
    let mut last = first;
    for slot in &interpolated {
        if let Some(v) = slot {
            last = *v;
        }
        filled.push(last);
    }
    Some(filled)
}

/// Minute→second expansion: each cleaned row becomes `seconds` rows one
/// second apart. The offset-zero row is the parent itself; clones are
/// marked `minute_expand`.
fn expand_rows(rows: &[Record], cfg: &geolink_core::config::ExpandSection) -> Vec<Record> {
    let seconds = cfg.seconds.max(1) as i64;
    let offsets: Vec<i64> = if cfg.mode.eq_ignore_ascii_case("centered") {
        let half = seconds / 2;
        (-half..seconds - half).collect()
    } else {
        (0..seconds).collect()
    };
    let mut out = Vec::with_capacity(rows.len() * offsets.len());
    for rec in rows {
        for &offset in &offsets {
            let mut clone = rec.clone();
            clone.ts_ms = rec.ts_ms + offset * 1_000;
            if offset != 0 {
                clone.quality_flags.is_interpolated = true;
                clone.quality_flags.interp_method = Some("minute_expand".to_string());
            }
            out.push(clone);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Pass 2: streaming cleaner with tail-carry
// ---------------------------------------------------------------------------

/// Raw rows carried across a batch boundary for one group.
///
/// `tail` holds up to `2 * overlap` trailing raw rows: the first `skip` of
/// them were already emitted (they ride along purely as left context for
/// window operations), the rest are still waiting for their right-hand
/// neighborhood to arrive.
#[derive(Debug, Default, Clone)]
struct GroupTail {
    tail: Vec<Record>,
    skip: usize,
}

/// Streams one source's raw batches through the group cleaner, carrying
/// raw context per group across batch boundaries and cleaning the retained
/// tails once at end of stream.
pub struct StreamCleaner<'a> {
    source: Source,
    cfg: &'a ResolvedPreprocess,
    global: &'a HashMap<GroupKey, RunningStats>,
    tails: HashMap<GroupKey, GroupTail>,
    writer: PartitionedWriter,
    overlap: usize,
    proc_version: String,
    params_hash: String,
    rows: usize,
    ts_min: Option<i64>,
    ts_max: Option<i64>,
    stations: BTreeSet<String>,
    missing: usize,
    outliers: usize,
    before: RunningStats,
    after: RunningStats,
}

impl<'a> StreamCleaner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Source,
        cfg: &'a ResolvedPreprocess,
        global: &'a HashMap<GroupKey, RunningStats>,
        writer: PartitionedWriter,
        proc_version: &str,
        params_hash: &str,
    ) -> Self {
        StreamCleaner {
            source,
            cfg,
            global,
            tails: HashMap::new(),
            writer,
            overlap: cfg.overlap_rows(),
            proc_version: proc_version.to_string(),
            params_hash: params_hash.to_string(),
            rows: 0,
            ts_min: None,
            ts_max: None,
            stations: BTreeSet::new(),
            missing: 0,
            outliers: 0,
            before: RunningStats::default(),
            after: RunningStats::default(),
        }
    }

    pub fn process_batch(&mut self, batch: Vec<Record>) -> Result<()> {
        let mut groups: BTreeMap<GroupKey, Vec<Record>> = BTreeMap::new();
        for rec in batch {
            groups
                .entry((rec.station_id.clone(), rec.channel.clone()))
                .or_default()
                .push(rec);
        }
        for (key, mut rows) in groups {
            let state = self.tails.remove(&key).unwrap_or_default();
            let skip = state.skip;
            let mut work = state.tail;
            rows.sort_by_key(|rec| rec.ts_ms);
            work.extend(rows);
            let len = work.len();
            let emit_end = len.saturating_sub(self.overlap);
            if emit_end > skip {
                self.clean_and_write(&key, &work, skip, emit_end)?;
            }
            // Retain up to 2*overlap rows: context for the next window plus
            // the suffix whose right-hand neighborhood hasn't arrived.
            let emitted_prefix = emit_end.max(skip);
            let keep = (2 * self.overlap).min(len);
            let tail_start = len - keep;
            self.tails.insert(
                key,
                GroupTail {
                    tail: work[tail_start..].to_vec(),
                    skip: emitted_prefix.saturating_sub(tail_start),
                },
            );
        }
        Ok(())
    }

    /// Clean the retained tails and flush them; returns the source report
    /// and filter effect.
    pub fn finish(mut self) -> Result<(BasicStats, FilterEffect)> {
        let tails = std::mem::take(&mut self.tails);
        for (key, state) in tails {
            if state.tail.len() > state.skip {
                let emit_end = state.tail.len();
                self.clean_and_write(&key, &state.tail, state.skip, emit_end)?;
            }
        }
        let report = BasicStats {
            rows: self.rows,
            ts_min: self.ts_min,
            ts_max: self.ts_max,
            missing_rate: (self.rows > 0).then(|| self.missing as f64 / self.rows as f64),
            outlier_rate: (self.rows > 0).then(|| self.outliers as f64 / self.rows as f64),
            station_count: self.stations.len(),
        };
        let effect = FilterEffect {
            before_std: self.before.std(),
            after_std: self.after.std(),
        };
        Ok((report, effect))
    }

    fn clean_and_write(
        &mut self,
        key: &GroupKey,
        work: &[Record],
        emit_start: usize,
        emit_end: usize,
    ) -> Result<()> {
        let cleaned = clean_group(
            self.source,
            work,
            self.cfg,
            self.global.get(key),
            &self.proc_version,
            &self.params_hash,
        );
        // Filter-effect stds come from the same streaming sufficient
        // statistics as Pass 1: before = pre-lowpass values.
        for rec in &work[emit_start..emit_end] {
            if let Some(value) = rec.value {
                self.before.push(value);
            }
        }
        let emit = &cleaned[emit_start..emit_end];
        for rec in emit {
            if let Some(value) = rec.value {
                self.after.push(value);
            }
        }
        let out = match &self.cfg.expand {
            Some(expand) => expand_rows(emit, expand),
            None => emit.to_vec(),
        };
        for rec in &out {
            self.rows += 1;
            self.ts_min = Some(self.ts_min.map_or(rec.ts_ms, |t| t.min(rec.ts_ms)));
            self.ts_max = Some(self.ts_max.map_or(rec.ts_ms, |t| t.max(rec.ts_ms)));
            self.stations.insert(rec.station_id.clone());
            if rec.value.is_none() {
                self.missing += 1;
            }
            if rec.quality_flags.is_outlier {
                self.outliers += 1;
            }
        }
        self.writer.write(&out)
    }
}

// ---------------------------------------------------------------------------
// Stage entry point
// ---------------------------------------------------------------------------

pub fn run_standard(ctx: &StageContext) -> Result<()> {
    let mut reports: BTreeMap<String, BasicStats> = BTreeMap::new();
    let mut filter_reports: BTreeMap<String, FilterEffect> = BTreeMap::new();
    let max_rows = ctx.config.limits.max_rows_per_source;

    for source in [Source::Geomag, Source::Aef] {
        if let Some((report, effect)) = standardize_groupwise(ctx, source, max_rows)? {
            reports.insert(source.as_str().to_string(), report);
            filter_reports.insert(source.as_str().to_string(), effect);
        }
    }
    if let Some(report) = standardize_seismic(ctx, max_rows)? {
        reports.insert(Source::Seismic.as_str().to_string(), report);
    }
    if let Some(report) = standardize_vlf(ctx, max_rows)? {
        reports.insert(Source::Vlf.as_str().to_string(), report);
    }

    write_dq_report(
        &ctx.paths.reports.join("dq_standard.json"),
        serde_json::json!({ "sources": reports }),
    )?;
    write_json(&ctx.paths.reports.join("filter_effect.json"), &filter_reports)?;
    Ok(())
}

fn clear_source_partition(root: &std::path::Path, source: Source) -> Result<()> {
    let dir = root.join(format!("source={}", source.as_str()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("clearing '{}'", dir.display()))?;
    }
    Ok(())
}

fn standardize_groupwise(
    ctx: &StageContext,
    source: Source,
    max_rows: Option<usize>,
) -> Result<Option<(BasicStats, FilterEffect)>> {
    let cfg = ctx.config.preprocess.for_source(source);
    let predicate = Predicate::SourceEq(source.as_str().to_string());

    let stats = collect_group_stats(&ctx.paths.raw, &predicate, cfg.batch_rows, max_rows)?;
    if stats.is_empty() {
        return Ok(None);
    }
    info!(
        source = source.as_str(),
        groups = stats.len(),
        "standardizing group-wise"
    );

    clear_source_partition(&ctx.paths.standard, source)?;
    let parquet = &ctx.config.storage.parquet;
    let writer = PartitionedWriter::new(
        &ctx.paths.standard,
        &parquet.partition_cols,
        &parquet.compression,
        parquet.batch_rows,
    );
    let mut cleaner = StreamCleaner::new(
        source,
        &cfg,
        &stats,
        writer,
        ctx.proc_version(),
        &ctx.params_hash,
    );
    let mut rows_seen = 0usize;
    scan_batches(&ctx.paths.raw, Some(&predicate), cfg.batch_rows, |batch| {
        rows_seen += batch.len();
        cleaner.process_batch(batch)?;
        if max_rows.is_some_and(|cap| rows_seen >= cap) {
            Ok(ScanFlow::Stop)
        } else {
            Ok(ScanFlow::Continue)
        }
    })?;
    cleaner.finish().map(Some)
}

// ---------------------------------------------------------------------------
// Seismic path
// ---------------------------------------------------------------------------

fn station_coords(ctx: &StageContext) -> HashMap<String, (f64, f64, f64)> {
    let index_path = ctx.paths.ingest.join("seismic_index.json");
    let Some(value) = crate::report::load_json(&index_path) else {
        return HashMap::new();
    };
    let Ok(metas) =
        serde_json::from_value::<Vec<geolink_io::seismic::TraceMeta>>(value)
    else {
        return HashMap::new();
    };
    let mut coords = HashMap::new();
    for meta in metas {
        if let (Some(lat), Some(lon)) = (meta.lat, meta.lon) {
            coords
                .entry(meta.station_id)
                .or_insert((lat, lon, meta.elev.unwrap_or(0.0)));
        }
    }
    coords
}

fn standardize_seismic(ctx: &StageContext, max_rows: Option<usize>) -> Result<Option<BasicStats>> {
    let Some(provider) = &ctx.providers.seismic else {
        return Ok(None);
    };
    let seismic_cfg = &ctx.config.paths.seismic;
    let traces = provider.traces(
        &ctx.base_dir.join(&seismic_cfg.root),
        &seismic_cfg.mseed_patterns,
        ctx.config.limits.max_files_per_source,
    )?;
    if traces.is_empty() {
        return Ok(None);
    }

    let coords = station_coords(ctx);
    let bp = &ctx.config.preprocess.seismic_bandpass;
    let interval_sec = ctx.config.preprocess.seismic_features.interval_sec.max(1);
    let mut records: Vec<Record> = Vec::new();

    'traces: for trace in &traces {
        let sr = trace.sampling_rate_hz;
        if sr <= 0.0 || trace.samples.is_empty() {
            continue;
        }
        let nyquist = sr / 2.0;
        let freqmax = bp.freqmax_user_hz.min(bp.freqmax_nyquist_ratio * nyquist);
        let mut data = trace.samples.clone();

        let mut wrapped: Vec<Option<f64>> = data.iter().map(|v| Some(*v)).collect();
        detrend_linear(&mut wrapped);
        for (slot, value) in data.iter_mut().zip(wrapped) {
            *slot = value.unwrap_or(*slot);
        }
        taper(&mut data, bp.taper_max_percentage);

        let mut sections = bandpass_sections(bp.freqmin_hz, freqmax, bp.corners, sr)
            .with_context(|| format!("bandpass for trace {}", trace.station_id()))?;
        sections.extend(notch_sections(
            bp.notch.base_hz,
            bp.notch.half_width_hz,
            bp.notch.harmonics,
            sr,
        ));
        if bp.zerophase {
            filtfilt(&sections, &mut data);
        } else {
            filter_forward(&sections, &mut data);
        }

        let filter_params = FilterParams::Bandpass {
            freqmin_hz: bp.freqmin_hz,
            freqmax_hz: freqmax,
            corners: bp.corners,
            zerophase: bp.zerophase,
        };
        let station_id = trace.station_id();
        let location = coords.get(&station_id).copied();

        // Windows shorter than one interval are skipped, never zero-padded.
        let window = (sr * interval_sec as f64) as usize;
        if window == 0 {
            continue;
        }
        let mut offset = 0usize;
        while offset + window <= data.len() {
            let segment = &data[offset..offset + window];
            let ts_ms = trace.start_ms + ((offset as f64 / sr) * 1_000.0) as i64;
            let rms = (segment.iter().map(|v| v * v).sum::<f64>() / window as f64).sqrt();
            let mean_abs = segment.iter().map(|v| v.abs()).sum::<f64>() / window as f64;
            for (suffix, value) in [("rms", rms), ("mean_abs", mean_abs)] {
                let mut rec = Record::new(
                    ts_ms,
                    Source::Seismic,
                    station_id.clone(),
                    format!("{}_{suffix}", trace.channel),
                    Some(value),
                )
                .with_provenance(ProcStage::Standard, ctx.proc_version(), &ctx.params_hash);
                if let Some((lat, lon, elev)) = location {
                    rec = rec.with_location(lat, lon, elev);
                }
                rec.quality_flags.is_filtered = true;
                rec.quality_flags.filter_type = Some("bandpass".to_string());
                rec.quality_flags.filter_params = Some(filter_params.clone());
                records.push(rec);
            }
            offset += window;
            if max_rows.is_some_and(|cap| records.len() >= cap) {
                break 'traces;
            }
        }
    }
    if records.is_empty() {
        return Ok(None);
    }

    clear_source_partition(&ctx.paths.standard, Source::Seismic)?;
    let parquet = &ctx.config.storage.parquet;
    write_partitioned(
        &records,
        &ctx.paths.standard,
        &parquet.partition_cols,
        &parquet.compression,
        parquet.batch_rows,
        None,
    )?;
    Ok(Some(crate::report::basic_stats(&records)))
}

// ---------------------------------------------------------------------------
// VLF path
// ---------------------------------------------------------------------------

fn fmt_hz(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn aggregate(values: &[f64], how: &str) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    if how.eq_ignore_ascii_case("median") {
        median(values)
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn standardize_vlf(ctx: &StageContext, max_rows: Option<usize>) -> Result<Option<BasicStats>> {
    let Some(provider) = &ctx.providers.vlf else {
        return Ok(None);
    };
    let vlf_paths = &ctx.config.paths.vlf;
    let spectrograms = provider.spectrograms(
        &ctx.base_dir.join(&vlf_paths.root),
        &vlf_paths.patterns,
        ctx.config.limits.max_files_per_source,
    )?;
    if spectrograms.is_empty() {
        return Ok(None);
    }

    let vcfg = &ctx.config.preprocess.vlf_preprocess;
    let target_ms = parse_interval_ms(&vcfg.standardize.target_interval)?;
    let mut records: Vec<Record> = Vec::new();

    for spec in &spectrograms {
        // Frequency bins near power-line harmonics are zeroed out of every
        // summary by exclusion.
        let masked: Vec<bool> = spec
            .freq_hz
            .iter()
            .map(|freq| {
                (1..=vcfg.freq_line_mask.harmonics).any(|harmonic| {
                    (freq - vcfg.freq_line_mask.base_hz * harmonic as f64).abs()
                        <= vcfg.freq_line_mask.half_width_hz
                })
            })
            .collect();

        let channels: Vec<(&str, &Vec<Vec<f64>>)> = match &spec.ch2 {
            Some(ch2) => vec![("ch1", &spec.ch1), ("ch2", ch2)],
            None => vec![("ch1", &spec.ch1)],
        };

        // channel name -> time series of (ts_ms, value)
        let mut series: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
        let mut stamps: Vec<i64> = Vec::with_capacity(spec.n_time());
        for (i, epoch_ns) in spec.epoch_ns.iter().enumerate() {
            stamps.push(epoch_ns / 1_000_000);
            for (name, matrix) in &channels {
                let Some(row) = matrix.get(i) else { continue };
                for band in &vcfg.standardize.bands_hz {
                    let bins: Vec<f64> = row
                        .iter()
                        .zip(spec.freq_hz.iter())
                        .zip(masked.iter())
                        .filter(|((cell, freq), is_masked)| {
                            !**is_masked && **freq >= band[0] && **freq < band[1] && cell.is_finite()
                        })
                        .map(|((cell, _), _)| *cell)
                        .collect();
                    let value = aggregate(&bins, &vcfg.standardize.freq_agg);
                    let key = format!("{name}_band_{}_{}", fmt_hz(band[0]), fmt_hz(band[1]));
                    series.entry(key).or_default().push(value);
                }
                let mut peak: Option<(f64, f64)> = None;
                for ((cell, freq), is_masked) in
                    row.iter().zip(spec.freq_hz.iter()).zip(masked.iter())
                {
                    if *is_masked || !cell.is_finite() {
                        continue;
                    }
                    if peak.map_or(true, |(best, _)| *cell > best) {
                        peak = Some((*cell, *freq));
                    }
                }
                series
                    .entry(format!("{name}_peak_freq"))
                    .or_default()
                    .push(peak.map(|(_, freq)| freq));
            }
        }
        // Pad short series (absent matrix rows) with missing bins.
        for values in series.values_mut() {
            values.resize(stamps.len(), None);
        }

        let mut ops = Vec::new();
        if vcfg.freq_line_mask.harmonics > 0 {
            ops.push("freq_line_mask".to_string());
        }
        if vcfg.time_median_window > 1 {
            ops.push("time_median".to_string());
        }
        if !vcfg.background_subtract.method.eq_ignore_ascii_case("none") {
            ops.push("background_subtract".to_string());
        }

        for (channel, mut values) in series {
            if vcfg.time_median_window > 1 {
                values = rolling_median(&values, vcfg.time_median_window);
            }
            if !vcfg.background_subtract.method.eq_ignore_ascii_case("none") {
                let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
                let baseline = aggregate(&present, &vcfg.background_subtract.method);
                if let Some(baseline) = baseline {
                    for slot in values.iter_mut() {
                        if let Some(v) = slot {
                            *v -= baseline;
                        }
                    }
                }
            }

            // Snap onto the target grid; same-bin rows collapse by time_agg.
            let mut bins: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
            for (ts, value) in stamps.iter().zip(values.iter()) {
                if let Some(v) = value {
                    bins.entry(ts.div_euclid(target_ms) * target_ms)
                        .or_default()
                        .push(*v);
                }
            }
            for (ts_ms, cell) in bins {
                let Some(value) = aggregate(&cell, &vcfg.standardize.time_agg) else {
                    continue;
                };
                let mut rec = Record::new(
                    ts_ms,
                    Source::Vlf,
                    spec.station_id.clone(),
                    channel.clone(),
                    Some(value),
                )
                .with_provenance(ProcStage::Standard, ctx.proc_version(), &ctx.params_hash);
                rec.quality_flags.preprocess = ops.clone();
                records.push(rec);
                if max_rows.is_some_and(|cap| records.len() >= cap) {
                    break;
                }
            }
            if max_rows.is_some_and(|cap| records.len() >= cap) {
                break;
            }
        }
    }
    if records.is_empty() {
        return Ok(None);
    }

    clear_source_partition(&ctx.paths.standard, Source::Vlf)?;
    let parquet = &ctx.config.storage.parquet;
    write_partitioned(
        &records,
        &ctx.paths.standard,
        &parquet.partition_cols,
        &parquet.compression,
        parquet.batch_rows,
        None,
    )?;
    Ok(Some(crate::report::basic_stats(&records)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geolink_core::config::{ExpandSection, PreprocessSection};
    use geolink_core::record::QualityFlags;

    fn group(values: &[Option<f64>]) -> Vec<Record> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let mut rec = Record::new(
                    i as i64 * 60_000,
                    Source::Geomag,
                    "ABK",
                    "X",
                    *value,
                );
                if value.is_none() {
                    rec.quality_flags = QualityFlags::ingested(true, "sentinel");
                }
                rec
            })
            .collect()
    }

    fn resolved(threshold: f64, max_gap: usize) -> ResolvedPreprocess {
        let mut preprocess = PreprocessSection::default();
        preprocess.outlier.threshold = threshold;
        preprocess.interpolate.max_gap_points = max_gap;
        preprocess.for_source(Source::Geomag)
    }

    #[test]
    fn spike_is_flagged_and_interpolated_back_to_one() {
        // Eleven consecutive values with a single 1000 spike: the MAD is
        // zero, so detection falls back to the Pass-1 (mean, std).
        let mut values: Vec<Option<f64>> = vec![Some(1.0); 11];
        values[5] = Some(1_000.0);
        let rows = group(&values);
        let mut global = RunningStats::default();
        for v in values.iter().flatten() {
            global.push(*v);
        }
        let cfg = resolved(3.0, 1);
        let cleaned = clean_group(Source::Geomag, &rows, &cfg, Some(&global), "0.1.0", "hash");

        let spike = &cleaned[5];
        assert!(spike.quality_flags.is_outlier);
        assert_eq!(
            spike.quality_flags.outlier_method.as_deref(),
            Some("zscore_global")
        );
        assert!(spike.quality_flags.is_interpolated);
        assert_eq!(spike.quality_flags.interp_method.as_deref(), Some("linear"));
        assert!(!spike.quality_flags.is_missing);
        assert!((spike.value.unwrap() - 1.0).abs() < 1e-9);
        for (i, rec) in cleaned.iter().enumerate() {
            if i != 5 {
                assert!(!rec.quality_flags.is_outlier);
                assert_eq!(rec.value, Some(1.0));
            }
            assert_eq!(rec.proc_stage, ProcStage::Standard);
        }
    }

    #[test]
    fn long_gaps_stay_missing_with_reason() {
        let values = vec![
            Some(1.0),
            None,
            None,
            None,
            Some(1.0),
            Some(1.0),
        ];
        let rows = group(&values);
        let cfg = resolved(4.0, 2);
        let cleaned = clean_group(Source::Geomag, &rows, &cfg, None, "0.1.0", "hash");
        for idx in 1..=3 {
            assert!(cleaned[idx].value.is_none());
            assert!(cleaned[idx].quality_flags.is_missing);
            assert!(cleaned[idx].quality_flags.missing_reason.is_some());
            assert!(!cleaned[idx].quality_flags.is_interpolated);
        }
    }

    #[test]
    fn lowpass_flags_and_params() {
        let values: Vec<Option<f64>> = (0..10).map(|i| Some(i as f64)).collect();
        let rows = group(&values);
        let mut preprocess = PreprocessSection::default();
        preprocess.filter.enabled = true;
        preprocess.filter.window = 3;
        let cfg = preprocess.for_source(Source::Geomag);
        let cleaned = clean_group(Source::Geomag, &rows, &cfg, None, "0.1.0", "hash");
        assert!(cleaned.iter().all(|rec| rec.quality_flags.is_filtered));
        assert_eq!(
            cleaned[0].quality_flags.filter_params,
            Some(FilterParams::RollingMean { window: 3 })
        );
        // Centered mean over [0,1] at the left edge.
        assert_eq!(cleaned[0].value, Some(0.5));
    }

    #[test]
    fn expansion_multiplies_rows_and_marks_clones() {
        let rows = group(&[Some(5.0)]);
        let cfg = ExpandSection {
            seconds: 60,
            mode: "start".into(),
            chunk_rows: 1_000,
        };
        let expanded = expand_rows(&rows, &cfg);
        assert_eq!(expanded.len(), 60);
        assert_eq!(expanded[0].ts_ms, 0);
        assert!(!expanded[0].quality_flags.is_interpolated);
        assert_eq!(expanded[59].ts_ms, 59_000);
        assert!(expanded[59].quality_flags.is_interpolated);
        assert_eq!(
            expanded[59].quality_flags.interp_method.as_deref(),
            Some("minute_expand")
        );

        let centered = ExpandSection {
            seconds: 60,
            mode: "centered".into(),
            chunk_rows: 1_000,
        };
        let expanded = expand_rows(&rows, &centered);
        assert_eq!(expanded.len(), 60);
        assert_eq!(expanded[0].ts_ms, -30_000);
        assert_eq!(expanded[59].ts_ms, 29_000);
    }

    #[test]
    fn fill_for_transform_holds_edges() {
        let values = vec![None, Some(2.0), None, Some(4.0), None];
        let filled = fill_for_transform(&values).unwrap();
        assert_eq!(filled, vec![2.0, 2.0, 3.0, 4.0, 4.0]);
        assert!(fill_for_transform(&[None, None]).is_none());
    }

    fn run_cleaner(records: &[Record], batch_rows: usize, dir: &std::path::Path) -> Vec<Record> {
        let mut preprocess = PreprocessSection::default();
        preprocess.filter.enabled = true;
        preprocess.filter.window = 5;
        let cfg = preprocess.for_source(Source::Geomag);

        let mut stats = RunningStats::default();
        for value in records.iter().filter_map(|rec| rec.value) {
            stats.push(value);
        }
        let mut global: HashMap<GroupKey, RunningStats> = HashMap::new();
        global.insert(("ABK".to_string(), "X".to_string()), stats);

        let writer = PartitionedWriter::new(
            dir,
            &["source".to_string(), "station_id".to_string()],
            "zstd",
            10_000,
        );
        let mut cleaner =
            StreamCleaner::new(Source::Geomag, &cfg, &global, writer, "0.1.0", "hash");
        for chunk in records.chunks(batch_rows) {
            cleaner.process_batch(chunk.to_vec()).unwrap();
        }
        cleaner.finish().unwrap();

        let mut out = geolink_store::partition::read_records(dir, None, None).unwrap();
        out.sort_by_key(|rec| rec.ts_ms);
        out
    }

    #[test]
    fn tail_carry_matches_single_batch_output() {
        // Smooth series with an interior two-point gap; lowpass enabled so
        // a centered window straddles every batch boundary.
        let values: Vec<Option<f64>> = (0..120)
            .map(|i| {
                if i == 60 || i == 61 {
                    None
                } else {
                    Some(10.0 + 2.0 * (i as f64 * 0.05).sin())
                }
            })
            .collect();
        let records = group(&values);

        let dir_whole = tempfile::tempdir().unwrap();
        let dir_batched = tempfile::tempdir().unwrap();
        let whole = run_cleaner(&records, records.len(), dir_whole.path());
        // Batch size must exceed the carried overlap (10 here).
        let batched = run_cleaner(&records, 13, dir_batched.path());

        assert_eq!(whole.len(), records.len());
        assert_eq!(whole, batched);
        // The gap interpolated identically in both runs.
        assert!(whole[60].quality_flags.is_interpolated);
        assert!(whole[61].quality_flags.is_interpolated);
    }

    #[test]
    fn filter_effect_reports_reduced_spread() {
        let values: Vec<Option<f64>> = (0..200)
            .map(|i| Some(if i % 2 == 0 { 1.0 } else { -1.0 }))
            .collect();
        let records = group(&values);

        let mut preprocess = PreprocessSection::default();
        preprocess.filter.enabled = true;
        preprocess.filter.window = 5;
        let cfg = preprocess.for_source(Source::Geomag);
        let global: HashMap<GroupKey, RunningStats> = HashMap::new();
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionedWriter::new(
            dir.path(),
            &["source".to_string()],
            "zstd",
            10_000,
        );
        let mut cleaner =
            StreamCleaner::new(Source::Geomag, &cfg, &global, writer, "0.1.0", "hash");
        cleaner.process_batch(records).unwrap();
        let (report, effect) = cleaner.finish().unwrap();

        assert_eq!(report.rows, 200);
        assert_eq!(report.station_count, 1);
        let before = effect.before_std.unwrap();
        let after = effect.after_std.unwrap();
        assert!(after < before, "lowpass should shrink the std: {after} vs {before}");
    }
}
