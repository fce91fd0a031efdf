//! Typed pipeline configuration, deep-merged overrides, and the stable
//! `params_hash` fingerprint.
//!
//! The configuration file is YAML (JSON accepted by extension). Every
//! section carries serde defaults so a minimal file is enough to run.
//! `params_hash` is the first 12 hex characters of SHA-256 over the
//! canonical sorted-key JSON serialization of the merged configuration;
//! every record and report produced by a run carries it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::Event;
use crate::record::Source;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub outputs: OutputsSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub time: TimeSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub preprocess: PreprocessSection,
    #[serde(default)]
    pub seismic: SeismicSection,
    #[serde(default)]
    pub features: FeaturesSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        PipelineSection {
            version: default_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsSection {
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for OutputsSection {
    fn default() -> Self {
        OutputsSection {
            root: default_output_root(),
        }
    }
}

// ---------------------------------------------------------------------------
// Input paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default)]
    pub geomag: IagaPathsSection,
    #[serde(default)]
    pub aef: IagaPathsSection,
    #[serde(default)]
    pub seismic: SeismicPathsSection,
    #[serde(default)]
    pub vlf: VlfPathsSection,
}

/// IAGA-2002 input root with second/minute pattern variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IagaPathsSection {
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub sec_patterns: Vec<String>,
    #[serde(default)]
    pub min_patterns: Vec<String>,
    /// One of `sec`, `min`, `both`; empty means "use `patterns` as-is".
    #[serde(default)]
    pub read_mode: String,
}

impl IagaPathsSection {
    /// Resolve the glob patterns to read, honoring `read_mode`.
    pub fn resolve_patterns(&self) -> Vec<String> {
        if !self.sec_patterns.is_empty() || !self.min_patterns.is_empty() {
            return match self.read_mode.to_ascii_lowercase().as_str() {
                "min" => self.min_patterns.clone(),
                "both" => {
                    let mut all = self.sec_patterns.clone();
                    all.extend(self.min_patterns.iter().cloned());
                    all
                }
                _ => self.sec_patterns.clone(),
            };
        }
        self.patterns.clone()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeismicPathsSection {
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub mseed_patterns: Vec<String>,
    #[serde(default)]
    pub sac_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stationxml: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlfPathsSection {
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Time & linking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSection {
    #[serde(default)]
    pub event_window: EventWindowSection,
    #[serde(default = "default_align_interval")]
    pub align_interval: String,
}

fn default_align_interval() -> String {
    "1min".to_string()
}

impl Default for TimeSection {
    fn default() -> Self {
        TimeSection {
            event_window: EventWindowSection::default(),
            align_interval: default_align_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWindowSection {
    #[serde(default = "default_pre_hours")]
    pub pre_hours: f64,
    #[serde(default = "default_post_hours")]
    pub post_hours: f64,
}

fn default_pre_hours() -> f64 {
    72.0
}

fn default_post_hours() -> f64 {
    24.0
}

impl Default for EventWindowSection {
    fn default() -> Self {
        EventWindowSection {
            pre_hours: default_pre_hours(),
            post_hours: default_post_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    #[serde(default = "default_spatial_km")]
    pub spatial_km: f64,
    #[serde(default)]
    pub require_station_location: bool,
}

fn default_spatial_km() -> f64 {
    200.0
}

impl Default for LinkSection {
    fn default() -> Self {
        LinkSection {
            spatial_km: default_spatial_km(),
            require_station_location: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessSection {
    #[serde(default)]
    pub outlier: OutlierSection,
    #[serde(default)]
    pub interpolate: InterpolateSection,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub detrend: DetrendSection,
    #[serde(default)]
    pub highpass: HighpassSection,
    #[serde(default)]
    pub wavelet: WaveletSection,
    #[serde(default)]
    pub hampel: HampelSection,
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
    /// Per-source overrides keyed like the base sections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geomag: Option<SourceOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aef: Option<SourceOverrides>,
    /// Minute→second expansion per source name.
    #[serde(default)]
    pub expand_minute_to_seconds: BTreeMap<String, ExpandSection>,
    #[serde(default)]
    pub seismic_features: SeismicFeatureSection,
    #[serde(default)]
    pub seismic_bandpass: SeismicBandpassSection,
    #[serde(default)]
    pub vlf_preprocess: VlfPreprocessSection,
}

fn default_batch_rows() -> usize {
    50_000
}

impl Default for PreprocessSection {
    fn default() -> Self {
        PreprocessSection {
            outlier: OutlierSection::default(),
            interpolate: InterpolateSection::default(),
            filter: FilterSection::default(),
            detrend: DetrendSection::default(),
            highpass: HighpassSection::default(),
            wavelet: WaveletSection::default(),
            hampel: HampelSection::default(),
            batch_rows: default_batch_rows(),
            geomag: None,
            aef: None,
            expand_minute_to_seconds: BTreeMap::new(),
            seismic_features: SeismicFeatureSection::default(),
            seismic_bandpass: SeismicBandpassSection::default(),
            vlf_preprocess: VlfPreprocessSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierSection {
    #[serde(default = "default_outlier_threshold")]
    pub threshold: f64,
}

fn default_outlier_threshold() -> f64 {
    4.0
}

impl Default for OutlierSection {
    fn default() -> Self {
        OutlierSection {
            threshold: default_outlier_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpolateSection {
    #[serde(default = "default_interp_method")]
    pub method: String,
    #[serde(default = "default_max_gap_points")]
    pub max_gap_points: usize,
}

fn default_interp_method() -> String {
    "linear".to_string()
}

fn default_max_gap_points() -> usize {
    10
}

impl Default for InterpolateSection {
    fn default() -> Self {
        InterpolateSection {
            method: default_interp_method(),
            max_gap_points: default_max_gap_points(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_filter_window")]
    pub window: usize,
}

fn default_filter_window() -> usize {
    5
}

impl Default for FilterSection {
    fn default() -> Self {
        FilterSection {
            enabled: false,
            window: default_filter_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetrendSection {
    #[serde(default)]
    pub enabled: bool,
    /// `linear` or `constant`
    #[serde(default = "default_detrend_method")]
    pub method: String,
}

fn default_detrend_method() -> String {
    "linear".to_string()
}

impl Default for DetrendSection {
    fn default() -> Self {
        DetrendSection {
            enabled: false,
            method: default_detrend_method(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighpassSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_highpass_window")]
    pub window: usize,
}

fn default_highpass_window() -> usize {
    11
}

impl Default for HighpassSection {
    fn default() -> Self {
        HighpassSection {
            enabled: false,
            window: default_highpass_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveletSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wavelet_family")]
    pub family: String,
    /// User constant scaling the universal threshold
    #[serde(default = "default_threshold_scale")]
    pub threshold_scale: f64,
    /// `soft` or `hard`
    #[serde(default = "default_wavelet_mode")]
    pub mode: String,
}

fn default_wavelet_family() -> String {
    "db4".to_string()
}

fn default_threshold_scale() -> f64 {
    1.0
}

fn default_wavelet_mode() -> String {
    "soft".to_string()
}

impl Default for WaveletSection {
    fn default() -> Self {
        WaveletSection {
            enabled: false,
            family: default_wavelet_family(),
            threshold_scale: default_threshold_scale(),
            mode: default_wavelet_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HampelSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_hampel_window")]
    pub window: usize,
    #[serde(default = "default_hampel_sigmas")]
    pub n_sigmas: f64,
}

fn default_hampel_window() -> usize {
    7
}

fn default_hampel_sigmas() -> f64 {
    3.0
}

impl Default for HampelSection {
    fn default() -> Self {
        HampelSection {
            enabled: false,
            window: default_hampel_window(),
            n_sigmas: default_hampel_sigmas(),
        }
    }
}

/// Optional per-source replacements for the base preprocessing sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier: Option<OutlierSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolate: Option<InterpolateSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detrend: Option<DetrendSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highpass: Option<HighpassSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wavelet: Option<WaveletSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hampel: Option<HampelSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandSection {
    #[serde(default = "default_expand_seconds")]
    pub seconds: usize,
    /// `start` repeats at `[0, N)`, `centered` at `[-N/2, N/2)`
    #[serde(default = "default_expand_mode")]
    pub mode: String,
    #[serde(default = "default_expand_chunk_rows")]
    pub chunk_rows: usize,
}

fn default_expand_seconds() -> usize {
    60
}

fn default_expand_mode() -> String {
    "start".to_string()
}

fn default_expand_chunk_rows() -> usize {
    10_000
}

impl Default for ExpandSection {
    fn default() -> Self {
        ExpandSection {
            seconds: default_expand_seconds(),
            mode: default_expand_mode(),
            chunk_rows: default_expand_chunk_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeismicFeatureSection {
    #[serde(default = "default_feature_interval_sec")]
    pub interval_sec: u32,
}

fn default_feature_interval_sec() -> u32 {
    60
}

impl Default for SeismicFeatureSection {
    fn default() -> Self {
        SeismicFeatureSection {
            interval_sec: default_feature_interval_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeismicBandpassSection {
    #[serde(default = "default_freqmin_hz")]
    pub freqmin_hz: f64,
    #[serde(default = "default_freqmax_user_hz")]
    pub freqmax_user_hz: f64,
    /// Upper corner is `min(freqmax_user_hz, ratio * nyquist)`
    #[serde(default = "default_nyquist_ratio")]
    pub freqmax_nyquist_ratio: f64,
    #[serde(default = "default_corners")]
    pub corners: usize,
    #[serde(default = "default_true")]
    pub zerophase: bool,
    #[serde(default = "default_taper_max_percentage")]
    pub taper_max_percentage: f64,
    #[serde(default)]
    pub notch: NotchSection,
}

fn default_freqmin_hz() -> f64 {
    0.1
}

fn default_freqmax_user_hz() -> f64 {
    20.0
}

fn default_nyquist_ratio() -> f64 {
    0.45
}

fn default_corners() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_taper_max_percentage() -> f64 {
    0.05
}

impl Default for SeismicBandpassSection {
    fn default() -> Self {
        SeismicBandpassSection {
            freqmin_hz: default_freqmin_hz(),
            freqmax_user_hz: default_freqmax_user_hz(),
            freqmax_nyquist_ratio: default_nyquist_ratio(),
            corners: default_corners(),
            zerophase: true,
            taper_max_percentage: default_taper_max_percentage(),
            notch: NotchSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotchSection {
    #[serde(default = "default_notch_base_hz")]
    pub base_hz: f64,
    #[serde(default = "default_notch_half_width")]
    pub half_width_hz: f64,
    #[serde(default)]
    pub harmonics: usize,
}

fn default_notch_base_hz() -> f64 {
    50.0
}

fn default_notch_half_width() -> f64 {
    1.0
}

impl Default for NotchSection {
    fn default() -> Self {
        NotchSection {
            base_hz: default_notch_base_hz(),
            half_width_hz: default_notch_half_width(),
            harmonics: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlfPreprocessSection {
    #[serde(default)]
    pub standardize: VlfStandardizeSection,
    /// Rolling time-median window in bins; 0 disables
    #[serde(default)]
    pub time_median_window: usize,
    #[serde(default)]
    pub freq_line_mask: FreqLineMaskSection,
    #[serde(default)]
    pub background_subtract: BackgroundSubtractSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlfStandardizeSection {
    /// Band edges as `[low_hz, high_hz]` pairs
    #[serde(default = "default_bands_hz")]
    pub bands_hz: Vec<[f64; 2]>,
    /// `median` or `mean` across frequency bins within a band
    #[serde(default = "default_freq_agg")]
    pub freq_agg: String,
    /// `median` or `mean` when collapsing rows into a target bin
    #[serde(default = "default_time_agg")]
    pub time_agg: String,
    #[serde(default = "default_vlf_target_interval")]
    pub target_interval: String,
}

fn default_bands_hz() -> Vec<[f64; 2]> {
    vec![[10.0, 1_000.0], [1_000.0, 3_000.0], [3_000.0, 10_000.0]]
}

fn default_freq_agg() -> String {
    "median".to_string()
}

fn default_time_agg() -> String {
    "mean".to_string()
}

fn default_vlf_target_interval() -> String {
    "1min".to_string()
}

impl Default for VlfStandardizeSection {
    fn default() -> Self {
        VlfStandardizeSection {
            bands_hz: default_bands_hz(),
            freq_agg: default_freq_agg(),
            time_agg: default_time_agg(),
            target_interval: default_vlf_target_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreqLineMaskSection {
    #[serde(default = "default_notch_base_hz")]
    pub base_hz: f64,
    #[serde(default)]
    pub harmonics: usize,
    #[serde(default = "default_mask_half_width")]
    pub half_width_hz: f64,
}

fn default_mask_half_width() -> f64 {
    5.0
}

impl Default for FreqLineMaskSection {
    fn default() -> Self {
        FreqLineMaskSection {
            base_hz: default_notch_base_hz(),
            harmonics: 0,
            half_width_hz: default_mask_half_width(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSubtractSection {
    /// `none`, `median`, or `mean`
    #[serde(default = "default_background_method")]
    pub method: String,
}

fn default_background_method() -> String {
    "none".to_string()
}

impl Default for BackgroundSubtractSection {
    fn default() -> Self {
        BackgroundSubtractSection {
            method: default_background_method(),
        }
    }
}

/// Preprocessing settings resolved for one source, base sections replaced
/// by any per-source overrides.
#[derive(Debug, Clone)]
pub struct ResolvedPreprocess {
    pub outlier: OutlierSection,
    pub interpolate: InterpolateSection,
    pub filter: FilterSection,
    pub detrend: DetrendSection,
    pub highpass: HighpassSection,
    pub wavelet: WaveletSection,
    pub hampel: HampelSection,
    pub expand: Option<ExpandSection>,
    pub batch_rows: usize,
}

impl PreprocessSection {
    pub fn for_source(&self, source: Source) -> ResolvedPreprocess {
        let overrides = match source {
            Source::Geomag => self.geomag.as_ref(),
            Source::Aef => self.aef.as_ref(),
            _ => None,
        };
        let mut resolved = ResolvedPreprocess {
            outlier: self.outlier.clone(),
            interpolate: self.interpolate.clone(),
            filter: self.filter.clone(),
            detrend: self.detrend.clone(),
            highpass: self.highpass.clone(),
            wavelet: self.wavelet.clone(),
            hampel: self.hampel.clone(),
            expand: self.expand_minute_to_seconds.get(source.as_str()).cloned(),
            batch_rows: self.batch_rows.max(1),
        };
        if source == Source::Aef && !resolved.hampel.enabled {
            // AEF carries a Hampel despike pass unless explicitly overridden.
            resolved.hampel.enabled = true;
        }
        if let Some(over) = overrides {
            if let Some(v) = &over.outlier {
                resolved.outlier = v.clone();
            }
            if let Some(v) = &over.interpolate {
                resolved.interpolate = v.clone();
            }
            if let Some(v) = &over.filter {
                resolved.filter = v.clone();
            }
            if let Some(v) = &over.detrend {
                resolved.detrend = v.clone();
            }
            if let Some(v) = &over.highpass {
                resolved.highpass = v.clone();
            }
            if let Some(v) = &over.wavelet {
                resolved.wavelet = v.clone();
            }
            if let Some(v) = &over.hampel {
                resolved.hampel = v.clone();
            }
        }
        resolved
    }
}

impl ResolvedPreprocess {
    /// Rows near a batch boundary that window operations could corrupt;
    /// the streaming cleaner carries this many raw rows across batches.
    pub fn overlap_rows(&self) -> usize {
        let lowpass = if self.filter.enabled { self.filter.window } else { 0 };
        let highpass = if self.highpass.enabled { self.highpass.window } else { 0 };
        let despike = if self.hampel.enabled { self.hampel.window } else { 0 };
        self.interpolate
            .max_gap_points
            .max(lowpass)
            .max(highpass)
            .max(despike)
    }
}

// ---------------------------------------------------------------------------
// Seismic raw windowing, features, limits, storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeismicSection {
    #[serde(default = "default_raw_interval_sec")]
    pub raw_interval_sec: u32,
    /// `rms`, `mean_abs`, or `max_abs`
    #[serde(default = "default_raw_value_mode")]
    pub raw_value_mode: String,
}

fn default_raw_interval_sec() -> u32 {
    1
}

fn default_raw_value_mode() -> String {
    "rms".to_string()
}

impl Default for SeismicSection {
    fn default() -> Self {
        SeismicSection {
            raw_interval_sec: default_raw_interval_sec(),
            raw_value_mode: default_raw_value_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesSection {
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    #[serde(default = "default_topn_anomalies")]
    pub topn_anomalies: usize,
    #[serde(default)]
    pub association: AssociationSection,
}

fn default_anomaly_threshold() -> f64 {
    3.0
}

fn default_topn_anomalies() -> usize {
    50
}

impl Default for FeaturesSection {
    fn default() -> Self {
        FeaturesSection {
            anomaly_threshold: default_anomaly_threshold(),
            topn_anomalies: default_topn_anomalies(),
            association: AssociationSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationSection {
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
    #[serde(default = "default_corr_threshold")]
    pub corr_threshold: f64,
    #[serde(default = "default_max_lag_minutes")]
    pub max_lag_minutes: i64,
    #[serde(default = "default_lag_step_minutes")]
    pub lag_step_minutes: i64,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    #[serde(default = "default_min_overlap")]
    pub min_overlap: usize,
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    #[serde(default = "default_topn_pairs")]
    pub topn_pairs: usize,
}

fn default_change_threshold() -> f64 {
    3.0
}

fn default_corr_threshold() -> f64 {
    0.6
}

fn default_max_lag_minutes() -> i64 {
    30
}

fn default_lag_step_minutes() -> i64 {
    1
}

fn default_min_sources() -> usize {
    2
}

fn default_min_overlap() -> usize {
    30
}

fn default_min_points() -> usize {
    20
}

fn default_topn_pairs() -> usize {
    50
}

impl Default for AssociationSection {
    fn default() -> Self {
        AssociationSection {
            change_threshold: default_change_threshold(),
            corr_threshold: default_corr_threshold(),
            max_lag_minutes: default_max_lag_minutes(),
            lag_step_minutes: default_lag_step_minutes(),
            min_sources: default_min_sources(),
            min_overlap: default_min_overlap(),
            min_points: default_min_points(),
            topn_pairs: default_topn_pairs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files_per_source: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows_per_source: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub parquet: ParquetSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetSection {
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_storage_batch_rows")]
    pub batch_rows: usize,
    #[serde(default = "default_partition_cols")]
    pub partition_cols: Vec<String>,
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_storage_batch_rows() -> usize {
    200_000
}

fn default_partition_cols() -> Vec<String> {
    vec![
        "source".to_string(),
        "station_id".to_string(),
        "date".to_string(),
    ]
}

impl Default for ParquetSection {
    fn default() -> Self {
        ParquetSection {
            compression: default_compression(),
            batch_rows: default_storage_batch_rows(),
            partition_cols: default_partition_cols(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading, merging, fingerprinting
// ---------------------------------------------------------------------------

impl PipelineConfig {
    /// Look up an event; `None` selects the first configured event.
    pub fn event(&self, event_id: Option<&str>) -> Result<&Event> {
        match event_id {
            None => self
                .events
                .first()
                .ok_or_else(|| anyhow!("no events configured and no event_id provided")),
            Some(id) => self
                .events
                .iter()
                .find(|ev| ev.event_id == id)
                .ok_or_else(|| anyhow!("event_id not found in config: {id}")),
        }
    }
}

/// Load a configuration file (YAML, or JSON by extension), applying an
/// optional override file via deep merge before deserialization.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let value = load_value(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("deserializing config '{}'", path.display()))
}

/// Load a base config plus an override file; override wins key-by-key.
pub fn load_config_with_overrides(base: &Path, overrides: &Path) -> Result<PipelineConfig> {
    let merged = deep_merge(load_value(base)?, load_value(overrides)?);
    serde_json::from_value(merged)
        .with_context(|| format!("deserializing merged config '{}'", base.display()))
}

fn load_value(path: &Path) -> Result<serde_json::Value> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => {
            serde_json::from_str(&data).context("parsing config json")
        }
        _ => {
            let yaml: serde_yaml::Value =
                serde_yaml::from_str(&data).context("parsing config yaml")?;
            serde_json::to_value(yaml).context("converting yaml config to json value")
        }
    }
}

/// Recursive key-wise merge: objects merge, everything else is replaced.
pub fn deep_merge(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Stable fingerprint: SHA-256 over sorted-key JSON, truncated to 12 hex.
pub fn compute_params_hash(config: &PipelineConfig) -> Result<String> {
    let value = serde_json::to_value(config).context("serializing config for hashing")?;
    let payload = serde_json::to_string(&value).context("rendering canonical config json")?;
    let digest = Sha256::digest(payload.as_bytes());
    let hex = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    Ok(hex[..12].to_string())
}
