//! Canonical in-memory form of VLF spectrograms.
//!
//! CDF decoding stays outside the core behind [`SpectrogramProvider`].
//! `ch2` is optional: some stations record a single channel and readers
//! must not fail on its absence.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One spectrogram: rows are time bins, columns are frequency bins.
/// Missing cells are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub station_id: String,
    /// Epoch nanoseconds per time bin
    pub epoch_ns: Vec<i64>,
    pub freq_hz: Vec<f64>,
    pub ch1: Vec<Vec<f64>>,
    pub ch2: Option<Vec<Vec<f64>>>,
    pub file_path: String,
}

impl Spectrogram {
    pub fn n_time(&self) -> usize {
        self.epoch_ns.len()
    }

    pub fn n_freq(&self) -> usize {
        self.freq_hz.len()
    }
}

/// Source of decoded spectrograms.
pub trait SpectrogramProvider: Send + Sync {
    fn spectrograms(
        &self,
        root: &Path,
        patterns: &[String],
        max_files: Option<usize>,
    ) -> Result<Vec<Spectrogram>>;
}

/// Station code from a VLF file name like `vlf_kny_20200101.cdf` → `KNY`.
pub fn station_from_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if let Some(rest) = lower.split_once("vlf_").map(|(_, rest)| rest) {
        let code: String = rest.chars().take_while(|ch| ch.is_ascii_alphanumeric()).collect();
        if !code.is_empty() {
            return code.to_ascii_uppercase();
        }
    }
    "UNKNOWN".to_string()
}

/// Cadence and gap summary over the epoch axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapReport {
    pub gap_count: usize,
    pub gap_indices: Vec<usize>,
    pub dt_median_s: Option<f64>,
}

/// Gaps are steps larger than twice the median cadence.
pub fn gap_report(epoch_ns: &[i64]) -> GapReport {
    if epoch_ns.len() < 2 {
        return GapReport {
            gap_count: 0,
            gap_indices: Vec::new(),
            dt_median_s: None,
        };
    }
    let diffs_s: Vec<f64> = epoch_ns
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) as f64 / 1e9)
        .collect();
    let mut sorted = diffs_s.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let dt_median = if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    };
    let gap_indices: Vec<usize> = diffs_s
        .iter()
        .enumerate()
        .filter(|(_, dt)| **dt > dt_median * 2.0)
        .map(|(i, _)| i)
        .collect();
    GapReport {
        gap_count: gap_indices.len(),
        gap_indices,
        dt_median_s: Some(dt_median),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_codes_come_from_the_file_name() {
        assert_eq!(station_from_name("vlf_kny_20200101.cdf"), "KNY");
        assert_eq!(station_from_name("VLF_ab3_x.cdf"), "AB3");
        assert_eq!(station_from_name("other.cdf"), "UNKNOWN");
    }

    #[test]
    fn gaps_are_steps_beyond_twice_the_median() {
        let second = 1_000_000_000i64;
        let epochs = vec![0, second, 2 * second, 3 * second, 10 * second, 11 * second];
        let report = gap_report(&epochs);
        assert_eq!(report.dt_median_s, Some(1.0));
        assert_eq!(report.gap_count, 1);
        assert_eq!(report.gap_indices, vec![3]);
    }

    #[test]
    fn short_series_report_no_cadence() {
        let report = gap_report(&[42]);
        assert_eq!(report.gap_count, 0);
        assert!(report.dt_median_s.is_none());
    }
}
