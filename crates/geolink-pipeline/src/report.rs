//! Data-quality reporting shared by every stage.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use geolink_core::record::Record;
use geolink_core::time::utc_now_iso;

/// Write any serializable payload as pretty JSON, creating parents.
pub fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating report directory '{}'", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(payload).context("serializing report")?;
    std::fs::write(path, json).with_context(|| format!("writing report '{}'", path.display()))
}

/// Write a DQ report stamped with `generated_at_utc`.
pub fn write_dq_report(path: &Path, payload: serde_json::Value) -> Result<()> {
    let mut payload = payload;
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert(
            "generated_at_utc".to_string(),
            serde_json::Value::String(utc_now_iso()),
        );
    }
    write_json(path, &payload)
}

/// Load a JSON file if it exists.
pub fn load_json(path: &Path) -> Option<serde_json::Value> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Per-source dataset summary used across the DQ reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicStats {
    pub rows: usize,
    pub ts_min: Option<i64>,
    pub ts_max: Option<i64>,
    pub missing_rate: Option<f64>,
    pub outlier_rate: Option<f64>,
    pub station_count: usize,
}

pub fn basic_stats(records: &[Record]) -> BasicStats {
    if records.is_empty() {
        return BasicStats::default();
    }
    let rows = records.len();
    let ts_min = records.iter().map(|rec| rec.ts_ms).min();
    let ts_max = records.iter().map(|rec| rec.ts_ms).max();
    let missing = records.iter().filter(|rec| rec.value.is_none()).count();
    let outliers = records
        .iter()
        .filter(|rec| rec.quality_flags.is_outlier)
        .count();
    let stations: std::collections::BTreeSet<&str> = records
        .iter()
        .map(|rec| rec.station_id.as_str())
        .collect();
    BasicStats {
        rows,
        ts_min,
        ts_max,
        missing_rate: Some(missing as f64 / rows as f64),
        outlier_rate: Some(outliers as f64 / rows as f64),
        station_count: stations.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geolink_core::record::Source;
    use tempfile::tempdir;

    #[test]
    fn stats_count_missing_and_stations() {
        let mut missing = Record::new(60_000, Source::Geomag, "KAK", "Y", None);
        missing.quality_flags.is_missing = true;
        let records = vec![
            Record::new(0, Source::Geomag, "ABK", "X", Some(1.0)),
            missing,
        ];
        let stats = basic_stats(&records);
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.station_count, 2);
        assert_eq!(stats.ts_min, Some(0));
        assert_eq!(stats.ts_max, Some(60_000));
        assert_eq!(stats.missing_rate, Some(0.5));
        assert_eq!(stats.outlier_rate, Some(0.0));
    }

    #[test]
    fn empty_stats_are_all_defaults() {
        let stats = basic_stats(&[]);
        assert_eq!(stats.rows, 0);
        assert!(stats.ts_min.is_none());
        assert!(stats.missing_rate.is_none());
    }

    #[test]
    fn dq_report_gets_a_timestamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports/dq_test.json");
        write_dq_report(&path, serde_json::json!({"rows": 3})).unwrap();
        let loaded = load_json(&path).unwrap();
        assert_eq!(loaded["rows"], 3);
        assert!(loaded["generated_at_utc"].as_str().unwrap().ends_with('Z'));
    }
}
