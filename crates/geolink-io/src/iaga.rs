//! IAGA-2002 ASCII reader for geomagnetic and atmospheric-electric-field
//! records.
//!
//! Header lines carry station metadata (`IAGA CODE`, geodetic coordinates,
//! elevation, the `Reported` element order); the data block starts at the
//! `DATE TIME ...` column header. Values at or above the 88888 sentinel are
//! missing. One input row fans out into one record per value channel.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use geolink_core::record::{ProcStage, QualityFlags, Record, Source};

/// IAGA missing-data sentinel: any value at or above this is missing.
pub const SENTINEL: f64 = 88_888.0;

#[derive(Debug, Clone, Default)]
pub struct IagaHeader {
    pub station_id: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elev: Option<f64>,
    pub reported: Option<String>,
}

/// Summary of a file produced without reading the whole data block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IagaFileScan {
    pub station_id: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elev: Option<f64>,
    pub reported: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    /// Cadence detected from the first two data rows; carried per file so
    /// mixed second/minute inputs keep their own intervals.
    pub interval_s: Option<f64>,
    pub file_type: String,
    pub file_path: String,
}

fn parse_header(lines: &[&str]) -> IagaHeader {
    let mut header = IagaHeader::default();
    for line in lines {
        let cleaned = line.trim().trim_matches('|').trim();
        let lower = cleaned.to_ascii_lowercase();
        let last_token = || cleaned.split_whitespace().last().map(|s| s.to_string());
        if lower.starts_with("iaga code") {
            header.station_id = last_token().map(|s| s.to_ascii_uppercase());
        } else if lower.starts_with("geodetic latitude") {
            header.lat = last_token().and_then(|s| s.parse().ok());
        } else if lower.starts_with("geodetic longitude") {
            header.lon = last_token().and_then(|s| s.parse().ok());
        } else if lower.starts_with("elevation") {
            header.elev = last_token().and_then(|s| s.parse().ok());
        } else if lower.starts_with("reported") {
            header.reported = last_token().map(|s| s.to_ascii_uppercase());
        }
    }
    header
}

fn is_column_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("DATE") && trimmed.contains("TIME")
}

fn split_columns(line: &str) -> Vec<&str> {
    line.split(['|', ' ', '\t'])
        .filter(|token| !token.is_empty())
        .collect()
}

pub fn is_sentinel(value: f64) -> bool {
    !value.is_finite() || value >= SENTINEL
}

fn parse_ts_ms(date: &str, time: &str) -> Option<i64> {
    let text = format!("{date} {time}");
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Single-letter channel name from a column like `ABKX` or `AEF_E`.
fn channel_name(column: &str) -> String {
    column
        .chars()
        .last()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| column.to_string())
}

/// Parse a whole IAGA-2002 file into canonical records.
pub fn parse_file(
    path: &Path,
    source: Source,
    params_hash: &str,
    proc_version: &str,
) -> Result<Vec<Record>> {
    read_window(path, source, None, None, None).map(|mut records| {
        for rec in records.iter_mut() {
            rec.proc_stage = ProcStage::Raw;
            rec.proc_version = proc_version.to_string();
            rec.params_hash = params_hash.to_string();
        }
        records
    })
}

/// Parse rows whose timestamps fall in `[start_ms, end_ms]`, stopping at
/// `limit` records. Open bounds read everything.
pub fn read_window(
    path: &Path,
    source: Source,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    limit: Option<usize>,
) -> Result<Vec<Record>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading IAGA file '{}'", path.display()))?;
    let lines: Vec<&str> = text.lines().collect();
    let header_end = lines
        .iter()
        .position(|line| is_column_header(line))
        .ok_or_else(|| anyhow!("IAGA2002 header not found (DATE/TIME) in '{}'", path.display()))?;
    let header = parse_header(&lines[..header_end]);
    let columns = split_columns(lines[header_end]);
    let value_cols: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|col| !matches!(*col, "DATE" | "TIME" | "DOY"))
        .collect();
    let station_id = header
        .station_id
        .clone()
        .or_else(|| {
            value_cols
                .first()
                .map(|col| col.chars().take(3).collect::<String>().to_ascii_uppercase())
        })
        .ok_or_else(|| anyhow!("no station id in '{}'", path.display()))?;

    let mut records = Vec::new();
    for line in &lines[header_end + 1..] {
        let parts = split_columns(line);
        if parts.len() < 2 {
            continue;
        }
        let Some(ts_ms) = parse_ts_ms(parts[0], parts[1]) else {
            continue;
        };
        if start_ms.is_some_and(|bound| ts_ms < bound) {
            continue;
        }
        if end_ms.is_some_and(|bound| ts_ms > bound) {
            break;
        }
        // DATE TIME DOY then one value per reported channel.
        let values = &parts[3.min(parts.len())..];
        if values.len() < value_cols.len() {
            continue;
        }
        for (col, value_text) in value_cols.iter().zip(values.iter()) {
            let value: f64 = value_text.parse().unwrap_or(f64::NAN);
            let missing = is_sentinel(value);
            let mut rec = Record::new(
                ts_ms,
                source,
                station_id.clone(),
                channel_name(col),
                (!missing).then_some(value),
            );
            rec.lat = header.lat;
            rec.lon = header.lon;
            rec.elev = header.elev;
            rec.quality_flags = QualityFlags::ingested(missing, "sentinel");
            records.push(rec);
            if limit.is_some_and(|cap| records.len() >= cap) {
                return Ok(records);
            }
        }
    }
    Ok(records)
}

/// Header metadata plus first/last timestamps and cadence, without keeping
/// the data block in memory.
pub fn scan_file(path: &Path) -> Result<IagaFileScan> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading IAGA file '{}'", path.display()))?;
    let lines: Vec<&str> = text.lines().collect();
    let header_end = lines
        .iter()
        .position(|line| is_column_header(line))
        .ok_or_else(|| anyhow!("IAGA2002 header not found in '{}'", path.display()))?;
    let header = parse_header(&lines[..header_end]);

    let mut first_ts = None;
    let mut second_ts = None;
    let mut last_ts = None;
    for line in &lines[header_end + 1..] {
        let parts = split_columns(line);
        if parts.len() < 2 {
            continue;
        }
        let Some(ts) = parse_ts_ms(parts[0], parts[1]) else {
            continue;
        };
        if first_ts.is_none() {
            first_ts = Some(ts);
        } else if second_ts.is_none() {
            second_ts = Some(ts);
        }
        last_ts = Some(ts);
    }

    let interval_s = match (first_ts, second_ts) {
        (Some(a), Some(b)) => Some((b - a) as f64 / 1_000.0),
        _ => None,
    };

    Ok(IagaFileScan {
        station_id: header.station_id,
        lat: header.lat,
        lon: header.lon,
        elev: header.elev,
        reported: header.reported,
        start_ms: first_ts,
        end_ms: last_ts,
        interval_s,
        file_type: path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase(),
        file_path: path.display().to_string(),
    })
}
