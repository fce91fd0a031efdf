//! Conversion between canonical records and polars DataFrames, plus single
//! parquet file read/write helpers.
//!
//! `quality_flags` travels as a stable JSON string column so the files stay
//! readable by any parquet consumer.

use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use polars::prelude::*;

use geolink_core::record::{ProcStage, QualityFlags, Record, Source};

/// Canonical column order for record frames.
pub const RECORD_COLUMNS: [&str; 12] = [
    "ts_ms",
    "source",
    "station_id",
    "channel",
    "value",
    "lat",
    "lon",
    "elev",
    "quality_flags",
    "proc_stage",
    "proc_version",
    "params_hash",
];

pub fn records_to_frame(records: &[Record]) -> Result<DataFrame> {
    let n = records.len();
    let mut ts_ms = Vec::with_capacity(n);
    let mut source = Vec::with_capacity(n);
    let mut station_id = Vec::with_capacity(n);
    let mut channel = Vec::with_capacity(n);
    let mut value = Vec::with_capacity(n);
    let mut lat = Vec::with_capacity(n);
    let mut lon = Vec::with_capacity(n);
    let mut elev = Vec::with_capacity(n);
    let mut quality_flags = Vec::with_capacity(n);
    let mut proc_stage = Vec::with_capacity(n);
    let mut proc_version = Vec::with_capacity(n);
    let mut params_hash = Vec::with_capacity(n);

    for rec in records {
        ts_ms.push(rec.ts_ms);
        source.push(rec.source.as_str());
        station_id.push(rec.station_id.clone());
        channel.push(rec.channel.clone());
        value.push(rec.value);
        lat.push(rec.lat);
        lon.push(rec.lon);
        elev.push(rec.elev);
        quality_flags.push(rec.quality_flags.to_json());
        proc_stage.push(rec.proc_stage.as_str());
        proc_version.push(rec.proc_version.clone());
        params_hash.push(rec.params_hash.clone());
    }

    DataFrame::new(vec![
        Series::new("ts_ms", ts_ms),
        Series::new("source", source),
        Series::new("station_id", station_id),
        Series::new("channel", channel),
        Series::new("value", value),
        Series::new("lat", lat),
        Series::new("lon", lon),
        Series::new("elev", elev),
        Series::new("quality_flags", quality_flags),
        Series::new("proc_stage", proc_stage),
        Series::new("proc_version", proc_version),
        Series::new("params_hash", params_hash),
    ])
    .context("building record frame")
}

fn utf8_col<'a>(df: &'a DataFrame, name: &str) -> Option<&'a Utf8Chunked> {
    df.column(name).ok().and_then(|s| s.utf8().ok())
}

fn f64_col<'a>(df: &'a DataFrame, name: &str) -> Option<&'a Float64Chunked> {
    df.column(name).ok().and_then(|s| s.f64().ok())
}

/// Rebuild records from a frame.
///
/// `fallbacks` supplies values for partition columns absent from the file
/// (hive layouts may drop them); keys are column names.
pub fn frame_to_records(
    df: &DataFrame,
    fallbacks: &[(String, String)],
) -> Result<Vec<Record>> {
    let height = df.height();
    let fallback = |name: &str| -> Option<&str> {
        fallbacks
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };

    let ts_ms = df
        .column("ts_ms")
        .context("record frame missing ts_ms")?
        .cast(&DataType::Int64)
        .context("casting ts_ms to Int64")?;
    let ts_ms = ts_ms.i64()?.clone();

    let source_col = utf8_col(df, "source");
    let station_col = utf8_col(df, "station_id");
    let channel_col = utf8_col(df, "channel");
    let value_col = f64_col(df, "value");
    let lat_col = f64_col(df, "lat");
    let lon_col = f64_col(df, "lon");
    let elev_col = f64_col(df, "elev");
    let flags_col = utf8_col(df, "quality_flags");
    let stage_col = utf8_col(df, "proc_stage");
    let version_col = utf8_col(df, "proc_version");
    let hash_col = utf8_col(df, "params_hash");

    let mut records = Vec::with_capacity(height);
    for i in 0..height {
        let source_text = source_col
            .and_then(|col| col.get(i))
            .or_else(|| fallback("source"))
            .unwrap_or("geomag");
        let source = Source::from_str(source_text)
            .map_err(|e| anyhow::anyhow!("row {i}: {e}"))?;
        let station_id = station_col
            .and_then(|col| col.get(i))
            .or_else(|| fallback("station_id"))
            .unwrap_or("unknown")
            .to_string();
        let channel = channel_col
            .and_then(|col| col.get(i))
            .or_else(|| fallback("channel"))
            .unwrap_or("unknown")
            .to_string();
        let proc_stage = stage_col
            .and_then(|col| col.get(i))
            .map(|text| ProcStage::from_str(text).unwrap_or(ProcStage::Raw))
            .unwrap_or(ProcStage::Raw);
        let quality_flags = flags_col
            .and_then(|col| col.get(i))
            .map(QualityFlags::from_json)
            .unwrap_or_default();

        records.push(Record {
            ts_ms: ts_ms.get(i).unwrap_or_default(),
            source,
            station_id,
            channel,
            value: value_col.and_then(|col| col.get(i)),
            lat: lat_col.and_then(|col| col.get(i)),
            lon: lon_col.and_then(|col| col.get(i)),
            elev: elev_col.and_then(|col| col.get(i)),
            quality_flags,
            proc_stage,
            proc_version: version_col
                .and_then(|col| col.get(i))
                .unwrap_or_default()
                .to_string(),
            params_hash: hash_col
                .and_then(|col| col.get(i))
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(records)
}

pub fn read_parquet_file(path: &Path) -> Result<DataFrame> {
    let mut file =
        File::open(path).with_context(|| format!("opening parquet '{}'", path.display()))?;
    ParquetReader::new(&mut file)
        .finish()
        .with_context(|| format!("reading parquet '{}'", path.display()))
}

pub fn write_parquet_file(df: &mut DataFrame, path: &Path, compression: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut file =
        File::create(path).with_context(|| format!("creating parquet '{}'", path.display()))?;
    ParquetWriter::new(&mut file)
        .with_compression(parse_compression(compression))
        .finish(df)
        .map(|_| ())
        .with_context(|| format!("writing parquet '{}'", path.display()))
}

pub fn parse_compression(name: &str) -> ParquetCompression {
    match name.to_ascii_lowercase().as_str() {
        "snappy" => ParquetCompression::Snappy,
        "gzip" => ParquetCompression::Gzip(None),
        "lz4" => ParquetCompression::Lz4Raw,
        "none" | "uncompressed" => ParquetCompression::Uncompressed,
        _ => ParquetCompression::Zstd(None),
    }
}
