//! Hive-partitioned parquet datasets with rotating append-only writers,
//! predicate pushdown, and streaming batch scans.
//!
//! Layout under a dataset root, with configurable partition keys (typical:
//! `source`, `station_id`, `date`):
//!
//! ```text
//! root/source=geomag/station_id=ABK/date=2020-01-01/part-00000.parquet
//! ```
//!
//! Writers never overwrite: each partition directory carries a rotation
//! counter and every appended chunk becomes a new `part-NNNNN.parquet`.
//! Partially written runs therefore leave earlier files valid.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use walkdir::WalkDir;

use geolink_core::record::Record;

use crate::frame::{frame_to_records, read_parquet_file, records_to_frame, write_parquet_file};

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Filter expression evaluated against partition directory components and
/// against rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Inclusive timestamp window
    TsBetween { start_ms: i64, end_ms: i64 },
    SourceEq(String),
    StationEq(String),
    ChannelEq(String),
    All(Vec<Predicate>),
}

impl Predicate {
    pub fn matches_record(&self, rec: &Record) -> bool {
        match self {
            Predicate::TsBetween { start_ms, end_ms } => {
                rec.ts_ms >= *start_ms && rec.ts_ms <= *end_ms
            }
            Predicate::SourceEq(source) => rec.source.as_str() == source,
            Predicate::StationEq(station) => rec.station_id == *station,
            Predicate::ChannelEq(channel) => rec.channel == *channel,
            Predicate::All(parts) => parts.iter().all(|p| p.matches_record(rec)),
        }
    }

    /// Can a partition with this `key=value` component contain matches?
    /// Unknown keys and unparseable values never prune.
    fn allows_component(&self, key: &str, value: &str) -> bool {
        match self {
            Predicate::TsBetween { start_ms, end_ms } => {
                if key != "date" {
                    return true;
                }
                match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                    Ok(date) => {
                        let day_start = date
                            .and_hms_opt(0, 0, 0)
                            .map(|dt| dt.and_utc().timestamp_millis())
                            .unwrap_or(i64::MIN);
                        let day_end = day_start.saturating_add(86_400_000);
                        *start_ms < day_end && *end_ms >= day_start
                    }
                    Err(_) => true,
                }
            }
            Predicate::SourceEq(source) => key != "source" || value == source,
            Predicate::StationEq(station) => {
                key != "station_id" || value == sanitize_partition_value(station)
            }
            Predicate::ChannelEq(channel) => {
                key != "channel" || value == sanitize_partition_value(channel)
            }
            Predicate::All(parts) => parts.iter().all(|p| p.allows_component(key, value)),
        }
    }

    fn allows_path(&self, components: &[(String, String)]) -> bool {
        components
            .iter()
            .all(|(key, value)| self.allows_component(key, value))
    }
}

fn sanitize_partition_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch == std::path::MAIN_SEPARATOR || ch == '=' {
                '_'
            } else {
                ch
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn partition_value(rec: &Record, key: &str) -> String {
    let raw = match key {
        "source" => rec.source.as_str().to_string(),
        "station_id" => rec.station_id.clone(),
        "channel" => rec.channel.clone(),
        "date" => rec.date_key(),
        "proc_stage" => rec.proc_stage.as_str().to_string(),
        // A row missing its partition column lands under key=unknown.
        _ => String::new(),
    };
    sanitize_partition_value(&raw)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only partitioned writer with per-partition rotation counters.
///
/// Counters survive across calls (and across writers, via
/// [`PartitionedWriter::with_counters`]) so repeated appends to the same
/// root never overwrite an existing file.
pub struct PartitionedWriter {
    root: PathBuf,
    partition_keys: Vec<String>,
    compression: String,
    batch_rows: usize,
    counters: HashMap<String, u64>,
    rows_written: u64,
}

impl PartitionedWriter {
    pub fn new(
        root: impl Into<PathBuf>,
        partition_keys: &[String],
        compression: &str,
        batch_rows: usize,
    ) -> Self {
        PartitionedWriter {
            root: root.into(),
            partition_keys: partition_keys.to_vec(),
            compression: compression.to_string(),
            batch_rows: batch_rows.max(1),
            counters: HashMap::new(),
            rows_written: 0,
        }
    }

    /// Resume appending with rotation counters from a previous writer.
    pub fn with_counters(mut self, counters: HashMap<String, u64>) -> Self {
        self.counters = counters;
        self
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Consume the writer, returning the rotation counters for the caller
    /// to continue appending later.
    pub fn into_counters(self) -> HashMap<String, u64> {
        self.counters
    }

    /// Append records, grouped by partition key, chunked to `batch_rows`.
    pub fn write(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for rec in records {
            let rel = self
                .partition_keys
                .iter()
                .map(|key| format!("{key}={}", partition_value(rec, key)))
                .collect::<Vec<_>>()
                .join("/");
            groups.entry(rel).or_default().push(rec.clone());
        }
        for (rel, rows) in groups {
            let dir = if rel.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&rel)
            };
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating partition '{}'", dir.display()))?;
            let batch_rows = self.batch_rows;
            for chunk in rows.chunks(batch_rows) {
                self.write_chunk(&dir, &rel, chunk)?;
            }
        }
        Ok(())
    }

    /// Write one chunk, halving the batch on failure until a single row
    /// fails (then propagate).
    fn write_chunk(&mut self, dir: &Path, rel: &str, rows: &[Record]) -> Result<()> {
        match self.try_write_file(dir, rel, rows) {
            Ok(()) => Ok(()),
            Err(err) if rows.len() > 1 => {
                let mid = rows.len() / 2;
                tracing_fallback(rel, rows.len(), &err);
                self.write_chunk(dir, rel, &rows[..mid])?;
                self.write_chunk(dir, rel, &rows[mid..])
            }
            Err(err) => Err(err),
        }
    }

    fn try_write_file(&mut self, dir: &Path, rel: &str, rows: &[Record]) -> Result<()> {
        let counter = self.counters.entry(rel.to_string()).or_insert(0);
        let path = dir.join(format!("part-{:05}.parquet", *counter));
        let mut df = records_to_frame(rows)?;
        write_parquet_file(&mut df, &path, &self.compression)?;
        *counter += 1;
        self.rows_written += rows.len() as u64;
        Ok(())
    }
}

fn tracing_fallback(rel: &str, rows: usize, err: &anyhow::Error) {
    // Kept as stderr so the store crate stays free of a logging dependency.
    eprintln!("partition '{rel}': retrying {rows}-row chunk in halves after: {err}");
}

/// One-shot convenience: stream `records` into `root` and return the
/// rotation counters for continued appends.
pub fn write_partitioned(
    records: &[Record],
    root: &Path,
    partition_keys: &[String],
    compression: &str,
    batch_rows: usize,
    counters: Option<HashMap<String, u64>>,
) -> Result<HashMap<String, u64>> {
    let mut writer = PartitionedWriter::new(root, partition_keys, compression, batch_rows);
    if let Some(counters) = counters {
        writer = writer.with_counters(counters);
    }
    writer.write(records)?;
    Ok(writer.into_counters())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

fn partition_components(root: &Path, file: &Path) -> Vec<(String, String)> {
    let Ok(rel) = file.strip_prefix(root) else {
        return Vec::new();
    };
    rel.components()
        .filter_map(|comp| {
            let text = comp.as_os_str().to_string_lossy();
            text.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Every parquet file under `root`, sorted for deterministic scans.
fn dataset_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"))
        })
        .collect();
    files.sort();
    files
}

/// Signal from a scan callback: keep going or stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFlow {
    Continue,
    Stop,
}

/// Stream the dataset as record batches of at most `batch_rows` rows,
/// in deterministic file order. Returns early when the callback says stop.
pub fn scan_batches(
    root: &Path,
    predicate: Option<&Predicate>,
    batch_rows: usize,
    mut f: impl FnMut(Vec<Record>) -> Result<ScanFlow>,
) -> Result<()> {
    let batch_rows = batch_rows.max(1);
    let mut pending: Vec<Record> = Vec::new();
    for file in dataset_files(root) {
        let components = partition_components(root, &file);
        if let Some(pred) = predicate {
            if !pred.allows_path(&components) {
                continue;
            }
        }
        let df = read_parquet_file(&file)?;
        let mut records = frame_to_records(&df, &components)?;
        if let Some(pred) = predicate {
            records.retain(|rec| pred.matches_record(rec));
        }
        pending.extend(records);
        while pending.len() >= batch_rows {
            let rest = pending.split_off(batch_rows);
            let batch = std::mem::replace(&mut pending, rest);
            if f(batch)? == ScanFlow::Stop {
                return Ok(());
            }
        }
    }
    if !pending.is_empty() {
        let _ = f(pending)?;
    }
    Ok(())
}

/// Read matching rows as records, capped at `limit`.
pub fn read_records(
    root: &Path,
    predicate: Option<&Predicate>,
    limit: Option<usize>,
) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    scan_batches(root, predicate, 65_536, |batch| {
        out.extend(batch);
        match limit {
            Some(cap) if out.len() >= cap => Ok(ScanFlow::Stop),
            _ => Ok(ScanFlow::Continue),
        }
    })?;
    if let Some(cap) = limit {
        out.truncate(cap);
    }
    Ok(out)
}

/// Read matching rows as a single DataFrame, optionally projected to
/// `columns` and capped at `limit`. A nonexistent root yields the empty
/// canonical schema.
pub fn read_frame(
    root: &Path,
    predicate: Option<&Predicate>,
    columns: Option<&[&str]>,
    limit: Option<usize>,
) -> Result<DataFrame> {
    let records = read_records(root, predicate, limit)?;
    let df = records_to_frame(&records)?;
    match columns {
        Some(cols) => {
            let series = cols
                .iter()
                .map(|name| {
                    df.column(name)
                        .map(|s| s.clone())
                        .with_context(|| format!("projecting store column '{name}'"))
                })
                .collect::<Result<Vec<_>>>()?;
            DataFrame::new(series).context("assembling projected frame")
        }
        None => Ok(df),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geolink_core::record::Source;
    use tempfile::tempdir;

    fn keys() -> Vec<String> {
        vec!["source".into(), "station_id".into(), "date".into()]
    }

    fn make_records(station: &str, start_ts: i64, count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::new(
                    start_ts + i as i64 * 60_000,
                    Source::Geomag,
                    station,
                    "X",
                    Some(i as f64),
                )
            })
            .collect()
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let records = make_records("ABK", 1_577_836_800_000, 10);
        write_partitioned(&records, &root, &keys(), "zstd", 1_000, None).unwrap();

        let mut back = read_records(&root, None, None).unwrap();
        back.sort_by_key(|rec| rec.ts_ms);
        assert_eq!(back, records);
    }

    #[test]
    fn nonexistent_root_reads_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(read_records(&missing, None, None).unwrap().is_empty());
        let df = read_frame(&missing, None, None, None).unwrap();
        assert_eq!(df.height(), 0);
    }

    #[test]
    fn rotation_counters_prevent_overwrites() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let first = make_records("ABK", 1_577_836_800_000, 3);
        let counters =
            write_partitioned(&first, &root, &keys(), "zstd", 1_000, None).unwrap();
        let second = make_records("ABK", 1_577_837_000_000, 3);
        write_partitioned(&second, &root, &keys(), "zstd", 1_000, Some(counters)).unwrap();

        let part_dir = root
            .join("source=geomag")
            .join("station_id=ABK")
            .join("date=2020-01-01");
        let mut names: Vec<String> = std::fs::read_dir(&part_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["part-00000.parquet", "part-00001.parquet"]);

        let back = read_records(&root, None, None).unwrap();
        assert_eq!(back.len(), 6);
    }

    #[test]
    fn batch_rows_rotate_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let records = make_records("ABK", 1_577_836_800_000, 10);
        write_partitioned(&records, &root, &keys(), "zstd", 4, None).unwrap();
        let part_dir = root
            .join("source=geomag")
            .join("station_id=ABK")
            .join("date=2020-01-01");
        let count = std::fs::read_dir(&part_dir).unwrap().count();
        assert_eq!(count, 3); // 4 + 4 + 2
    }

    #[test]
    fn predicates_prune_partitions_and_rows() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let mut records = make_records("ABK", 1_577_836_800_000, 5);
        let mut aef = make_records("KAK", 1_577_836_800_000, 5);
        for rec in aef.iter_mut() {
            rec.source = Source::Aef;
        }
        records.extend(aef);
        write_partitioned(&records, &root, &keys(), "zstd", 1_000, None).unwrap();

        let only_aef = read_records(
            &root,
            Some(&Predicate::SourceEq("aef".into())),
            None,
        )
        .unwrap();
        assert_eq!(only_aef.len(), 5);
        assert!(only_aef.iter().all(|rec| rec.source == Source::Aef));

        let windowed = read_records(
            &root,
            Some(&Predicate::All(vec![
                Predicate::SourceEq("geomag".into()),
                Predicate::TsBetween {
                    start_ms: 1_577_836_800_000,
                    end_ms: 1_577_836_860_000,
                },
            ])),
            None,
        )
        .unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[test]
    fn date_pruning_skips_other_days() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let mut records = make_records("ABK", 1_577_836_800_000, 2); // 2020-01-01
        records.extend(make_records("ABK", 1_577_923_200_000, 2)); // 2020-01-02
        write_partitioned(&records, &root, &keys(), "zstd", 1_000, None).unwrap();

        let day_two = read_records(
            &root,
            Some(&Predicate::TsBetween {
                start_ms: 1_577_923_200_000,
                end_ms: 1_577_923_260_000,
            }),
            None,
        )
        .unwrap();
        assert_eq!(day_two.len(), 2);
        assert!(day_two.iter().all(|rec| rec.date_key() == "2020-01-02"));
    }

    #[test]
    fn scan_batches_rechunks_and_stops() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let records = make_records("ABK", 1_577_836_800_000, 10);
        write_partitioned(&records, &root, &keys(), "zstd", 3, None).unwrap();

        let mut sizes = Vec::new();
        scan_batches(&root, None, 4, |batch| {
            sizes.push(batch.len());
            Ok(ScanFlow::Continue)
        })
        .unwrap();
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|n| *n <= 4));

        let mut seen = 0;
        scan_batches(&root, None, 4, |batch| {
            seen += batch.len();
            Ok(ScanFlow::Stop)
        })
        .unwrap();
        assert!(seen <= 4);
    }

    #[test]
    fn projection_limits_columns() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("raw");
        let records = make_records("ABK", 1_577_836_800_000, 3);
        write_partitioned(&records, &root, &keys(), "zstd", 1_000, None).unwrap();
        let df = read_frame(&root, None, Some(&["station_id", "channel", "value"]), None).unwrap();
        assert_eq!(df.get_column_names(), vec!["station_id", "channel", "value"]);

        let limited = read_frame(&root, None, None, Some(2)).unwrap();
        assert_eq!(limited.height(), 2);
    }
}
