//! Columnar storage for the pipeline: the hive-partitioned parquet store,
//! the output directory layout, and the input-file manifest builder.

pub mod frame;
pub mod layout;
pub mod manifest;
pub mod partition;

pub use layout::OutputPaths;
pub use partition::{read_frame, read_records, scan_batches, PartitionedWriter, Predicate, ScanFlow};
