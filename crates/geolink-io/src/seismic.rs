//! Canonical in-memory form of seismic waveform data.
//!
//! MiniSEED decoding is out of scope for the core; anything that can yield
//! [`Trace`] values (a real decoder, a test fixture, a network client)
//! plugs in as a [`TraceProvider`].

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One continuous segment of waveform samples from a single channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    /// Start of the first sample, epoch milliseconds UTC
    pub start_ms: i64,
    pub sampling_rate_hz: f64,
    pub samples: Vec<f64>,
    /// File the trace came from, for provenance
    pub file_path: String,
}

impl Trace {
    /// Compound station key `NET.STA.LOC.CHAN`.
    pub fn station_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }

    pub fn npts(&self) -> usize {
        self.samples.len()
    }

    /// End of the last sample, epoch milliseconds.
    pub fn end_ms(&self) -> i64 {
        if self.sampling_rate_hz <= 0.0 || self.samples.is_empty() {
            return self.start_ms;
        }
        let span_ms = (self.samples.len() as f64 - 1.0) / self.sampling_rate_hz * 1_000.0;
        self.start_ms + span_ms.round() as i64
    }

    /// Metadata row for the trace index, coordinates unfilled.
    pub fn meta(&self) -> TraceMeta {
        TraceMeta {
            network: self.network.clone(),
            station: self.station.clone(),
            location: self.location.clone(),
            channel: self.channel.clone(),
            station_id: self.station_id(),
            start_ms: self.start_ms,
            end_ms: self.end_ms(),
            sampling_rate_hz: self.sampling_rate_hz,
            npts: self.npts(),
            file_path: self.file_path.clone(),
            lat: None,
            lon: None,
            elev: None,
            station_match: String::new(),
        }
    }
}

/// Trace index entry persisted by the ingest stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMeta {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub station_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub sampling_rate_hz: f64,
    pub npts: usize,
    pub file_path: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elev: Option<f64>,
    #[serde(default)]
    pub station_match: String,
}

/// Source of decoded traces; implementations own the file-format details.
pub trait TraceProvider: Send + Sync {
    fn traces(
        &self,
        root: &Path,
        patterns: &[String],
        max_files: Option<usize>,
    ) -> Result<Vec<Trace>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_id_and_end_time() {
        let trace = Trace {
            network: "IU".into(),
            station: "ANMO".into(),
            location: "00".into(),
            channel: "BHZ".into(),
            start_ms: 1_000,
            sampling_rate_hz: 40.0,
            samples: vec![0.0; 41],
            file_path: "a.mseed".into(),
        };
        assert_eq!(trace.station_id(), "IU.ANMO.00.BHZ");
        assert_eq!(trace.end_ms(), 2_000);
        assert_eq!(trace.meta().npts, 41);
    }

    #[test]
    fn empty_trace_ends_where_it_starts() {
        let trace = Trace {
            network: "IU".into(),
            station: "ANMO".into(),
            location: String::new(),
            channel: "BHZ".into(),
            start_ms: 5_000,
            sampling_rate_hz: 40.0,
            samples: Vec::new(),
            file_path: String::new(),
        };
        assert_eq!(trace.end_ms(), 5_000);
    }
}
