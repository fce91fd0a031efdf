//! Canonical record schema shared by every source after standardization.
//!
//! Each observation (a geomagnetic component sample, an atmospheric
//! electric-field reading, a seismic RMS window, a VLF band power) is one
//! [`Record`]. Missing values are represented by `value: None`, never by a
//! sentinel number. [`QualityFlags`] documents everything the pipeline did
//! to the row (outlier marking, interpolation, filtering) so downstream
//! consumers can audit or exclude processed points.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Observation source tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Ground magnetometer (IAGA-2002)
    Geomag,
    /// Atmospheric electric field (IAGA-2002 variant)
    Aef,
    /// Broadband seismic waveforms (MiniSEED + StationXML)
    Seismic,
    /// VLF radio spectrograms (CDF)
    Vlf,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Geomag, Source::Aef, Source::Seismic, Source::Vlf];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Geomag => "geomag",
            Source::Aef => "aef",
            Source::Seismic => "seismic",
            Source::Vlf => "vlf",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geomag" => Ok(Source::Geomag),
            "aef" => Ok(Source::Aef),
            "seismic" => Ok(Source::Seismic),
            "vlf" => Ok(Source::Vlf),
            other => Err(format!("unknown source '{other}'; use geomag, aef, seismic, or vlf")),
        }
    }
}

/// Processing stage a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcStage {
    Raw,
    Standard,
}

impl ProcStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcStage::Raw => "raw",
            ProcStage::Standard => "standard",
        }
    }
}

impl FromStr for ProcStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(ProcStage::Raw),
            "standard" => Ok(ProcStage::Standard),
            other => Err(format!("unknown proc_stage '{other}'")),
        }
    }
}

/// Parameters of a filter applied during standardization, recorded in
/// `quality_flags.filter_params` for auditability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterParams {
    RollingMean {
        window: usize,
    },
    Bandpass {
        freqmin_hz: f64,
        freqmax_hz: f64,
        corners: usize,
        zerophase: bool,
    },
    Notch {
        base_hz: f64,
        half_width_hz: f64,
        harmonics: usize,
    },
}

/// Per-row processing annotations.
///
/// The flag set is closed: the named keys below plus a free-form `note`.
/// Serialized as a stable JSON string inside parquet so any reader can parse
/// them without a custom schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityFlags {
    #[serde(default)]
    pub is_missing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_reason: Option<String>,
    #[serde(default)]
    pub is_interpolated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interp_method: Option<String>,
    #[serde(default)]
    pub is_outlier: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub is_filtered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_params: Option<FilterParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_match: Option<String>,
    /// Ordered names of preprocessing ops applied to the row's group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preprocess: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl QualityFlags {
    /// Flags for a freshly parsed row, optionally missing with a reason.
    pub fn ingested(is_missing: bool, missing_reason: &str) -> Self {
        QualityFlags {
            is_missing,
            missing_reason: is_missing.then(|| missing_reason.to_string()),
            station_match: Some("exact".to_string()),
            ..Default::default()
        }
    }

    /// Stable JSON form used inside parquet files.
    ///
    /// Keys are emitted in sorted order so that byte-equality across runs
    /// holds for identical flags.
    pub fn to_json(&self) -> String {
        // Round-trip through a Value: serde_json maps sort keys.
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let sorted: BTreeMap<String, serde_json::Value> = match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        serde_json::to_string(&sorted).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the stored JSON form; malformed input yields default flags.
    pub fn from_json(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }
}

/// One observation row: the unit written to the raw and standard stores
/// and copied into the linked table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// UTC milliseconds since epoch, monotone within a (station_id, channel) group
    pub ts_ms: i64,
    pub source: Source,
    pub station_id: String,
    pub channel: String,
    /// Measured value; `None` encodes missing (sentinel or gap)
    pub value: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elev: Option<f64>,
    pub quality_flags: QualityFlags,
    pub proc_stage: ProcStage,
    pub proc_version: String,
    pub params_hash: String,
}

impl Record {
    pub fn new(
        ts_ms: i64,
        source: Source,
        station_id: impl Into<String>,
        channel: impl Into<String>,
        value: Option<f64>,
    ) -> Self {
        Record {
            ts_ms,
            source,
            station_id: station_id.into(),
            channel: channel.into(),
            value,
            lat: None,
            lon: None,
            elev: None,
            quality_flags: QualityFlags::default(),
            proc_stage: ProcStage::Raw,
            proc_version: String::new(),
            params_hash: String::new(),
        }
    }

    pub fn with_location(mut self, lat: f64, lon: f64, elev: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self.elev = Some(elev);
        self
    }

    pub fn with_provenance(
        mut self,
        proc_stage: ProcStage,
        proc_version: &str,
        params_hash: &str,
    ) -> Self {
        self.proc_stage = proc_stage;
        self.proc_version = proc_version.to_string();
        self.params_hash = params_hash.to_string();
        self
    }

    /// UTC date (`YYYY-MM-DD`) of the row timestamp; used for the `date`
    /// partition key.
    pub fn date_key(&self) -> String {
        crate::time::ms_to_date(self.ts_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_str() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("sonar".parse::<Source>().is_err());
    }

    #[test]
    fn flags_json_is_stable_and_parseable() {
        let flags = QualityFlags {
            is_outlier: true,
            outlier_method: Some("mad_zscore".into()),
            threshold: Some(4.0),
            is_filtered: true,
            filter_type: Some("rolling_mean".into()),
            filter_params: Some(FilterParams::RollingMean { window: 5 }),
            ..Default::default()
        };
        let a = flags.to_json();
        let b = flags.to_json();
        assert_eq!(a, b);
        let parsed = QualityFlags::from_json(&a);
        assert_eq!(parsed, flags);
    }

    #[test]
    fn malformed_flag_json_degrades_to_default() {
        let parsed = QualityFlags::from_json("not json");
        assert_eq!(parsed, QualityFlags::default());
    }

    #[test]
    fn tagged_filter_params_serialize_with_type() {
        let params = FilterParams::Bandpass {
            freqmin_hz: 0.1,
            freqmax_hz: 20.0,
            corners: 4,
            zerophase: true,
        };
        let text = serde_json::to_string(&params).unwrap();
        assert!(text.contains("\"type\":\"bandpass\""));
    }

    #[test]
    fn date_key_uses_utc_calendar_date() {
        let rec = Record::new(1_577_836_800_000, Source::Geomag, "ABK", "X", Some(1.0));
        assert_eq!(rec.date_key(), "2020-01-01");
    }
}
