//! Seismic events of interest and their analysis windows.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::time::parse_utc_ms;

/// One event from the configuration catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// ISO-8601 UTC with trailing `Z`
    pub origin_time_utc: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Event {
    /// Origin time as epoch milliseconds.
    pub fn origin_ms(&self) -> Result<i64> {
        parse_utc_ms(&self.origin_time_utc)
    }

    /// Analysis window `[origin - pre_hours, origin + post_hours]` in
    /// epoch milliseconds.
    pub fn window_ms(&self, pre_hours: f64, post_hours: f64) -> Result<(i64, i64)> {
        let origin = self.origin_ms()?;
        let start = origin - (pre_hours * 3_600_000.0) as i64;
        let end = origin + (post_hours * 3_600_000.0) as i64;
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event {
            event_id: "ev1".into(),
            origin_time_utc: "2020-01-02T00:00:00Z".into(),
            lat: 35.0,
            lon: 139.0,
            depth_km: Some(10.0),
            magnitude: Some(6.1),
            name: None,
        }
    }

    #[test]
    fn window_straddles_origin() {
        let (start, end) = event().window_ms(72.0, 24.0).unwrap();
        let origin = event().origin_ms().unwrap();
        assert_eq!(origin - start, 72 * 3_600_000);
        assert_eq!(end - origin, 24 * 3_600_000);
    }

    #[test]
    fn optional_fields_stay_optional_in_json() {
        let mut ev = event();
        ev.depth_km = None;
        ev.magnitude = None;
        let text = serde_json::to_string(&ev).unwrap();
        assert!(!text.contains("depth_km"));
        assert!(!text.contains("magnitude"));
    }
}
