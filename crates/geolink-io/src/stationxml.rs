//! FDSN StationXML inventory reader.
//!
//! Pulls per-channel coordinates out of the
//! `Network > Station > Channel > Latitude/Longitude/Elevation` hierarchy
//! and joins them onto seismic trace metadata. Join statuses follow the
//! usual degradation order: `exact` on the full
//! `(network, station, location, channel)` key, `downgrade` when only the
//! location code had to be blanked, `unmatched` otherwise.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::seismic::TraceMeta;

/// Channel-level coordinates from the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationMeta {
    pub lat: f64,
    pub lon: f64,
    pub elev: f64,
}

/// `(network, station, location, channel)` → coordinates.
pub type InventoryMap = HashMap<(String, String, String, String), StationMeta>;

pub fn load_station_metadata(path: &Path) -> Result<InventoryMap> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("reading StationXML '{}'", path.display()))?;
    parse_inventory(&xml).with_context(|| format!("parsing StationXML '{}'", path.display()))
}

/// Parse a StationXML document into the channel coordinate map.
pub fn parse_inventory(xml: &str) -> Result<InventoryMap> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inventory = InventoryMap::new();
    let mut stack: Vec<String> = Vec::new();
    let mut network_code = String::new();
    let mut station_code = String::new();
    let mut channel_code = String::new();
    let mut location_code = String::new();
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;
    let mut elev: Option<f64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                match name.as_str() {
                    "Network" => {
                        network_code = attribute(&start, b"code")?.unwrap_or_default();
                    }
                    "Station" => {
                        station_code = attribute(&start, b"code")?.unwrap_or_default();
                    }
                    "Channel" => {
                        channel_code = attribute(&start, b"code")?.unwrap_or_default();
                        location_code = attribute(&start, b"locationCode")?.unwrap_or_default();
                        lat = None;
                        lon = None;
                        elev = None;
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::Text(text)) => {
                // Coordinates directly under Channel only; Station carries
                // its own Latitude elements we must not confuse with them.
                let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());
                let current = stack.last().map(|s| s.as_str());
                if parent == Some("Channel") {
                    let value: Option<f64> = text
                        .unescape()
                        .ok()
                        .and_then(|cow| cow.trim().parse().ok());
                    match current {
                        Some("Latitude") => lat = value,
                        Some("Longitude") => lon = value,
                        Some("Elevation") => elev = value,
                        _ => {}
                    }
                }
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                if name == "Channel" {
                    if let (Some(lat), Some(lon), Some(elev)) = (lat, lon, elev) {
                        inventory.insert(
                            (
                                network_code.clone(),
                                station_code.clone(),
                                location_code.clone(),
                                channel_code.clone(),
                            ),
                            StationMeta { lat, lon, elev },
                        );
                    }
                }
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => bail!("malformed StationXML: {err}"),
        }
    }
    if inventory.is_empty() {
        return Err(anyhow!("StationXML contained no channels with coordinates"));
    }
    Ok(inventory)
}

fn attribute(start: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.context("reading StationXML attribute")?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.to_string()));
        }
    }
    Ok(None)
}

/// Join quality summary written to `station_match.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationMatchReport {
    pub trace_count: usize,
    pub matched_ratio: f64,
    pub unmatched_keys_topn: Vec<String>,
}

impl Default for StationMatchReport {
    fn default() -> Self {
        StationMatchReport {
            trace_count: 0,
            matched_ratio: 0.0,
            unmatched_keys_topn: Vec::new(),
        }
    }
}

/// Attach inventory coordinates to trace metadata in place.
pub fn join_station_metadata(
    traces: &mut [TraceMeta],
    inventory: &InventoryMap,
) -> StationMatchReport {
    if traces.is_empty() {
        return StationMatchReport::default();
    }
    let mut unmatched: HashMap<String, usize> = HashMap::new();
    let mut matched = 0usize;
    for trace in traces.iter_mut() {
        let exact_key = (
            trace.network.clone(),
            trace.station.clone(),
            trace.location.clone(),
            trace.channel.clone(),
        );
        let (status, meta) = if let Some(meta) = inventory.get(&exact_key) {
            ("exact", Some(*meta))
        } else {
            let downgraded = (
                trace.network.clone(),
                trace.station.clone(),
                String::new(),
                trace.channel.clone(),
            );
            match inventory.get(&downgraded) {
                Some(meta) => ("downgrade", Some(*meta)),
                None => ("unmatched", None),
            }
        };
        trace.station_match = status.to_string();
        match meta {
            Some(meta) => {
                trace.lat = Some(meta.lat);
                trace.lon = Some(meta.lon);
                trace.elev = Some(meta.elev);
                matched += 1;
            }
            None => {
                *unmatched.entry(trace.station_id.clone()).or_default() += 1;
            }
        }
    }
    let mut top: Vec<(String, usize)> = unmatched.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    StationMatchReport {
        trace_count: traces.len(),
        matched_ratio: matched as f64 / traces.len() as f64,
        unmatched_keys_topn: top.into_iter().take(10).map(|(key, _)| key).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FDSNStationXML schemaVersion="1.1">
  <Source>Test</Source>
  <Network code="IU">
    <Station code="ANMO">
      <Latitude>34.946</Latitude>
      <Longitude>-106.457</Longitude>
      <Elevation>1820.0</Elevation>
      <Channel code="BHZ" locationCode="00">
        <Latitude>34.9459</Latitude>
        <Longitude>-106.4572</Longitude>
        <Elevation>1671.0</Elevation>
        <SampleRate>40.0</SampleRate>
      </Channel>
      <Channel code="BHN" locationCode="">
        <Latitude>34.9459</Latitude>
        <Longitude>-106.4572</Longitude>
        <Elevation>1671.0</Elevation>
      </Channel>
    </Station>
  </Network>
</FDSNStationXML>
"#;

    fn trace(location: &str, channel: &str) -> TraceMeta {
        TraceMeta {
            network: "IU".into(),
            station: "ANMO".into(),
            location: location.into(),
            channel: channel.into(),
            station_id: format!("IU.ANMO.{location}.{channel}"),
            start_ms: 0,
            end_ms: 60_000,
            sampling_rate_hz: 40.0,
            npts: 2_400,
            file_path: "test.mseed".into(),
            lat: None,
            lon: None,
            elev: None,
            station_match: String::new(),
        }
    }

    #[test]
    fn channel_coordinates_win_over_station_ones() {
        let inventory = parse_inventory(SAMPLE).unwrap();
        let meta = inventory
            .get(&("IU".into(), "ANMO".into(), "00".into(), "BHZ".into()))
            .unwrap();
        assert_eq!(meta.elev, 1671.0);
        assert_eq!(inventory.len(), 2);
    }

    #[test]
    fn join_statuses_degrade_in_order() {
        let inventory = parse_inventory(SAMPLE).unwrap();
        let mut traces = vec![
            trace("00", "BHZ"),
            trace("10", "BHN"), // inventory has only blank location -> downgrade
            trace("00", "HHZ"), // nowhere in inventory
        ];
        let report = join_station_metadata(&mut traces, &inventory);
        assert_eq!(traces[0].station_match, "exact");
        assert_eq!(traces[1].station_match, "downgrade");
        assert_eq!(traces[2].station_match, "unmatched");
        assert!(traces[1].lat.is_some());
        assert!(traces[2].lat.is_none());
        assert!((report.matched_ratio - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.unmatched_keys_topn, vec!["IU.ANMO.00.HHZ"]);
    }

    #[test]
    fn empty_inventory_is_rejected() {
        assert!(parse_inventory("<FDSNStationXML></FDSNStationXML>").is_err());
    }
}
