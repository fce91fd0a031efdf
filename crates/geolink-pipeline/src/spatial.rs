//! Station geometry: haversine distances and the brute-force spatial index
//! built from the seismic trace index.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use geolink_io::seismic::TraceMeta;

use crate::context::StageContext;
use crate::report::{load_json, write_dq_report, write_json};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1_r.cos() * lat2_r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationEntry {
    pub station_id: String,
    pub lat: f64,
    pub lon: f64,
    pub elev: Option<f64>,
}

/// Brute-force radius queries over the known stations. Small station
/// counts make anything fancier pointless.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpatialIndex {
    pub stations: Vec<StationEntry>,
}

impl SpatialIndex {
    pub fn from_stations(stations: Vec<StationEntry>) -> Self {
        SpatialIndex { stations }
    }

    /// Stations within `radius_km`, with their distances.
    pub fn query_radius(&self, lat: f64, lon: f64, radius_km: f64) -> Vec<(StationEntry, f64)> {
        self.stations
            .iter()
            .filter_map(|station| {
                let distance = haversine_km(lat, lon, station.lat, station.lon);
                (distance <= radius_km).then(|| (station.clone(), distance))
            })
            .collect()
    }
}

pub fn run_spatial(ctx: &StageContext) -> Result<()> {
    let mut stations: Vec<StationEntry> = Vec::new();
    let index_path = ctx.paths.ingest.join("seismic_index.json");
    if let Some(value) = load_json(&index_path) {
        if let Ok(metas) = serde_json::from_value::<Vec<TraceMeta>>(value) {
            let mut seen = std::collections::BTreeSet::new();
            for meta in metas {
                if let (Some(lat), Some(lon)) = (meta.lat, meta.lon) {
                    if seen.insert(meta.station_id.clone()) {
                        stations.push(StationEntry {
                            station_id: meta.station_id,
                            lat,
                            lon,
                            elev: meta.elev,
                        });
                    }
                }
            }
        }
    }

    let index = SpatialIndex::from_stations(stations);
    write_json(&ctx.paths.reports.join("spatial_index.json"), &index)?;
    write_dq_report(
        &ctx.paths.reports.join("dq_spatial.json"),
        serde_json::json!({
            "station_count": index.stations.len(),
            "index_type": "bruteforce",
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distances() {
        // Same point
        assert!(haversine_km(0.0, 0.0, 0.0, 0.0) < 1e-9);
        // One degree of longitude at the equator is ~111.2 km
        let one_degree = haversine_km(0.0, 0.0, 0.0, 1.0);
        assert!((one_degree - 111.2).abs() < 1.0);
        // (20, 20) is roughly 3,100 km from the origin
        let far = haversine_km(0.0, 0.0, 20.0, 20.0);
        assert!((far - 3_100.0).abs() < 100.0);
    }

    #[test]
    fn radius_query_filters_and_reports_distance() {
        let index = SpatialIndex::from_stations(vec![
            StationEntry {
                station_id: "NEAR".into(),
                lat: 0.1,
                lon: 0.1,
                elev: None,
            },
            StationEntry {
                station_id: "FAR".into(),
                lat: 20.0,
                lon: 20.0,
                elev: None,
            },
        ]);
        let hits = index.query_radius(0.0, 0.0, 500.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.station_id, "NEAR");
        assert!(hits[0].1 < 500.0);
    }
}
