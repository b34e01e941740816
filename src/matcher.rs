use serde::{Deserialize, Serialize};

use crate::geomath::distance_meters;

pub const DEFAULT_MAX_DISTANCE_M: f64 = 250.0;

/// Curated, named location a route may start from.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StartPoint {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub description: Option<String>,
}

/// Nearest candidate to (lat, lon), if it lies within `max_distance_m`.
pub fn find_closest<'a>(
    lat: f64,
    lon: f64,
    candidates: &'a [StartPoint],
    max_distance_m: f64,
) -> Option<&'a StartPoint> {
    candidates
        .iter()
        .map(|sp| (sp, distance_meters(lat, lon, sp.latitude, sp.longitude)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .filter(|(_, distance)| *distance <= max_distance_m)
        .map(|(sp, _)| sp)
}
