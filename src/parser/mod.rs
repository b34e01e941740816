use gpx::{Gpx, Waypoint};
use std::io::Read;
use thiserror::Error;

use crate::geomath::distance_meters;

/// (latitude, longitude) in degrees.
pub type LatLon = (f64, f64);

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid GPX document: {0}")]
    Format(#[from] gpx::errors::GpxError),
}

/// Normalized view of a GPX document, produced once per upload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedRoute {
    pub name: String,
    pub points: Vec<LatLon>,
    pub distance_km: f64,
    pub elevation_gain_m: f64,
    pub start: Option<LatLon>,
    pub end: Option<LatLon>,
}

pub fn parse<R: Read>(reader: R) -> Result<ParsedRoute, ParseError> {
    let gpx: Gpx = gpx::read(reader)?;
    Ok(build_parsed_route(&gpx))
}

pub fn parse_bytes(bytes: &[u8]) -> Result<ParsedRoute, ParseError> {
    parse(bytes)
}

fn build_parsed_route(gpx: &Gpx) -> ParsedRoute {
    let mut parsed = ParsedRoute::default();

    // Points come from the first non-empty source: tracks, then routes, then waypoints.
    for track in &gpx.tracks {
        adopt_name(&mut parsed.name, track.name.as_deref());
        for segment in &track.segments {
            parsed.points.extend(segment.points.iter().map(lat_lon));
        }
    }

    if parsed.points.is_empty() {
        for route in &gpx.routes {
            adopt_name(&mut parsed.name, route.name.as_deref());
            parsed.points.extend(route.points.iter().map(lat_lon));
        }
    }

    if parsed.points.is_empty() {
        parsed.points.extend(gpx.waypoints.iter().map(lat_lon));
    }

    parsed.start = parsed.points.first().copied();
    parsed.end = parsed.points.last().copied();

    // Metrics always cover every track and route, whichever source supplied the points.
    for track in &gpx.tracks {
        let segments: Vec<&[Waypoint]> = track.segments.iter().map(|s| s.points.as_slice()).collect();
        if has_elevation(segments.iter().flat_map(|s| s.iter())) {
            parsed.distance_km += segments.iter().map(|s| length_3d(s)).sum::<f64>() / 1000.0;
        }
        parsed.elevation_gain_m += segments.iter().map(|s| uphill(s)).sum::<f64>();
    }

    for route in &gpx.routes {
        if has_elevation(route.points.iter()) {
            parsed.distance_km += length_3d(&route.points) / 1000.0;
        }
        parsed.elevation_gain_m += uphill(&route.points);
    }

    parsed
}

fn adopt_name(current: &mut String, candidate: Option<&str>) {
    if !current.is_empty() {
        return;
    }
    if let Some(name) = candidate.filter(|n| !n.is_empty()) {
        *current = name.to_string();
    }
}

fn lat_lon(waypoint: &Waypoint) -> LatLon {
    let point = waypoint.point();
    (point.y(), point.x())
}

fn has_elevation<'a>(mut points: impl Iterator<Item = &'a Waypoint>) -> bool {
    points.any(|p| p.elevation.is_some())
}

/// Path length in meters. Pairs missing an elevation fall back to the surface distance.
fn length_3d(points: &[Waypoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| {
            let (lat1, lon1) = lat_lon(&pair[0]);
            let (lat2, lon2) = lat_lon(&pair[1]);
            let flat = distance_meters(lat1, lon1, lat2, lon2);
            match (pair[0].elevation, pair[1].elevation) {
                (Some(e1), Some(e2)) => (flat * flat + (e2 - e1).powi(2)).sqrt(),
                _ => flat,
            }
        })
        .sum()
}

/// Sum of positive elevation deltas after a 0.3/0.4/0.3 neighbour smoothing.
fn uphill(points: &[Waypoint]) -> f64 {
    let elevations: Vec<Option<f64>> = points.iter().map(|p| p.elevation).collect();
    let size = elevations.len();

    let smoothed: Vec<Option<f64>> = (0..size)
        .map(|n| {
            let current = elevations[n]?;
            if n > 0 && n + 1 < size {
                if let (Some(prev), Some(next)) = (elevations[n - 1], elevations[n + 1]) {
                    return Some(prev * 0.3 + current * 0.4 + next * 0.3);
                }
            }
            Some(current)
        })
        .collect();

    smoothed
        .windows(2)
        .filter_map(|pair| match (pair[0], pair[1]) {
            (Some(a), Some(b)) if b > a => Some(b - a),
            _ => None,
        })
        .sum()
}
