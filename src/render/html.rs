use crate::parser::LatLon;
use crate::render::RouteBounds;

const LEAFLET_CSS: &str = "https://unpkg.com/leaflet@1.9.4/dist/leaflet.css";
const LEAFLET_JS: &str = "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js";
const ROUTE_COLOR: &str = "#0d6efd";
const START_COLOR: &str = "#28a745";
const END_COLOR: &str = "#dc3545";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Fixed view for screenshots: no controls, no interaction.
    Thumbnail,
    /// Pannable detail map with start/end tooltips.
    Interactive,
}

pub fn thumbnail_page(points: &[LatLon], width: u32, height: u32, tile_url: &str) -> Option<String> {
    leaflet_page(points, width, height, tile_url, PageKind::Thumbnail)
}

pub fn interactive_map(points: &[LatLon], width: u32, height: u32, tile_url: &str) -> Option<String> {
    leaflet_page(points, width, height, tile_url, PageKind::Interactive)
}

pub fn leaflet_page(
    points: &[LatLon],
    width: u32,
    height: u32,
    tile_url: &str,
    kind: PageKind,
) -> Option<String> {
    let bounds = RouteBounds::from_points(points)?;
    let first = points.first()?;
    let last = points.last()?;

    let line: Vec<[f64; 2]> = points.iter().map(|&(lat, lon)| [lat, lon]).collect();
    let line = serde_json::to_string(&line).ok()?;
    let tiles = serde_json::to_string(tile_url).ok()?;

    let (map_options, start_extra, end_extra) = match kind {
        PageKind::Thumbnail => (
            "{zoomControl: false, attributionControl: false, dragging: false, \
             scrollWheelZoom: false, doubleClickZoom: false, boxZoom: false, keyboard: false}",
            "",
            "",
        ),
        PageKind::Interactive => (
            "{}",
            ".bindTooltip('Start').bindPopup('<b>Start Point</b>')",
            ".bindTooltip('End').bindPopup('<b>End Point</b>')",
        ),
    };

    Some(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<link rel="stylesheet" href="{LEAFLET_CSS}">
<script src="{LEAFLET_JS}"></script>
<style>html, body {{ margin: 0; padding: 0; }} #map {{ width: {width}px; height: {height}px; }}</style>
</head>
<body>
<div id="map"></div>
<script>
var map = L.map('map', {map_options}).setView([{center_lat}, {center_lon}], 13);
L.tileLayer({tiles}, {{maxZoom: 19}}).addTo(map);
var line = L.polyline({line}, {{color: '{ROUTE_COLOR}', weight: 4, opacity: 0.85}}).addTo(map);
L.circleMarker([{start_lat}, {start_lon}], {{radius: 8, color: 'white', weight: 3, fillColor: '{START_COLOR}', fillOpacity: 1}}).addTo(map){start_extra};
L.circleMarker([{end_lat}, {end_lon}], {{radius: 8, color: 'white', weight: 3, fillColor: '{END_COLOR}', fillOpacity: 1}}).addTo(map){end_extra};
map.fitBounds([[{min_lat}, {min_lon}], [{max_lat}, {max_lon}]], {{padding: [20, 20]}});
</script>
</body>
</html>
"#,
        center_lat = bounds.center.0,
        center_lon = bounds.center.1,
        start_lat = first.0,
        start_lon = first.1,
        end_lat = last.0,
        end_lon = last.1,
        min_lat = bounds.min_lat,
        min_lon = bounds.min_lon,
        max_lat = bounds.max_lat,
        max_lon = bounds.max_lon,
    ))
}
