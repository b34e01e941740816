use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AppConfig;
use crate::geocoder::ReverseGeocoder;
use crate::matcher::{StartPoint, find_closest};
use crate::parser::{ParseError, parse_bytes};
use crate::render::MapRenderer;
use crate::render::html::interactive_map;
use crate::storage::{NewRoute, Route, RouteId, RouteStore};
use crate::tasks::{TaskQueue, TaskReport};

/// Raw bytes and metadata captured at upload time.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub name: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("your GPX file could not be read: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// `override > GPX name > filename without extension`; blank values do not count.
pub fn resolve_name(override_name: Option<&str>, parsed_name: &str, filename: &str) -> String {
    if let Some(name) = override_name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    if !parsed_name.trim().is_empty() {
        return parsed_name.to_string();
    }
    Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename)
        .to_string()
}

/// Parse, name and persist one upload. Parse failures come back as `IngestError::Parse`.
pub fn create_route(store: &RouteStore, upload: Upload) -> Result<Route, IngestError> {
    let parsed = parse_bytes(&upload.bytes)?;
    let name = resolve_name(upload.name.as_deref(), &parsed.name, &upload.filename);
    let new_route = NewRoute::from_parsed(name, parsed).with_gpx_file(&upload.filename, upload.bytes);

    let route = store.create(new_route)?;
    if !upload.tags.is_empty() {
        store.add_tags(route.id, &upload.tags)?;
    }
    tracing::info!("Created route {} '{}' ({:.2} km)", route.id, route.name, route.distance_km);
    Ok(store.get(route.id)?.unwrap_or(route))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    StartPoint,
    Geocoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    NotFound,
    Processed {
        start_location: bool,
        thumbnail: bool,
        map_html: bool,
    },
}

#[derive(Debug, Clone)]
pub struct EnrichSettings {
    pub max_distance_m: f64,
    pub thumbnail_size: (u32, u32),
    pub map_size: (u32, u32),
    pub tile_url: String,
}

impl EnrichSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_distance_m: config.matching.max_distance_m,
            thumbnail_size: (config.render.width, config.render.height),
            map_size: (800, 500),
            tile_url: config.render.tile_url.clone(),
        }
    }
}

/// The idempotent post-creation stage. Each field is filled only while empty.
pub struct Enricher {
    store: Arc<RouteStore>,
    start_points: Arc<Vec<StartPoint>>,
    geocoder: Arc<dyn ReverseGeocoder>,
    renderer: Arc<MapRenderer>,
    settings: EnrichSettings,
}

impl Enricher {
    pub fn new(
        store: Arc<RouteStore>,
        start_points: Arc<Vec<StartPoint>>,
        geocoder: Arc<dyn ReverseGeocoder>,
        renderer: Arc<MapRenderer>,
        settings: EnrichSettings,
    ) -> Self {
        Self {
            store,
            start_points,
            geocoder,
            renderer,
            settings,
        }
    }

    pub fn renderer(&self) -> &MapRenderer {
        &self.renderer
    }

    pub fn settings(&self) -> &EnrichSettings {
        &self.settings
    }

    pub fn match_start_point(&self, lat: f64, lon: f64) -> Option<&StartPoint> {
        find_closest(lat, lon, &self.start_points, self.settings.max_distance_m)
    }

    /// Known start point within range, else the reverse geocoder.
    pub fn resolve_start_location(&self, lat: f64, lon: f64) -> (String, LocationSource) {
        match self.match_start_point(lat, lon) {
            Some(start_point) => (start_point.name.clone(), LocationSource::StartPoint),
            None => (self.geocoder.resolve(lat, lon), LocationSource::Geocoder),
        }
    }

    pub fn geocode(&self, lat: f64, lon: f64) -> String {
        self.geocoder.resolve(lat, lon)
    }

    pub fn enrich(&self, id: RouteId) -> Result<EnrichOutcome> {
        let Some(route) = self.store.get(id)? else {
            tracing::warn!("Route {} not found", id);
            return Ok(EnrichOutcome::NotFound);
        };

        let mut start_location = false;
        if route.start_location.is_empty()
            && let Some((lat, lon)) = route.start()
        {
            let (location, source) = self.resolve_start_location(lat, lon);
            start_location = stored(id, "start location", self.store.set_start_location_if_empty(id, &location));
            tracing::info!("Route {}: start location '{}' ({:?})", id, location, source);
        }

        let mut thumbnail = false;
        if !route.coordinates.is_empty() && !route.has_thumbnail() {
            let (width, height) = self.settings.thumbnail_size;
            match self.renderer.render(&route.coordinates, width, height) {
                Some(bytes) => {
                    thumbnail = stored(id, "thumbnail", self.store.store_thumbnail(id, &bytes, false))
                }
                None => tracing::warn!("Route {}: no thumbnail available", id),
            }
        }

        let mut map_html = false;
        if !route.coordinates.is_empty() && !route.has_map_html() {
            let (width, height) = self.settings.map_size;
            if let Some(page) = interactive_map(&route.coordinates, width, height, &self.settings.tile_url) {
                map_html = stored(id, "map", self.store.store_map_html_if_empty(id, &page));
            }
        }

        Ok(EnrichOutcome::Processed {
            start_location,
            thumbnail,
            map_html,
        })
    }

    pub fn report(&self, id: RouteId) -> TaskReport {
        match self.enrich(id) {
            Ok(EnrichOutcome::Processed { .. }) => {
                TaskReport::ok(format!("Successfully processed route {id}"))
            }
            Ok(EnrichOutcome::NotFound) => TaskReport::ok(format!("Route {id} not found")),
            Err(err) => TaskReport::failed(format!("Error processing route {id}: {err:#}")),
        }
    }
}

/// A failed write leaves that field empty for the next run; the other steps still go ahead.
fn stored(id: RouteId, what: &str, result: Result<bool>) -> bool {
    result.unwrap_or_else(|err| {
        tracing::warn!("Route {}: failed to store {}: {:#}", id, what, err);
        false
    })
}

/// Upload entry points. Enrichment always runs as a submitted unit of work.
pub struct RoutePipeline {
    store: Arc<RouteStore>,
    enricher: Arc<Enricher>,
    queue: Arc<dyn TaskQueue>,
}

impl RoutePipeline {
    pub fn new(store: Arc<RouteStore>, enricher: Arc<Enricher>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            store,
            enricher,
            queue,
        }
    }

    /// Parses and persists synchronously; location and thumbnail follow in the background.
    pub fn ingest(&self, upload: Upload) -> Result<Route, IngestError> {
        let route = create_route(&self.store, upload)?;
        if let Err(err) = self.schedule_enrichment(route.id) {
            tracing::warn!("Route {}: enrichment not scheduled: {:#}", route.id, err);
        }
        Ok(route)
    }

    /// Captures the upload only; parsing, creation and enrichment all happen on the queue.
    pub fn ingest_deferred(&self, upload: Upload) -> Result<()> {
        let store = Arc::clone(&self.store);
        let enricher = Arc::clone(&self.enricher);
        self.queue.submit(Box::new(move || {
            let filename = upload.filename.clone();
            match create_route(&store, upload) {
                Ok(route) => enricher.report(route.id),
                Err(IngestError::Parse(err)) => {
                    TaskReport::failed(format!("Error parsing GPX for {filename}: {err}"))
                }
                Err(IngestError::Storage(err)) => {
                    TaskReport::failed(format!("Failed to store {filename}: {err:#}"))
                }
            }
        }))
    }

    pub fn schedule_enrichment(&self, id: RouteId) -> Result<()> {
        let enricher = Arc::clone(&self.enricher);
        self.queue.submit(Box::new(move || enricher.report(id)))
    }

    pub fn wait(&self) -> Vec<TaskReport> {
        self.queue.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{CanvasEngine, RenderEngine};
    use crate::parser::LatLon;
    use crate::tasks::{InlineQueue, WorkerPool};
    use anyhow::bail;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_TRACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test">
  <trk>
    <name>Sample Track</name>
    <trkseg>
      <trkpt lat="52.4603" lon="-2.1638"><ele>50</ele></trkpt>
      <trkpt lat="52.4613" lon="-2.1628"><ele>60</ele></trkpt>
      <trkpt lat="52.4623" lon="-2.1618"><ele>55</ele></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    struct StubGeocoder {
        calls: AtomicUsize,
    }

    impl ReverseGeocoder for StubGeocoder {
        fn resolve(&self, _lat: f64, _lon: f64) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            "Main Street, Birmingham, England".to_string()
        }
    }

    struct BrokenEngine;

    impl RenderEngine for BrokenEngine {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn render(&self, _points: &[LatLon], _width: u32, _height: u32) -> Result<DynamicImage> {
            bail!("no browser")
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<RouteStore>,
        geocoder: Arc<StubGeocoder>,
        enricher: Arc<Enricher>,
    }

    fn fixture(start_points: Vec<StartPoint>, engine: Box<dyn RenderEngine>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RouteStore::open(dir.path()).unwrap());
        let geocoder = Arc::new(StubGeocoder {
            calls: AtomicUsize::new(0),
        });
        let enricher = Arc::new(Enricher::new(
            store.clone(),
            Arc::new(start_points),
            geocoder.clone(),
            Arc::new(MapRenderer::new(vec![engine])),
            EnrichSettings::from_config(&AppConfig::default()),
        ));
        Fixture {
            dir,
            store,
            geocoder,
            enricher,
        }
    }

    fn village_hall() -> StartPoint {
        StartPoint {
            name: "Village Hall".to_string(),
            latitude: 52.4604,
            longitude: -2.1637,
            description: Some("Car park by the hall".to_string()),
        }
    }

    fn upload(filename: &str, body: &str) -> Upload {
        Upload {
            filename: filename.to_string(),
            bytes: body.as_bytes().to_vec(),
            name: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn resolves_names_in_priority_order() {
        assert_eq!(resolve_name(Some("Mine"), "From GPX", "file.gpx"), "Mine");
        assert_eq!(resolve_name(Some("  "), "From GPX", "file.gpx"), "From GPX");
        assert_eq!(resolve_name(None, "", "Morning Ride.GPX"), "Morning Ride");
        assert_eq!(resolve_name(None, "", "noext"), "noext");
    }

    #[test]
    fn eager_ingest_then_enrichment() {
        let fx = fixture(vec![village_hall()], Box::new(CanvasEngine));
        let queue = Arc::new(InlineQueue::new());
        let pipeline = RoutePipeline::new(fx.store.clone(), fx.enricher.clone(), queue);

        let route = pipeline.ingest(upload("sample.gpx", SAMPLE_TRACK)).unwrap();
        assert_eq!(route.name, "Sample Track");
        assert!(route.distance_km > 0.0);
        assert_eq!(route.coordinates.len(), 3);
        assert_eq!(route.start_lat, Some(52.4603));
        assert_eq!(route.start_lon, Some(-2.1638));
        assert!(route.start_location.is_empty());
        // The inline queue has already enriched the record by the time ingest returns.
        let before_wait = fx.store.get(route.id).unwrap().unwrap();
        assert_eq!(before_wait.start_location, "Village Hall");

        let reports = pipeline.wait();
        assert_eq!(reports, vec![TaskReport::ok(format!("Successfully processed route {}", route.id))]);

        let stored = fx.store.get(route.id).unwrap().unwrap();
        assert_eq!(stored.start_location, "Village Hall");
        let thumbnail = fx.store.read_blob(stored.thumbnail.as_deref().unwrap()).unwrap();
        assert!(!thumbnail.is_empty());
        assert!(stored.has_map_html());
        assert_eq!(fx.geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn enrichment_is_idempotent() {
        let fx = fixture(Vec::new(), Box::new(CanvasEngine));
        let route = create_route(&fx.store, upload("sample.gpx", SAMPLE_TRACK)).unwrap();

        let first = fx.enricher.enrich(route.id).unwrap();
        assert_eq!(
            first,
            EnrichOutcome::Processed {
                start_location: true,
                thumbnail: true,
                map_html: true
            }
        );
        let after_first = fx.store.get(route.id).unwrap().unwrap();

        let second = fx.enricher.enrich(route.id).unwrap();
        assert_eq!(
            second,
            EnrichOutcome::Processed {
                start_location: false,
                thumbnail: false,
                map_html: false
            }
        );
        let after_second = fx.store.get(route.id).unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.start_location, "Main Street, Birmingham, England");
        assert_eq!(fx.geocoder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_location_is_not_geocoded_again() {
        let fx = fixture(Vec::new(), Box::new(CanvasEngine));
        let route = create_route(&fx.store, upload("sample.gpx", SAMPLE_TRACK)).unwrap();
        fx.store.set_start_location_if_empty(route.id, "Custom").unwrap();

        fx.enricher.enrich(route.id).unwrap();
        assert_eq!(fx.geocoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.store.get(route.id).unwrap().unwrap().start_location, "Custom");
    }

    #[test]
    fn render_failure_still_processes_route() {
        let fx = fixture(vec![village_hall()], Box::new(BrokenEngine));
        let route = create_route(&fx.store, upload("sample.gpx", SAMPLE_TRACK)).unwrap();

        let report = fx.enricher.report(route.id);
        assert!(report.ok);
        let stored = fx.store.get(route.id).unwrap().unwrap();
        assert_eq!(stored.start_location, "Village Hall");
        assert!(!stored.has_thumbnail());
    }

    #[test]
    fn thumbnail_write_failure_keeps_other_steps() {
        let fx = fixture(vec![village_hall()], Box::new(CanvasEngine));
        let route = create_route(&fx.store, upload("sample.gpx", SAMPLE_TRACK)).unwrap();

        let thumbnails = fx.dir.path().join("thumbnails");
        std::fs::remove_dir_all(&thumbnails).unwrap();
        std::fs::write(&thumbnails, b"not a directory").unwrap();

        let outcome = fx.enricher.enrich(route.id).unwrap();
        assert_eq!(
            outcome,
            EnrichOutcome::Processed {
                start_location: true,
                thumbnail: false,
                map_html: true,
            }
        );
        let stored = fx.store.get(route.id).unwrap().unwrap();
        assert_eq!(stored.start_location, "Village Hall");
        assert!(!stored.has_thumbnail());
        assert!(stored.has_map_html());
        assert!(fx.enricher.report(route.id).ok);
    }

    #[test]
    fn missing_route_is_a_no_op() {
        let fx = fixture(Vec::new(), Box::new(CanvasEngine));
        assert_eq!(fx.enricher.enrich(99).unwrap(), EnrichOutcome::NotFound);
        assert_eq!(fx.enricher.report(99), TaskReport::ok("Route 99 not found"));
    }

    #[test]
    fn empty_document_creates_bare_route() {
        let fx = fixture(Vec::new(), Box::new(CanvasEngine));
        let route = create_route(
            &fx.store,
            upload("empty.gpx", r#"<?xml version="1.0"?><gpx version="1.1"></gpx>"#),
        )
        .unwrap();
        assert_eq!(route.name, "empty");
        assert_eq!(route.start(), None);

        assert_eq!(
            fx.enricher.enrich(route.id).unwrap(),
            EnrichOutcome::Processed {
                start_location: false,
                thumbnail: false,
                map_html: false
            }
        );
        assert_eq!(fx.geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn eager_parse_error_is_surfaced() {
        let fx = fixture(Vec::new(), Box::new(CanvasEngine));
        let pipeline = RoutePipeline::new(fx.store.clone(), fx.enricher.clone(), Arc::new(InlineQueue::new()));

        let err = pipeline.ingest(upload("bad.gpx", "<gpx version=\"1.1\"><trk>")).unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
        assert!(err.to_string().starts_with("your GPX file could not be read"));
        assert!(fx.store.all().unwrap().is_empty());
        assert!(pipeline.wait().is_empty());
    }

    #[test]
    fn deferred_batch_reports_per_file() {
        let fx = fixture(vec![village_hall()], Box::new(CanvasEngine));
        let pipeline = RoutePipeline::new(fx.store.clone(), fx.enricher.clone(), Arc::new(WorkerPool::new(2)));

        let mut good = upload("good.gpx", SAMPLE_TRACK);
        good.tags = vec!["hiking".to_string(), "Hiking ".to_string()];
        pipeline.ingest_deferred(good).unwrap();
        pipeline.ingest_deferred(upload("bad.gpx", "not xml at all")).unwrap();

        let reports = pipeline.wait();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports.iter().filter(|r| r.ok).count(), 1);
        let failure = reports.iter().find(|r| !r.ok).unwrap();
        assert!(failure.message.starts_with("Error parsing GPX for bad.gpx"), "{}", failure.message);

        let routes = fx.store.all().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].tags, vec!["hiking"]);
        assert_eq!(routes[0].start_location, "Village Hall");
        assert!(routes[0].has_thumbnail());
    }
}
