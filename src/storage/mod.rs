use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::parser::{LatLon, ParsedRoute};
use crate::utils::normalize_tags;

pub type RouteId = u64;

const ROUTES_DIR: &str = "routes";
const GPX_DIR: &str = "gpx";
const THUMBNAILS_DIR: &str = "thumbnails";
const MAPS_DIR: &str = "maps";

/// Persisted route record. `start_location`, `thumbnail` and `map_html` are
/// written at most once by enrichment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Route {
    pub id: RouteId,
    pub name: String,
    pub distance_km: f64,
    pub elevation_gain_m: f64,
    pub coordinates: Vec<LatLon>,
    pub start_lat: Option<f64>,
    pub start_lon: Option<f64>,
    pub end_lat: Option<f64>,
    pub end_lon: Option<f64>,
    #[serde(default)]
    pub start_location: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Blob path relative to the data directory.
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub map_html: Option<String>,
    #[serde(default)]
    pub gpx_file: Option<String>,
    pub share_token: String,
    pub uploaded_at: String,
}

impl Route {
    pub fn start(&self) -> Option<LatLon> {
        Some((self.start_lat?, self.start_lon?))
    }

    pub fn distance_miles(&self) -> f64 {
        self.distance_km * 0.621371
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_map_html(&self) -> bool {
        self.map_html.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Everything needed to create a record; ids, tokens and timestamps are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewRoute {
    pub name: String,
    pub distance_km: f64,
    pub elevation_gain_m: f64,
    pub coordinates: Vec<LatLon>,
    pub start: Option<LatLon>,
    pub end: Option<LatLon>,
    pub gpx_file: Option<(String, Vec<u8>)>,
}

impl NewRoute {
    pub fn from_parsed(name: String, parsed: ParsedRoute) -> Self {
        Self {
            name,
            distance_km: parsed.distance_km,
            elevation_gain_m: parsed.elevation_gain_m,
            start: parsed.start,
            end: parsed.end,
            coordinates: parsed.points,
            gpx_file: None,
        }
    }

    pub fn with_gpx_file(mut self, filename: &str, bytes: Vec<u8>) -> Self {
        self.gpx_file = Some((filename.to_string(), bytes));
        self
    }
}

/// Route records as JSON files under `<data_dir>/routes`, blobs in sibling directories.
pub struct RouteStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl RouteStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [ROUTES_DIR, GPX_DIR, THUMBNAILS_DIR, MAPS_DIR] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Storage: Failed to create {:?}", root.join(dir)))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn create(&self, new_route: NewRoute) -> Result<Route> {
        let _guard = self.lock()?;
        let id = self.next_id()?;
        let uploaded_at = now_rfc3339()?;

        let gpx_file = match &new_route.gpx_file {
            Some((filename, bytes)) => {
                let relative = format!("{GPX_DIR}/{id}_{}", sanitize_filename(filename));
                self.write_atomic(&self.root.join(&relative), bytes)?;
                Some(relative)
            }
            None => None,
        };

        let route = Route {
            id,
            name: new_route.name,
            distance_km: new_route.distance_km,
            elevation_gain_m: new_route.elevation_gain_m,
            coordinates: new_route.coordinates,
            start_lat: new_route.start.map(|p| p.0),
            start_lon: new_route.start.map(|p| p.1),
            end_lat: new_route.end.map(|p| p.0),
            end_lon: new_route.end.map(|p| p.1),
            start_location: String::new(),
            tags: Vec::new(),
            thumbnail: None,
            map_html: None,
            gpx_file,
            share_token: uuid::Uuid::new_v4().simple().to_string(),
            uploaded_at,
        };
        self.write_record(&route)?;
        Ok(route)
    }

    pub fn get(&self, id: RouteId) -> Result<Option<Route>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Newest first.
    pub fn all(&self) -> Result<Vec<Route>> {
        let mut routes = Vec::new();
        for id in self.ids()? {
            routes.push(read_record(&self.record_path(id))?);
        }
        routes.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(routes)
    }

    pub fn find_by_share_token(&self, token: &str) -> Result<Option<Route>> {
        Ok(self.all()?.into_iter().find(|r| r.share_token == token))
    }

    pub fn delete(&self, id: RouteId) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(route) = self.get(id)? else {
            return Ok(false);
        };
        for blob in [&route.gpx_file, &route.thumbnail, &route.map_html]
            .into_iter()
            .flatten()
        {
            let _ = std::fs::remove_file(self.root.join(blob));
        }
        std::fs::remove_file(self.record_path(id))
            .with_context(|| format!("Storage: Failed to delete route {id}"))?;
        Ok(true)
    }

    pub fn add_tags(&self, id: RouteId, names: &[String]) -> Result<bool> {
        self.update(id, |route| {
            let merged = normalize_tags(route.tags.iter().chain(names.iter()));
            if merged == route.tags {
                return Ok(false);
            }
            route.tags = merged;
            Ok(true)
        })
    }

    /// Leaves a non-empty location untouched.
    pub fn set_start_location_if_empty(&self, id: RouteId, location: &str) -> Result<bool> {
        self.update(id, |route| {
            if !route.start_location.is_empty() || location.is_empty() {
                return Ok(false);
            }
            route.start_location = location.to_string();
            Ok(true)
        })
    }

    /// Operator backfill: overwrites whatever location is stored.
    pub fn replace_start_location(&self, id: RouteId, location: &str) -> Result<bool> {
        self.update(id, |route| {
            if route.start_location == location {
                return Ok(false);
            }
            route.start_location = location.to_string();
            Ok(true)
        })
    }

    /// Stores the image unless a thumbnail exists and `replace` is false.
    pub fn store_thumbnail(&self, id: RouteId, webp: &[u8], replace: bool) -> Result<bool> {
        self.update(id, |route| {
            if route.has_thumbnail() && !replace {
                return Ok(false);
            }
            let relative = format!("{THUMBNAILS_DIR}/{}.webp", blob_digest(&route.name)?);
            self.write_atomic(&self.root.join(&relative), webp)?;
            if let Some(old) = route.thumbnail.replace(relative) {
                let _ = std::fs::remove_file(self.root.join(old));
            }
            Ok(true)
        })
    }

    pub fn store_map_html_if_empty(&self, id: RouteId, html: &str) -> Result<bool> {
        self.update(id, |route| {
            if route.has_map_html() {
                return Ok(false);
            }
            let relative = format!("{MAPS_DIR}/{}.html", blob_digest(&format!("{}_map", route.name))?);
            self.write_atomic(&self.root.join(&relative), html.as_bytes())?;
            route.map_html = Some(relative);
            Ok(true)
        })
    }

    pub fn read_blob(&self, relative: &str) -> Result<Vec<u8>> {
        std::fs::read(self.root.join(relative))
            .with_context(|| format!("Storage: Failed to read blob {relative}"))
    }

    /// Applies `apply` to the stored record and persists it when it reports a change.
    /// A missing record is not an error; it reports no change.
    fn update<F>(&self, id: RouteId, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut Route) -> Result<bool>,
    {
        let _guard = self.lock()?;
        let Some(mut route) = self.get(id)? else {
            return Ok(false);
        };
        if !apply(&mut route)? {
            return Ok(false);
        }
        self.write_record(&route)?;
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("Storage: Write lock poisoned"))
    }

    fn ids(&self) -> Result<Vec<RouteId>> {
        let dir = self.root.join(ROUTES_DIR);
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir).with_context(|| format!("Storage: Failed to list {:?}", dir))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<RouteId>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn next_id(&self) -> Result<RouteId> {
        Ok(self.ids()?.into_iter().max().unwrap_or(0) + 1)
    }

    fn record_path(&self, id: RouteId) -> PathBuf {
        self.root.join(ROUTES_DIR).join(format!("{id}.json"))
    }

    fn write_record(&self, route: &Route) -> Result<()> {
        let json = serde_json::to_vec_pretty(route)
            .with_context(|| format!("Storage: Failed to serialize route {}", route.id))?;
        self.write_atomic(&self.record_path(route.id), &json)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut file = NamedTempFile::new_in(dir)
            .with_context(|| format!("Storage: Failed to create temp file in {:?}", dir))?;
        file.write_all(bytes)?;
        file.persist(path)
            .with_context(|| format!("Storage: Failed to write {:?}", path))?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Route> {
    let bytes = std::fs::read(path).with_context(|| format!("Storage: Failed to read {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Storage: Corrupt record {:?}", path))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("Storage: Failed to format timestamp")
}

/// Hex digest of the current timestamp and `seed`, unique enough for blob names.
fn blob_digest(seed: &str) -> Result<String> {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    Ok(format!("{:x}", md5::compute(format!("{nanos}{seed}"))))
}

fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.gpx");
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}
