use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::matcher::{DEFAULT_MAX_DISTANCE_M, StartPoint};

pub const ENV_PREFIX: &str = "GPXROUTES";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    /// Enrichment worker threads. 0 runs each unit of work on the submitting
    /// thread, so an eager upload only returns once its enrichment is done.
    pub workers: usize,
    pub matching: MatchingConfig,
    pub start_points: Vec<StartPoint>,
    pub geocoder: GeocoderConfig,
    pub render: RenderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            workers: 2,
            matching: MatchingConfig::default(),
            start_points: Vec::new(),
            geocoder: GeocoderConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl AppConfig {
    /// Optional YAML file, then `GPXROUTES_*` environment variables on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Config: Failed to read configuration")?;
        settings
            .try_deserialize()
            .context("Config: Invalid configuration")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MatchingConfig {
    pub max_distance_m: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_distance_m: DEFAULT_MAX_DISTANCE_M,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_secs: f64,
    /// The public Nominatim instance allows one request per second.
    pub min_interval_ms: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/reverse".to_string(),
            user_agent: "GPXRoutesApp/1.0".to_string(),
            timeout_secs: 5.0,
            min_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub engine: EngineMode,
    pub browser_path: Option<PathBuf>,
    pub tile_wait_ms: u64,
    /// Time the browser gets on top of `tile_wait_ms` before it is killed.
    pub browser_grace_ms: u64,
    /// Screenshots smaller than this mean the basemap tiles never arrived.
    pub min_image_bytes: usize,
    pub tile_url: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 200,
            engine: EngineMode::Auto,
            browser_path: None,
            tile_wait_ms: 2000,
            browser_grace_ms: 10_000,
            min_image_bytes: 5000,
            tile_url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Auto,
    Browser,
    Canvas,
}

impl FromStr for EngineMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(EngineMode::Auto),
            "browser" => Ok(EngineMode::Browser),
            "canvas" => Ok(EngineMode::Canvas),
            _ => Err(format!("invalid render engine: {value}")),
        }
    }
}
