use anyhow::{Context, Result};
use geo::{BoundingRect, Centroid};
use geo_types::MultiPoint;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::config::{EngineMode, RenderConfig};
use crate::parser::LatLon;

pub mod browser;
pub mod canvas;
pub mod html;

pub use self::browser::BrowserEngine;
pub use self::canvas::CanvasEngine;

/// One way of turning a point sequence into a raster image.
pub trait RenderEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn render(&self, points: &[LatLon], width: u32, height: u32) -> Result<DynamicImage>;
}

/// Extent and centroid of a point sequence, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub center: LatLon,
}

impl RouteBounds {
    pub fn from_points(points: &[LatLon]) -> Option<Self> {
        let multi: MultiPoint<f64> = points.iter().map(|&(lat, lon)| (lon, lat)).collect::<Vec<_>>().into();
        let rect = multi.bounding_rect()?;
        let centroid = multi.centroid()?;
        Some(Self {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lon: rect.min().x,
            max_lon: rect.max().x,
            center: (centroid.y(), centroid.x()),
        })
    }
}

/// Tries each engine in order and encodes the first image produced as WebP.
pub struct MapRenderer {
    engines: Vec<Box<dyn RenderEngine>>,
}

impl MapRenderer {
    pub fn new(engines: Vec<Box<dyn RenderEngine>>) -> Self {
        Self { engines }
    }

    /// Headless browser first when one is installed, basic canvas always last.
    pub fn from_config(config: &RenderConfig) -> Self {
        let mut engines: Vec<Box<dyn RenderEngine>> = Vec::new();
        if config.engine != EngineMode::Canvas {
            match BrowserEngine::locate(config) {
                Some(engine) => {
                    tracing::info!("Render: browser engine at {:?}", engine.executable());
                    engines.push(Box::new(engine));
                }
                None if config.engine == EngineMode::Browser => {
                    tracing::warn!("Render: no headless browser found, using canvas only");
                }
                None => tracing::debug!("Render: no headless browser found"),
            }
        }
        engines.push(Box::new(CanvasEngine));
        Self::new(engines)
    }

    pub fn engine_names(&self) -> Vec<&'static str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    /// `None` means "no thumbnail available yet", never a hard failure.
    pub fn render(&self, points: &[LatLon], width: u32, height: u32) -> Option<Vec<u8>> {
        if points.is_empty() {
            return None;
        }
        for engine in &self.engines {
            let attempt = engine
                .render(points, width, height)
                .and_then(|image| encode_webp(&image));
            match attempt {
                Ok(bytes) => {
                    tracing::debug!("Render: {} engine produced {} bytes", engine.name(), bytes.len());
                    return Some(bytes);
                }
                Err(err) => tracing::warn!("Render: {} engine failed: {:#}", engine.name(), err),
            }
        }
        None
    }
}

pub fn encode_webp(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
    let mut bytes = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut bytes), ImageFormat::WebP)
        .context("Render: Failed to encode WebP")?;
    Ok(bytes)
}
