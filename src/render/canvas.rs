use anyhow::{Result, bail};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};

use super::{RenderEngine, RouteBounds};
use crate::parser::LatLon;

const BACKGROUND: Rgba<u8> = Rgba([0xe3, 0xf2, 0xfd, 255]);
const ROUTE: Rgba<u8> = Rgba([0x0d, 0x6e, 0xfd, 255]);
const START: Rgba<u8> = Rgba([0x28, 0xa7, 0x45, 255]);
const END: Rgba<u8> = Rgba([0xdc, 0x35, 0x45, 255]);
const OUTLINE: Rgba<u8> = Rgba([255, 255, 255, 255]);

const PADDING: f64 = 12.0;
const MARKER_RADIUS: i32 = 5;
const LINE_OFFSETS: [(f32, f32); 5] = [(0.0, 0.0), (1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)];

/// Offline fallback: the route on a plain background, no basemap.
pub struct CanvasEngine;

/// Equirectangular projection scaled to fit the canvas with equal aspect.
struct Projection {
    center: (f64, f64),
    lon_scale: f64,
    scale: f64,
    width: f64,
    height: f64,
}

impl Projection {
    fn fit(bounds: &RouteBounds, width: u32, height: u32) -> Self {
        let lon_scale = bounds.center.0.to_radians().cos().abs().max(1e-6);
        let span_x = ((bounds.max_lon - bounds.min_lon) * lon_scale).max(1e-9);
        let span_y = (bounds.max_lat - bounds.min_lat).max(1e-9);
        let usable_w = (f64::from(width) - 2.0 * PADDING).max(1.0);
        let usable_h = (f64::from(height) - 2.0 * PADDING).max(1.0);
        Self {
            center: (
                (bounds.min_lat + bounds.max_lat) / 2.0,
                (bounds.min_lon + bounds.max_lon) / 2.0,
            ),
            lon_scale,
            scale: (usable_w / span_x).min(usable_h / span_y),
            width: f64::from(width),
            height: f64::from(height),
        }
    }

    fn pixel(&self, (lat, lon): LatLon) -> (f32, f32) {
        let x = self.width / 2.0 + (lon - self.center.1) * self.lon_scale * self.scale;
        let y = self.height / 2.0 - (lat - self.center.0) * self.scale;
        (x as f32, y as f32)
    }
}

impl RenderEngine for CanvasEngine {
    fn name(&self) -> &'static str {
        "canvas"
    }

    fn render(&self, points: &[LatLon], width: u32, height: u32) -> Result<DynamicImage> {
        if width == 0 || height == 0 {
            bail!("Render: Canvas size must be non-zero, got {width}x{height}");
        }
        let Some(bounds) = RouteBounds::from_points(points) else {
            bail!("Render: No points to draw");
        };
        let projection = Projection::fit(&bounds, width, height);
        let pixels: Vec<(f32, f32)> = points.iter().map(|&p| projection.pixel(p)).collect();

        let mut canvas = RgbaImage::from_pixel(width, height, BACKGROUND);
        for pair in pixels.windows(2) {
            for (dx, dy) in LINE_OFFSETS {
                draw_line_segment_mut(
                    &mut canvas,
                    (pair[0].0 + dx, pair[0].1 + dy),
                    (pair[1].0 + dx, pair[1].1 + dy),
                    ROUTE,
                );
            }
        }

        // End first so a loop's start marker stays visible on top.
        for (pixel, color) in [(pixels[pixels.len() - 1], END), (pixels[0], START)] {
            let center = (pixel.0.round() as i32, pixel.1.round() as i32);
            draw_filled_circle_mut(&mut canvas, center, MARKER_RADIUS + 2, OUTLINE);
            draw_filled_circle_mut(&mut canvas, center, MARKER_RADIUS, color);
        }

        Ok(DynamicImage::ImageRgba8(canvas))
    }
}
