//! Viewport geometry: which part of geo space a canvas shows

use crate::error::{Error, Result};
use crate::geometry::{Bbox, Point};

use super::list::WarpedMapList;

/// How `Viewport::from_size_and_maps` fits the maps bbox into the canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FitMode {
    /// Whole bbox visible
    #[default]
    Contain,
    /// Canvas fully covered by the bbox
    Cover,
}

/// Canvas pixels mapped onto geo space.
///
/// Canvas y grows downward, geo y grows upward. Rotation is counter-clockwise
/// in radians and turns the canvas around its center.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    /// Canvas size in pixels
    pub canvas_width: u32,
    pub canvas_height: u32,

    pub center: Point,

    /// Geo units per canvas pixel
    pub resolution: f64,

    pub rotation: f64,
}

impl Viewport {
    pub fn new(canvas_size: (u32, u32), center: Point, resolution: f64, rotation: f64) -> Result<Self> {
        let (canvas_width, canvas_height) = canvas_size;
        if canvas_width == 0 || canvas_height == 0 {
            return Err(Error::InvalidViewport {
                reason: format!("canvas size {}x{} is empty", canvas_width, canvas_height),
            });
        }
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(Error::InvalidViewport {
                reason: format!("resolution {} is not positive", resolution),
            });
        }
        if !center.is_finite() || !rotation.is_finite() {
            return Err(Error::InvalidViewport {
                reason: "center and rotation must be finite".to_string(),
            });
        }
        Ok(Self {
            canvas_width,
            canvas_height,
            center,
            resolution,
            rotation,
        })
    }

    /// Viewport centered on the maps, sized to fit their bbox with `margin`
    /// canvas pixels on every side. `None` when the list is empty.
    pub fn from_size_and_maps(
        canvas_size: (u32, u32),
        maps: &WarpedMapList,
        fit: FitMode,
        margin: u32,
    ) -> Result<Option<Self>> {
        match maps.maps_bbox() {
            Some(bbox) => Self::from_size_and_bbox(canvas_size, &bbox, fit, margin).map(Some),
            None => Ok(None),
        }
    }

    pub fn from_size_and_bbox(canvas_size: (u32, u32), bbox: &Bbox, fit: FitMode, margin: u32) -> Result<Self> {
        let (w, h) = canvas_size;
        let usable_w = (w as f64 - 2.0 * margin as f64).max(1.0);
        let usable_h = (h as f64 - 2.0 * margin as f64).max(1.0);

        let res_x = bbox.width() / usable_w;
        let res_y = bbox.height() / usable_h;
        let mut resolution = match fit {
            FitMode::Contain => res_x.max(res_y),
            FitMode::Cover => res_x.min(res_y),
        };
        if resolution <= 0.0 {
            // point-like bbox, fall back to the other axis
            resolution = res_x.max(res_y);
        }
        if resolution <= 0.0 {
            resolution = 1.0;
        }

        Self::new(canvas_size, bbox.center(), resolution, 0.0)
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.canvas_width, self.canvas_height)
    }

    pub fn with_resolution(&self, resolution: f64) -> Result<Self> {
        Self::new(self.canvas_size(), self.center, resolution, self.rotation)
    }

    /// Zoom by `factor` (> 1 zooms in) around the center.
    pub fn zoomed(&self, factor: f64) -> Result<Self> {
        Self::new(self.canvas_size(), self.center, self.resolution / factor, self.rotation)
    }

    /// Convert canvas pixel position to geo coordinates
    pub fn canvas_to_geo(&self, canvas: Point) -> Point {
        let dx = (canvas.x - self.canvas_width as f64 / 2.0) * self.resolution;
        let dy = -(canvas.y - self.canvas_height as f64 / 2.0) * self.resolution;
        let (sin, cos) = self.rotation.sin_cos();
        Point::new(
            self.center.x + dx * cos - dy * sin,
            self.center.y + dx * sin + dy * cos,
        )
    }

    /// Convert geo coordinates to canvas pixel position
    pub fn geo_to_canvas(&self, geo: Point) -> Point {
        let gx = geo.x - self.center.x;
        let gy = geo.y - self.center.y;
        let (sin, cos) = self.rotation.sin_cos();
        let dx = gx * cos + gy * sin;
        let dy = -gx * sin + gy * cos;
        Point::new(
            dx / self.resolution + self.canvas_width as f64 / 2.0,
            -dy / self.resolution + self.canvas_height as f64 / 2.0,
        )
    }

    /// Canvas corners in geo space: top-left, top-right, bottom-right, bottom-left.
    pub fn visible_geo_polygon(&self) -> [Point; 4] {
        let (w, h) = (self.canvas_width as f64, self.canvas_height as f64);
        [
            self.canvas_to_geo(Point::new(0.0, 0.0)),
            self.canvas_to_geo(Point::new(w, 0.0)),
            self.canvas_to_geo(Point::new(w, h)),
            self.canvas_to_geo(Point::new(0.0, h)),
        ]
    }

    pub fn geo_bbox(&self) -> Bbox {
        let polygon = self.visible_geo_polygon();
        let mut bbox = Bbox {
            min: polygon[0],
            max: polygon[0],
        };
        for p in &polygon[1..] {
            bbox.extend(p);
        }
        bbox
    }
}
