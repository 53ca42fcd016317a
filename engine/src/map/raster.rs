//! RGBA8 raster buffers and the CPU compositing backend

use std::collections::HashMap;

use crate::geometry::{point_in_triangle, Affine, Point};

use super::effects::{blend_over, RenderOptions};
use super::loader::tile_memory_size;
use super::renderer::{CanvasMesh, CompositeBackend, PlacedTile};

/// Decoded tile pixels the backends can sample from.
pub trait TileTexture: Send + Sync + 'static {
    fn dimensions(&self) -> (u32, u32);

    /// Row-major straight-alpha RGBA8 pixels
    fn rgba(&self) -> &[u8];

    fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        let (width, _) = self.dimensions();
        let i = (y as usize * width as usize + x as usize) * 4;
        let px = &self.rgba()[i..i + 4];
        [px[0], px[1], px[2], px[3]]
    }

    fn byte_size(&self) -> usize {
        let (width, height) = self.dimensions();
        tile_memory_size(width, height)
    }
}

impl TileTexture for image::RgbaImage {
    fn dimensions(&self) -> (u32, u32) {
        image::RgbaImage::dimensions(self)
    }

    fn rgba(&self) -> &[u8] {
        self.as_raw()
    }
}

/// Owned RGBA8 image, used for tiles and for rendered frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RasterBuffer {
    /// Fully transparent buffer
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Wrap raw RGBA8 pixels. `None` when the length does not match.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        (data.len() == width as usize * height as usize * 4).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.texel(x, y)
    }

    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut [u8] {
        let i = self.offset(x, y);
        &mut self.data[i..i + 4]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn into_image(self) -> Option<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.data)
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }
}

impl TileTexture for RasterBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn rgba(&self) -> &[u8] {
        &self.data
    }
}

impl Default for RasterBuffer {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl From<image::RgbaImage> for RasterBuffer {
    fn from(img: image::RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

/// Composites on the CPU by mapping every covered canvas pixel through its
/// triangle's affine back into resource space and sampling the nearest texel.
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    frame: RasterBuffer,
    mesh: CanvasMesh,
    /// Pixels already drawn for the current map
    covered: Vec<bool>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompositeBackend for SoftwareBackend {
    fn begin_frame(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.frame = RasterBuffer::new(width, height);
        self.covered = vec![false; width as usize * height as usize];
        Ok(())
    }

    fn upload_mesh(&mut self, mesh: &CanvasMesh) -> anyhow::Result<()> {
        self.mesh = mesh.clone();
        self.covered.iter_mut().for_each(|c| *c = false);
        Ok(())
    }

    fn draw_triangles<D: TileTexture>(
        &mut self,
        tiles: &[PlacedTile<D>],
        options: &RenderOptions,
    ) -> anyhow::Result<()> {
        let Some(first) = tiles.first() else {
            return Ok(());
        };
        let level = first.tile.zoom_level;
        let lookup: HashMap<(u32, u32), &PlacedTile<D>> = tiles
            .iter()
            .map(|placed| ((placed.tile.column, placed.tile.row), placed))
            .collect();

        let (width, height) = (self.frame.width, self.frame.height);
        for triangle in &self.mesh.triangles {
            let [a, b, c] = triangle.map(|i| i as usize);
            let canvas = [self.mesh.canvas_points[a], self.mesh.canvas_points[b], self.mesh.canvas_points[c]];
            let resource = [
                self.mesh.resource_points[a],
                self.mesh.resource_points[b],
                self.mesh.resource_points[c],
            ];
            let Some(to_resource) = Affine::from_triangles(canvas, resource) else {
                continue; // collapsed on screen
            };

            let min_x = canvas.iter().map(|p| p.x).fold(f64::INFINITY, f64::min).floor().max(0.0);
            let max_x = canvas.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max).ceil().min(width as f64);
            let min_y = canvas.iter().map(|p| p.y).fold(f64::INFINITY, f64::min).floor().max(0.0);
            let max_y = canvas.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max).ceil().min(height as f64);
            if min_x >= max_x || min_y >= max_y {
                continue;
            }

            for y in min_y as u32..max_y as u32 {
                for x in min_x as u32..max_x as u32 {
                    let index = y as usize * width as usize + x as usize;
                    if self.covered[index] {
                        continue;
                    }
                    let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                    if !point_in_triangle(center, canvas[0], canvas[1], canvas[2]) {
                        continue;
                    }
                    self.covered[index] = true;

                    let r = to_resource.apply(center);
                    if r.x < 0.0 || r.y < 0.0 {
                        continue;
                    }
                    let column = (r.x / level.original_width as f64) as u32;
                    let row = (r.y / level.original_height as f64) as u32;
                    let Some(placed) = lookup.get(&(column, row)) else {
                        continue; // tile not fetched, leave transparent
                    };
                    let Some(texel) = placed.sample(r) else {
                        continue;
                    };
                    blend_over(self.frame.pixel_mut(x, y), options.shade(texel));
                }
            }
        }
        Ok(())
    }

    fn readback(&mut self) -> anyhow::Result<RasterBuffer> {
        Ok(self.frame.clone())
    }
}
