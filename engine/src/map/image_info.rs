//! Image tile pyramids and IIIF style image requests

use std::sync::Arc;

use super::georef::Resource;

/// Standard IIIF tile edge length in tile pixels
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// One level of an image tile pyramid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileZoomLevel {
    /// Image pixels per tile pixel
    pub scale_factor: u32,
    /// Tile size in tile pixels
    pub width: u32,
    pub height: u32,
    /// Tile size in full resolution image pixels
    pub original_width: u32,
    pub original_height: u32,
    pub columns: u32,
    pub rows: u32,
}

impl TileZoomLevel {
    pub fn new(image_width: u32, image_height: u32, tile_width: u32, tile_height: u32, scale_factor: u32) -> Self {
        let original_width = tile_width * scale_factor;
        let original_height = tile_height * scale_factor;
        Self {
            scale_factor,
            width: tile_width,
            height: tile_height,
            original_width,
            original_height,
            columns: image_width.div_ceil(original_width).max(1),
            rows: image_height.div_ceil(original_height).max(1),
        }
    }
}

/// Crop rectangle in full resolution image pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Crop and resize request against an image service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImageRequest {
    pub region: Option<Region>,
    pub size: Option<Size>,
}

/// Image information needed to pick and address tiles.
pub trait ImageInfo: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Available pyramid levels, any order.
    fn tile_zoom_levels(&self) -> &[TileZoomLevel];
    fn iiif_tile(&self, level: &TileZoomLevel, column: u32, row: u32) -> ImageRequest;
    fn image_url(&self, request: &ImageRequest) -> String;
}

/// Resolves the image information of a map's resource.
pub trait ImageInfoResolver: Send + Sync {
    fn resolve(&self, resource: &Resource) -> anyhow::Result<Arc<dyn ImageInfo>>;
}

/// IIIF Image API service with a regular tile pyramid.
#[derive(Clone, Debug, PartialEq)]
pub struct IiifImage {
    id: String,
    width: u32,
    height: u32,
    format: String,
    levels: Vec<TileZoomLevel>,
}

impl IiifImage {
    /// Image with the given tile size and scale factors.
    pub fn new(
        id: impl Into<String>,
        width: u32,
        height: u32,
        tile_width: u32,
        tile_height: u32,
        scale_factors: &[u32],
    ) -> Self {
        let levels = scale_factors
            .iter()
            .filter(|sf| **sf > 0)
            .map(|sf| TileZoomLevel::new(width, height, tile_width, tile_height, *sf))
            .collect();
        Self {
            id: id.into().trim_end_matches('/').to_string(),
            width,
            height,
            format: "jpg".to_string(),
            levels,
        }
    }

    /// Image with power of two scale factors down to a single tile.
    pub fn with_default_pyramid(id: impl Into<String>, width: u32, height: u32, tile_size: u32) -> Self {
        let mut scale_factors = vec![1];
        let mut sf = 1u32;
        while width.div_ceil(sf) > tile_size || height.div_ceil(sf) > tile_size {
            sf *= 2;
            scale_factors.push(sf);
        }
        Self::new(id, width, height, tile_size, tile_size, &scale_factors)
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl ImageInfo for IiifImage {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn tile_zoom_levels(&self) -> &[TileZoomLevel] {
        &self.levels
    }

    fn iiif_tile(&self, level: &TileZoomLevel, column: u32, row: u32) -> ImageRequest {
        let x = column * level.original_width;
        let y = row * level.original_height;
        let width = level.original_width.min(self.width.saturating_sub(x));
        let height = level.original_height.min(self.height.saturating_sub(y));
        ImageRequest {
            region: Some(Region { x, y, width, height }),
            size: Some(Size {
                width: width.div_ceil(level.scale_factor),
                height: height.div_ceil(level.scale_factor),
            }),
        }
    }

    fn image_url(&self, request: &ImageRequest) -> String {
        let region = match request.region {
            Some(r) => format!("{},{},{},{}", r.x, r.y, r.width, r.height),
            None => "full".to_string(),
        };
        let size = match request.size {
            Some(s) => format!("{},{}", s.width, s.height),
            None => "max".to_string(),
        };
        format!("{}/{}/{}/0/default.{}", self.id, region, size, self.format)
    }
}

/// Resolves every resource as an IIIF service with a power of two pyramid.
#[derive(Clone, Copy, Debug)]
pub struct IiifResolver {
    pub tile_size: u32,
}

impl Default for IiifResolver {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl ImageInfoResolver for IiifResolver {
    fn resolve(&self, resource: &Resource) -> anyhow::Result<Arc<dyn ImageInfo>> {
        if resource.width == 0 || resource.height == 0 {
            anyhow::bail!("resource {} has no pixels", resource.id);
        }
        Ok(Arc::new(IiifImage::with_default_pyramid(
            resource.id.clone(),
            resource.width,
            resource.height,
            self.tile_size.max(1),
        )))
    }
}
