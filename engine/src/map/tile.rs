//! Tile coordinates and fetchable tile descriptions

use std::fmt;

use super::georef::MapId;
use super::image_info::{ImageInfo, ImageRequest, Region, TileZoomLevel};

/// Cache key of a tile: its resolved URL. Maps sharing an image share keys.
pub type TileKey = String;

/// Position of a tile in an image pyramid.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Tile {
    pub zoom_level: TileZoomLevel,
    pub column: u32,
    pub row: u32,
}

impl Tile {
    pub fn new(zoom_level: TileZoomLevel, column: u32, row: u32) -> Self {
        Self {
            zoom_level,
            column,
            row,
        }
    }

    /// Area covered by this tile in full resolution image pixels, clipped to the image.
    pub fn resource_region(&self, image_width: u32, image_height: u32) -> Region {
        let x = self.column * self.zoom_level.original_width;
        let y = self.row * self.zoom_level.original_height;
        Region {
            x,
            y,
            width: self.zoom_level.original_width.min(image_width.saturating_sub(x)),
            height: self.zoom_level.original_height.min(image_height.saturating_sub(y)),
        }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom_level.scale_factor, self.column, self.row)
    }
}

/// Everything needed to fetch and place one tile of one map.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct FetchableTile {
    pub map_id: MapId,
    pub tile: Tile,
    pub image_request: ImageRequest,
    pub tile_url: String,
}

impl FetchableTile {
    pub fn new(map_id: MapId, tile: Tile, image_info: &dyn ImageInfo) -> Self {
        let image_request = image_info.iiif_tile(&tile.zoom_level, tile.column, tile.row);
        let tile_url = image_info.image_url(&image_request);
        Self {
            map_id,
            tile,
            image_request,
            tile_url,
        }
    }

    pub fn key(&self) -> &str {
        &self.tile_url
    }

    /// Resource pixels covered by the tile.
    pub fn region(&self) -> Option<Region> {
        self.image_request.region
    }
}
