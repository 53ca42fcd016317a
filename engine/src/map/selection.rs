//! Viewport driven tile selection

use std::collections::{BTreeSet, HashSet};

use crate::geometry::{clip_polygon, Bbox, Point};

use super::georef::MapId;
use super::image_info::TileZoomLevel;
use super::list::WarpedMapList;
use super::tile::{FetchableTile, Tile};
use super::viewport::Viewport;
use super::warped_map::WarpedMap;

/// Relative slack allowed when a coarser pyramid level is almost fine enough
pub const LEVEL_TOLERANCE: f64 = 0.25;

/// Tiles one map needs for a viewport.
#[derive(Clone, Debug, PartialEq)]
pub struct MapTiles {
    pub map_id: MapId,
    pub zoom_level: TileZoomLevel,
    /// Resource pixels per canvas pixel needed to avoid upsampling
    pub required_scale: f64,
    pub tiles: Vec<FetchableTile>,
}

/// Result of selecting tiles for every visible map, bottom map first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileSelection {
    pub maps: Vec<MapTiles>,
}

impl TileSelection {
    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(|m| m.tiles.is_empty())
    }

    pub fn for_map(&self, map_id: &MapId) -> Option<&MapTiles> {
        self.maps.iter().find(|m| &m.map_id == map_id)
    }

    /// Tiles deduplicated by URL, first occurrence wins.
    pub fn unique_tiles(&self) -> Vec<&FetchableTile> {
        let mut seen = HashSet::new();
        self.maps
            .iter()
            .flat_map(|m| m.tiles.iter())
            .filter(|t| seen.insert(t.tile_url.clone()))
            .collect()
    }

    pub fn keys(&self) -> HashSet<String> {
        self.maps
            .iter()
            .flat_map(|m| m.tiles.iter())
            .map(|t| t.tile_url.clone())
            .collect()
    }
}

/// Pick the pyramid level for `required` resource pixels per canvas pixel.
///
/// Largest scale factor not coarser than `required * (1 + tolerance)`, or the
/// finest level when none qualifies.
pub fn choose_zoom_level(levels: &[TileZoomLevel], required: f64, tolerance: f64) -> Option<TileZoomLevel> {
    let limit = required * (1.0 + tolerance.max(0.0));
    levels
        .iter()
        .filter(|l| l.scale_factor as f64 <= limit)
        .max_by_key(|l| l.scale_factor)
        .or_else(|| levels.iter().min_by_key(|l| l.scale_factor))
        .copied()
}

/// Select the tiles every visible map in `list` needs to draw `viewport`.
pub fn select_tiles(list: &WarpedMapList, viewport: &Viewport, tolerance: f64) -> TileSelection {
    let polygon = viewport.visible_geo_polygon();
    let maps = list
        .maps_in_geo_bbox(&viewport.geo_bbox())
        .into_iter()
        .filter(|map| map.render_options().visible)
        .filter_map(|map| select_map_tiles(map, viewport, &polygon, tolerance))
        .collect();
    TileSelection { maps }
}

fn select_map_tiles(
    map: &WarpedMap,
    viewport: &Viewport,
    polygon: &[Point; 4],
    tolerance: f64,
) -> Option<MapTiles> {
    let warps = map.triangle_warps();

    // clipped geo polygon of every triangle overlapping the viewport
    let visible: Vec<(usize, Vec<Point>)> = (0..map.mesh().len())
        .filter_map(|i| {
            let clipped = clip_polygon(&map.geo_triangle(i), polygon);
            (clipped.len() >= 3).then_some((i, clipped))
        })
        .collect();
    if visible.is_empty() {
        return None;
    }

    // finest spot of the whole map, independent of the visible part
    let max_scale = map.max_resource_to_geo_scale();
    if !(max_scale > 0.0 && max_scale.is_finite()) {
        log::debug!("map {} collapses in the viewport, no tiles selected", map.id());
        return None;
    }
    let required_scale = viewport.resolution / max_scale;

    let image_info = map.image_info();
    let zoom_level = choose_zoom_level(image_info.tile_zoom_levels(), required_scale, tolerance)?;
    let (image_width, image_height) = (image_info.width() as f64, image_info.height() as f64);

    let mut cells = BTreeSet::new();
    for (i, clipped) in &visible {
        let Some(inverse) = warps[*i].geo_to_resource else {
            continue;
        };
        let resource: Vec<Point> = clipped.iter().map(|p| inverse.apply(*p)).collect();
        let Some(bbox) = Bbox::from_points(&resource) else {
            continue;
        };
        let min_x = bbox.min.x.clamp(0.0, image_width);
        let max_x = bbox.max.x.clamp(0.0, image_width);
        let min_y = bbox.min.y.clamp(0.0, image_height);
        let max_y = bbox.max.y.clamp(0.0, image_height);

        let (columns, rows) = cell_range(&zoom_level, min_x, max_x, min_y, max_y);
        for row in rows.clone() {
            for column in columns.clone() {
                cells.insert((row, column));
            }
        }
    }

    let tiles = cells
        .into_iter()
        .map(|(row, column)| {
            FetchableTile::new(
                map.id().clone(),
                Tile::new(zoom_level, column, row),
                image_info.as_ref(),
            )
        })
        .collect();

    Some(MapTiles {
        map_id: map.id().clone(),
        zoom_level,
        required_scale,
        tiles,
    })
}

fn cell_range(
    level: &TileZoomLevel,
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
) -> (std::ops::RangeInclusive<u32>, std::ops::RangeInclusive<u32>) {
    let axis = |min: f64, max: f64, size: u32, count: u32| {
        let size = size as f64;
        let last = count.saturating_sub(1);
        let first = ((min / size).floor() as u32).min(last);
        let end = (((max / size).ceil() as u32).saturating_sub(1)).clamp(first, last);
        first..=end
    };
    (
        axis(min_x, max_x, level.original_width, level.columns),
        axis(min_y, max_y, level.original_height, level.rows),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::events::EventBus;
    use crate::map::georef::{Gcp, GeoreferencedMap, Resource, TransformationType};
    use crate::map::image_info::IiifResolver;
    use crate::map::transform::{FnTransformer, TransformError, Transformer, TransformerBuilder};
    use crate::map::warped_map::DEFAULT_MESH_DENSITY;

    fn map(id: &str, resource_id: &str, offset: f64) -> GeoreferencedMap {
        GeoreferencedMap::new(
            id,
            Resource {
                id: resource_id.to_string(),
                width: 2000,
                height: 1500,
            },
            vec![
                Gcp::new((0.0, 0.0), (offset, 0.0)),
                Gcp::new((2000.0, 0.0), (offset + 2.0, 0.0)),
                Gcp::new((0.0, 1500.0), (offset, -1.5)),
            ],
            GeoreferencedMap::full_image_mask(2000, 1500),
        )
    }

    #[test]
    fn test_choose_zoom_level() {
        let levels: Vec<TileZoomLevel> = [1, 2, 4, 8]
            .iter()
            .map(|sf| TileZoomLevel::new(2000, 1500, 256, 256, *sf))
            .collect();
        let pick = |required| choose_zoom_level(&levels, required, LEVEL_TOLERANCE).unwrap().scale_factor;
        assert_eq!(pick(1.0), 1);
        assert_eq!(pick(3.0), 2);
        assert_eq!(pick(3.5), 4);
        assert_eq!(pick(100.0), 8);
        assert_eq!(pick(0.1), 1);
        assert!(choose_zoom_level(&[], 1.0, LEVEL_TOLERANCE).is_none());
    }

    #[test]
    fn test_zoom_in_never_coarsens() {
        let mut list = WarpedMapList::default();
        list.add_georeferenced_map(map("a", "https://example.org/iiif/a", 0.0)).unwrap();

        let mut viewport = Viewport::new((512, 384), Point::new(1.0, -0.75), 0.01, 0.0).unwrap();
        let mut previous = u32::MAX;
        for _ in 0..8 {
            let selection = select_tiles(&list, &viewport, LEVEL_TOLERANCE);
            let sf = selection.maps[0].zoom_level.scale_factor;
            assert!(sf <= previous, "scale factor grew from {} to {}", previous, sf);
            previous = sf;
            viewport = viewport.zoomed(1.7).unwrap();
        }
        assert_eq!(previous, 1);
    }

    #[test]
    fn test_native_resolution_selects_covering_tiles() {
        let mut list = WarpedMapList::default();
        list.add_georeferenced_map(map("a", "https://example.org/iiif/a", 0.0)).unwrap();

        // whole map at one resource pixel per canvas pixel
        let viewport = Viewport::new((2000, 1500), Point::new(1.0, -0.75), 0.001, 0.0).unwrap();
        let selection = select_tiles(&list, &viewport, LEVEL_TOLERANCE);
        let tiles = &selection.maps[0];
        assert_eq!(tiles.zoom_level.scale_factor, 1);
        assert_eq!(tiles.tiles.len(), 8 * 6);

        // top left quarter only
        let viewport = Viewport::new((500, 375), Point::new(0.25, -0.1875), 0.001, 0.0).unwrap();
        let selection = select_tiles(&list, &viewport, LEVEL_TOLERANCE);
        let tiles = &selection.maps[0].tiles;
        assert!(tiles.iter().all(|t| t.tile.column <= 2 && t.tile.row <= 2));
        assert!(tiles.iter().any(|t| t.tile.column == 0 && t.tile.row == 0));
    }

    #[test]
    fn test_shared_resource_tiles_are_deduplicated() {
        let mut list = WarpedMapList::default();
        list.add_georeferenced_map(map("a", "https://example.org/iiif/shared", 0.0)).unwrap();
        list.add_georeferenced_map(map("b", "https://example.org/iiif/shared", 0.0)).unwrap();

        let viewport = Viewport::new((256, 256), Point::new(1.0, -0.75), 0.01, 0.0).unwrap();
        let selection = select_tiles(&list, &viewport, LEVEL_TOLERANCE);
        assert_eq!(selection.maps.len(), 2);
        let per_map = selection.maps[0].tiles.len();
        assert_eq!(selection.unique_tiles().len(), per_map);
        assert_eq!(selection.keys().len(), per_map);
    }

    #[test]
    fn test_maps_outside_viewport_are_skipped() {
        let mut list = WarpedMapList::default();
        list.add_georeferenced_map(map("a", "https://example.org/iiif/a", 0.0)).unwrap();
        list.add_georeferenced_map(map("far", "https://example.org/iiif/far", 100.0)).unwrap();

        let viewport = Viewport::new((256, 256), Point::new(1.0, -0.75), 0.01, 0.0).unwrap();
        let selection = select_tiles(&list, &viewport, LEVEL_TOLERANCE);
        assert!(selection.for_map(&MapId::new("a")).is_some());
        assert!(selection.for_map(&MapId::new("far")).is_none());
    }

    /// Stretches the image strongly toward its right edge.
    struct CubicBuilder;

    impl TransformerBuilder for CubicBuilder {
        fn build(
            &self,
            _gcps: &[Gcp],
            _kind: TransformationType,
        ) -> Result<Arc<dyn Transformer>, TransformError> {
            Ok(Arc::new(FnTransformer(|p: Point| {
                let u = p.x / 1000.0;
                Ok(Point::new(u * u * u + 0.01 * u, -p.y / 1000.0))
            })))
        }
    }

    #[test]
    fn test_zoom_in_never_coarsens_under_nonlinear_transform() {
        let mut list = WarpedMapList::new(
            Arc::new(CubicBuilder),
            Arc::new(IiifResolver::default()),
            DEFAULT_MESH_DENSITY,
            EventBus::new(),
        );
        let resource = Resource {
            id: "https://example.org/iiif/cubic".to_string(),
            width: 4000,
            height: 4000,
        };
        let gcps = vec![Gcp::new((0.0, 0.0), (0.0, 0.0)), Gcp::new((4000.0, 4000.0), (64.04, -4.0))];
        list.add_georeferenced_map(GeoreferencedMap::new(
            "cubic",
            resource,
            gcps,
            GeoreferencedMap::full_image_mask(4000, 4000),
        ))
        .unwrap();
        let map_id = MapId::new("cubic");

        for cx in [0.05, 0.15, 0.3, 0.6, 1.0, 2.0] {
            let mut viewport = Viewport::new((256, 256), Point::new(cx, -2.0), 0.05, 0.0).unwrap();
            let mut previous = u32::MAX;
            for _ in 0..60 {
                let selection = select_tiles(&list, &viewport, LEVEL_TOLERANCE);
                let sf = selection.for_map(&map_id).unwrap().zoom_level.scale_factor;
                assert!(
                    sf <= previous,
                    "cx={} res={}: scale factor grew from {} to {}",
                    cx,
                    viewport.resolution,
                    previous,
                    sf
                );
                previous = sf;
                viewport = viewport.zoomed(1.05).unwrap();
            }
        }
    }
}
