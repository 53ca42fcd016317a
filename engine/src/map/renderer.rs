//! Frame orchestration: tile selection, fetching, barrier and compositing

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use web_time::Instant;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::geometry::{Point, Ring};

use super::cache::TileCache;
use super::effects::RenderOptions;
use super::georef::{Gcp, GeoreferencedMap, MapId, TransformationType};
use super::image_info::{IiifResolver, ImageInfoResolver, Region};
use super::list::WarpedMapList;
use super::loader::{Fetcher, TileDecoder};
use super::raster::{RasterBuffer, TileTexture};
use super::selection::{select_tiles, TileSelection};
use super::tile::Tile;
use super::transform::{AffineTransformerBuilder, TransformerBuilder};
use super::viewport::Viewport;
use super::warped_map::WarpedMap;

/// Mesh of one map projected onto the canvas.
///
/// `canvas_points` and `resource_points` are parallel; only triangles that
/// touch the canvas are kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanvasMesh {
    pub canvas_points: Vec<Point>,
    pub resource_points: Vec<Point>,
    pub triangles: Vec<[u32; 3]>,
}

impl CanvasMesh {
    pub fn new(map: &WarpedMap, viewport: &Viewport) -> Self {
        let canvas_points: Vec<Point> = map
            .geo_points()
            .iter()
            .map(|p| viewport.geo_to_canvas(*p))
            .collect();
        let (width, height) = (viewport.canvas_width as f64, viewport.canvas_height as f64);
        let triangles = map
            .mesh()
            .triangles
            .iter()
            .filter(|triangle| {
                let pts = triangle.map(|i| canvas_points[i as usize]);
                let min_x = pts.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
                let max_x = pts.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
                let min_y = pts.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
                let max_y = pts.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
                max_x > 0.0 && min_x < width && max_y > 0.0 && min_y < height
            })
            .copied()
            .collect();
        Self {
            canvas_points,
            resource_points: map.mesh().points.clone(),
            triangles,
        }
    }
}

/// A fetched tile and the resource pixels it covers.
#[derive(Debug)]
pub struct PlacedTile<D> {
    pub tile: Tile,
    pub region: Region,
    pub data: Arc<D>,
}

impl<D> Clone for PlacedTile<D> {
    fn clone(&self) -> Self {
        Self {
            tile: self.tile,
            region: self.region,
            data: self.data.clone(),
        }
    }
}

impl<D: TileTexture> PlacedTile<D> {
    /// Nearest texel at a resource pixel position, `None` outside the tile.
    pub fn sample(&self, resource: Point) -> Option<[u8; 4]> {
        let (width, height) = self.data.dimensions();
        if width == 0 || height == 0 || self.region.width == 0 || self.region.height == 0 {
            return None;
        }
        let dx = resource.x - self.region.x as f64;
        let dy = resource.y - self.region.y as f64;
        if dx < 0.0 || dy < 0.0 || dx >= self.region.width as f64 || dy >= self.region.height as f64 {
            return None;
        }
        let tx = ((dx * width as f64 / self.region.width as f64) as u32).min(width - 1);
        let ty = ((dy * height as f64 / self.region.height as f64) as u32).min(height - 1);
        Some(self.data.texel(tx, ty))
    }
}

/// Draws warped tiles into an offscreen frame.
///
/// Per frame the renderer calls `begin_frame` once, then `upload_mesh` and
/// `draw_triangles` for each map bottom to top, then `readback`.
pub trait CompositeBackend {
    fn begin_frame(&mut self, width: u32, height: u32) -> anyhow::Result<()>;

    fn upload_mesh(&mut self, mesh: &CanvasMesh) -> anyhow::Result<()>;

    /// Draw the uploaded mesh textured with `tiles`, all from one pyramid level.
    fn draw_triangles<D: TileTexture>(
        &mut self,
        tiles: &[PlacedTile<D>],
        options: &RenderOptions,
    ) -> anyhow::Result<()>;

    fn readback(&mut self) -> anyhow::Result<RasterBuffer>;
}

/// Renders a list of warped maps for arbitrary viewports.
pub struct Renderer<B, D> {
    list: WarpedMapList,
    cache: TileCache<D>,
    backend: B,
    config: EngineConfig,
    events: EventBus,
}

impl<B: CompositeBackend, D: TileTexture> Renderer<B, D> {
    pub fn new(
        backend: B,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn TileDecoder<Output = D>>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        Self::with_collaborators(
            backend,
            fetcher,
            decoder,
            Arc::new(AffineTransformerBuilder),
            Arc::new(IiifResolver::default()),
            config,
        )
    }

    pub fn with_collaborators(
        backend: B,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn TileDecoder<Output = D>>,
        transformer_builder: Arc<dyn TransformerBuilder>,
        image_info_resolver: Arc<dyn ImageInfoResolver>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new();
        let list = WarpedMapList::new(
            transformer_builder,
            image_info_resolver,
            config.mesh_density,
            events.clone(),
        );
        let cache = TileCache::new(
            fetcher,
            decoder,
            config.max_concurrent_fetches,
            config.max_tiles,
            config.max_memory,
            events.clone(),
        )?;
        Ok(Self {
            list,
            cache,
            backend,
            config,
            events,
        })
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    pub fn list(&self) -> &WarpedMapList {
        &self.list
    }

    pub fn cache(&self) -> &TileCache<D> {
        &self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add a map on top. A map with the same id is replaced and its tiles released.
    pub fn add_georeferenced_map(&mut self, map: GeoreferencedMap) -> Result<MapId> {
        let replaces = self.list.contains(&map.id);
        let map_id = self.list.add_georeferenced_map(map)?;
        if replaces {
            self.cache.release_map(&map_id);
        }
        Ok(map_id)
    }

    pub fn add_georeferenced_maps(
        &mut self,
        maps: impl IntoIterator<Item = GeoreferencedMap>,
    ) -> Vec<Result<MapId>> {
        maps.into_iter()
            .map(|map| {
                let result = self.add_georeferenced_map(map);
                if let Err(e) = &result {
                    log::warn!("Skipping map: {}", e);
                }
                result
            })
            .collect()
    }

    /// Remove a map and release the tiles only it was using.
    pub fn remove_georeferenced_map(&mut self, map_id: &MapId) -> Option<WarpedMap> {
        let removed = self.list.remove_georeferenced_map(map_id)?;
        self.cache.release_map(map_id);
        Some(removed)
    }

    pub fn set_render_options_for_map(&mut self, map_id: &MapId, options: RenderOptions) -> Result<()> {
        self.list.set_render_options_for_map(map_id, options)
    }

    pub fn set_gcps_for_map(&mut self, map_id: &MapId, gcps: Vec<Gcp>) -> Result<()> {
        self.list.set_gcps_for_map(map_id, gcps)
    }

    pub fn set_resource_mask_for_map(&mut self, map_id: &MapId, mask: Ring) -> Result<()> {
        self.list.set_resource_mask_for_map(map_id, mask)
    }

    pub fn set_transformation_for_map(
        &mut self,
        map_id: &MapId,
        transformation: TransformationType,
    ) -> Result<()> {
        self.list.set_transformation_for_map(map_id, transformation)
    }

    pub fn bring_to_front(&mut self, map_ids: &[MapId]) {
        self.list.bring_to_front(map_ids);
    }

    pub fn send_to_back(&mut self, map_ids: &[MapId]) {
        self.list.send_to_back(map_ids);
    }

    pub fn bring_forward(&mut self, map_ids: &[MapId]) {
        self.list.bring_forward(map_ids);
    }

    pub fn send_backward(&mut self, map_ids: &[MapId]) {
        self.list.send_backward(map_ids);
    }

    pub fn set_z_index(&mut self, map_id: &MapId, z_index: usize) -> Result<()> {
        self.list.set_z_index(map_id, z_index)
    }

    /// Tiles the current maps need for `viewport`, without fetching them.
    pub fn select(&self, viewport: &Viewport) -> TileSelection {
        select_tiles(&self.list, viewport, self.config.level_tolerance)
    }

    /// Render one frame.
    ///
    /// Requests every needed tile, drops tiles the viewport no longer needs,
    /// waits for the rest up to the barrier timeout and composites whatever is
    /// fetched by then. Missing tiles leave their area transparent.
    pub fn render(&mut self, viewport: &Viewport) -> Result<RasterBuffer> {
        let started = Instant::now();

        let selection = self.select(viewport);
        for map_tiles in &selection.maps {
            for tile in &map_tiles.tiles {
                self.cache.request(tile);
            }
        }
        let needed = selection.keys();
        self.cache.cancel_unneeded(&needed);

        match self.cache.all_requested(&needed, self.config.barrier_timeout) {
            Ok(()) => {}
            Err(Error::BarrierTimeout { pending }) => {
                log::warn!(
                    "{} of {} tiles not ready after {:?}, rendering partial frame",
                    pending,
                    needed.len(),
                    self.config.barrier_timeout
                );
            }
            Err(e) => return Err(e),
        }

        let (width, height) = viewport.canvas_size();
        self.backend.begin_frame(width, height).map_err(Error::backend)?;

        let mut drawn = 0;
        for map in self.list.iter() {
            let Some(map_tiles) = selection.for_map(map.id()) else {
                continue;
            };
            let placed: Vec<PlacedTile<D>> = map_tiles
                .tiles
                .iter()
                .filter_map(|fetchable| {
                    let data = self.cache.get(fetchable.key())?.data()?;
                    Some(PlacedTile {
                        tile: fetchable.tile,
                        region: fetchable.region()?,
                        data,
                    })
                })
                .collect();
            if placed.is_empty() {
                continue;
            }

            let mesh = CanvasMesh::new(map, viewport);
            if mesh.triangles.is_empty() {
                continue;
            }
            self.backend.upload_mesh(&mesh).map_err(Error::backend)?;
            self.backend
                .draw_triangles(&placed, map.render_options())
                .map_err(Error::backend)?;
            drawn += placed.len();
        }

        let frame = self.backend.readback().map_err(Error::backend)?;
        log::debug!(
            "Rendered {}x{} frame with {} tiles in {:?}",
            width,
            height,
            drawn,
            started.elapsed()
        );
        Ok(frame)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl<B: CompositeBackend> Renderer<B, image::RgbaImage> {
    /// Renderer fetching IIIF tiles over HTTP and decoding them with `image`.
    pub fn with_http(backend: B, config: EngineConfig) -> anyhow::Result<Self> {
        use super::loader::{HttpFetcher, ImageDecoder};

        let fetcher = HttpFetcher::new(&config.user_agent, config.fetch_timeout)?;
        Self::new(backend, Arc::new(fetcher), Arc::new(ImageDecoder), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::georef::Resource;
    use crate::map::image_info::TileZoomLevel;
    use crate::map::loader::CancelToken;
    use crate::map::raster::SoftwareBackend;

    /// Every tile is a single pixel whose color is picked from the URL.
    struct ColorFetcher;

    impl Fetcher for ColorFetcher {
        fn fetch(&self, url: &str, _cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
            if url.contains("red") {
                Ok(vec![255, 0, 0, 255])
            } else {
                Ok(vec![0, 0, 255, 255])
            }
        }
    }

    struct PixelDecoder;

    impl TileDecoder for PixelDecoder {
        type Output = RasterBuffer;

        fn decode(&self, bytes: &[u8]) -> anyhow::Result<RasterBuffer> {
            RasterBuffer::from_rgba(1, 1, bytes.to_vec()).ok_or_else(|| anyhow::anyhow!("bad pixel"))
        }
    }

    fn renderer() -> Renderer<SoftwareBackend, RasterBuffer> {
        Renderer::new(
            SoftwareBackend::new(),
            Arc::new(ColorFetcher),
            Arc::new(PixelDecoder),
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn square_map(id: &str, color: &str) -> GeoreferencedMap {
        GeoreferencedMap::new(
            id,
            Resource {
                id: format!("https://example.org/iiif/{}", color),
                width: 400,
                height: 400,
            },
            vec![
                Gcp::new((0.0, 0.0), (0.0, 4.0)),
                Gcp::new((400.0, 0.0), (4.0, 4.0)),
                Gcp::new((0.0, 400.0), (0.0, 0.0)),
            ],
            GeoreferencedMap::full_image_mask(400, 400),
        )
    }

    #[test]
    fn test_z_order_decides_visible_map() {
        let mut renderer = renderer();
        let bottom = renderer.add_georeferenced_map(square_map("bottom", "red")).unwrap();
        renderer.add_georeferenced_map(square_map("top", "blue")).unwrap();
        let viewport = Viewport::new((40, 40), Point::new(2.0, 2.0), 0.2, 0.0).unwrap();

        let frame = renderer.render(&viewport).unwrap();
        assert_eq!(frame.pixel(20, 20), [0, 0, 255, 255]);

        renderer.bring_to_front(&[bottom.clone()]);
        let frame = renderer.render(&viewport).unwrap();
        assert_eq!(frame.pixel(20, 20), [255, 0, 0, 255]);

        // outside both maps
        assert_eq!(frame.pixel(0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn test_hidden_map_is_not_fetched_or_drawn() {
        let mut renderer = renderer();
        let id = renderer.add_georeferenced_map(square_map("only", "red")).unwrap();
        renderer
            .set_render_options_for_map(
                &id,
                RenderOptions {
                    visible: false,
                    ..RenderOptions::default()
                },
            )
            .unwrap();
        let viewport = Viewport::new((40, 40), Point::new(2.0, 2.0), 0.2, 0.0).unwrap();

        let frame = renderer.render(&viewport).unwrap();
        assert!(frame.as_bytes().iter().all(|b| *b == 0));
        assert!(renderer.cache().is_empty());
    }

    #[test]
    fn test_replacing_map_keeps_single_entry() {
        let mut renderer = renderer();
        renderer.add_georeferenced_map(square_map("m", "red")).unwrap();
        renderer.add_georeferenced_map(square_map("m", "blue")).unwrap();
        assert_eq!(renderer.list().len(), 1);

        let viewport = Viewport::new((40, 40), Point::new(2.0, 2.0), 0.2, 0.0).unwrap();
        let frame = renderer.render(&viewport).unwrap();
        assert_eq!(frame.pixel(20, 20), [0, 0, 255, 255]);
    }

    #[test]
    fn test_placed_tile_sampling() {
        let level = TileZoomLevel::new(512, 512, 256, 256, 2);
        let mut data = RasterBuffer::new(2, 2);
        data.pixel_mut(1, 1).copy_from_slice(&[1, 2, 3, 4]);
        let placed = PlacedTile {
            tile: Tile::new(level, 0, 0),
            region: Region { x: 0, y: 0, width: 512, height: 512 },
            data: Arc::new(data),
        };
        assert_eq!(placed.sample(Point::new(300.0, 400.0)), Some([1, 2, 3, 4]));
        assert_eq!(placed.sample(Point::new(10.0, 10.0)), Some([0, 0, 0, 0]));
        assert_eq!(placed.sample(Point::new(512.0, 10.0)), None);
    }
}
