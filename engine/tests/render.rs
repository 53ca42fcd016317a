mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TILE_COLOR, TestFetcher, init_logger, rotated_map};
use mapwarp_engine::geometry::point_in_ring;
use mapwarp_engine::map::{ImageDecoder, TileState};
use mapwarp_engine::{EngineConfig, Event, MapId, Point, Renderer, SoftwareBackend, Viewport};

type TestRenderer = Renderer<SoftwareBackend, image::RgbaImage>;

fn renderer(fetcher: Arc<TestFetcher>, config: EngineConfig) -> TestRenderer {
    Renderer::new(SoftwareBackend::default(), fetcher, Arc::new(ImageDecoder), config).unwrap()
}

/// Unrotated viewport showing the whole map at one canvas pixel per image pixel.
fn native_viewport(renderer: &TestRenderer, map_id: &MapId) -> Viewport {
    let map = renderer.list().get(map_id).unwrap();
    let resolution = map.triangle_warps()[0].resource_to_geo_scale;
    let bbox = map.geo_bbox();
    let width = (bbox.width() / resolution).ceil() as u32 + 4;
    let height = (bbox.height() / resolution).ceil() as u32 + 4;
    Viewport::new((width, height), bbox.center(), resolution, 0.0).unwrap()
}

#[test]
fn test_render_rotated_map_at_native_resolution() {
    init_logger();
    let fetcher = TestFetcher::new();
    let mut renderer = renderer(fetcher.clone(), EngineConfig::default());
    let events = renderer.subscribe();

    let map_id = renderer
        .add_georeferenced_map(rotated_map("rotated", "https://iiif.test/images/rotated"))
        .unwrap();
    let viewport = native_viewport(&renderer, &map_id);

    let selection = renderer.select(&viewport);
    let tiles = &selection.for_map(&map_id).unwrap().tiles;
    assert_eq!(selection.for_map(&map_id).unwrap().zoom_level.scale_factor, 1);
    assert_eq!(tiles.len(), 48);

    let frame = renderer.render(&viewport).unwrap();
    assert_eq!((frame.width(), frame.height()), viewport.canvas_size());
    assert_eq!(fetcher.calls().len(), 48);
    for tile in tiles {
        assert_eq!(renderer.cache().status(tile.key()), Some(TileState::Fetched));
    }

    // No canvas pixel whose center lies inside the projected mask stays transparent
    let map = renderer.list().get(&map_id).unwrap();
    let canvas_mask: Vec<Point> = map
        .geo_mask()
        .iter()
        .map(|p| viewport.geo_to_canvas(*p))
        .collect();
    let mut inside = 0usize;
    for y in 0..frame.height() {
        for x in 0..frame.width() {
            let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
            if !point_in_ring(&center, &canvas_mask) {
                continue;
            }
            inside += 1;
            assert_eq!(frame.pixel(x, y), TILE_COLOR, "hole at canvas ({}, {})", x, y);
        }
    }
    // one canvas pixel per image pixel
    assert!((inside as f64 - 2000.0 * 1500.0).abs() < 2000.0 * 1500.0 * 0.01);
    // The canvas corner lies outside the rotated footprint
    assert_eq!(frame.pixel(0, 0), [0, 0, 0, 0]);

    let received: Vec<Event> = events.try_iter().collect();
    assert_eq!(received.first(), Some(&Event::WarpedMapAdded(map_id.clone())));
    let loaded = received
        .iter()
        .filter(|e| matches!(e, Event::TileLoaded { .. }))
        .count();
    assert_eq!(loaded, 48);
    let all_loaded = received
        .iter()
        .rposition(|e| *e == Event::AllTilesLoaded)
        .expect("AllTilesLoaded emitted");
    let last_loaded = received
        .iter()
        .rposition(|e| matches!(e, Event::TileLoaded { .. }))
        .unwrap();
    assert!(last_loaded < all_loaded);
}

#[test]
fn test_second_frame_reuses_cached_tiles() {
    init_logger();
    let fetcher = TestFetcher::new();
    let mut renderer = renderer(fetcher.clone(), EngineConfig::default());
    let map_id = renderer
        .add_georeferenced_map(rotated_map("rotated", "https://iiif.test/images/rotated"))
        .unwrap();
    let viewport = native_viewport(&renderer, &map_id);

    let first = renderer.render(&viewport).unwrap();
    let second = renderer.render(&viewport).unwrap();
    assert_eq!(fetcher.calls().len(), 48);
    assert_eq!(first.as_bytes(), second.as_bytes());
}

#[test]
fn test_barrier_timeout_renders_partial_frame() {
    init_logger();
    // Tile column 0, row 0 never arrives
    let fetcher = TestFetcher::holding("/0,0,256,256/");
    let config = EngineConfig {
        barrier_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let mut renderer = renderer(fetcher.clone(), config);
    let events = renderer.subscribe();
    let map_id = renderer
        .add_georeferenced_map(rotated_map("rotated", "https://iiif.test/images/rotated"))
        .unwrap();
    let viewport = native_viewport(&renderer, &map_id);

    let frame = renderer.render(&viewport).unwrap();

    let map = renderer.list().get(&map_id).unwrap();
    let pixel_at = |x: f64, y: f64| {
        let canvas = viewport.geo_to_canvas(map.transform_to_geo(Point::new(x, y)).unwrap());
        frame.pixel(canvas.x.floor() as u32, canvas.y.floor() as u32)
    };
    assert_eq!(pixel_at(100.5, 100.5), [0, 0, 0, 0]);
    assert_eq!(pixel_at(1000.5, 700.5), TILE_COLOR);

    let held = renderer
        .cache()
        .snapshot()
        .into_iter()
        .find(|tile| tile.key().contains("/0,0,256,256/"))
        .unwrap();
    assert!(matches!(held.state(), TileState::Pending | TileState::Fetching));

    // Removing the map aborts the held fetch without reporting an error
    renderer.remove_georeferenced_map(&map_id);
    assert_eq!(held.state(), TileState::Aborted);
    assert!(renderer.cache().is_empty());
    fetcher.release_all();
    std::thread::sleep(Duration::from_millis(50));
    assert!(
        !events
            .try_iter()
            .any(|e| matches!(e, Event::TileLoadingError { .. }))
    );
}

#[test]
fn test_failed_tiles_leave_map_transparent() {
    init_logger();
    let fetcher = TestFetcher::new();
    let mut renderer = renderer(fetcher, EngineConfig::default());
    let events = renderer.subscribe();
    let map_id = renderer
        .add_georeferenced_map(rotated_map("broken", "https://iiif.test/images/missing"))
        .unwrap();
    let viewport = native_viewport(&renderer, &map_id);

    let frame = renderer.render(&viewport).unwrap();
    assert!(frame.as_bytes().iter().all(|&b| b == 0));
    assert!(renderer.cache().is_empty());

    let errors = events
        .try_iter()
        .filter(|e| matches!(e, Event::TileLoadingError { .. }))
        .count();
    assert_eq!(errors, 48);
}
