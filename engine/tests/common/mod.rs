#![allow(dead_code)]

use std::io::Cursor;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use mapwarp_engine::map::{CancelToken, Fetcher};
use mapwarp_engine::{Gcp, GeoreferencedMap, Resource};

pub const TILE_COLOR: [u8; 4] = [90, 120, 150, 255];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory IIIF server answering every tile with a solid PNG of the requested size.
///
/// URLs containing a held pattern block until released or cancelled.
#[derive(Default)]
pub struct TestFetcher {
    calls: Mutex<Vec<String>>,
    held: Mutex<Vec<String>>,
    released: Condvar,
}

impl TestFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn holding(pattern: &str) -> Arc<Self> {
        let fetcher = Self::default();
        fetcher.held.lock().unwrap().push(pattern.to_string());
        Arc::new(fetcher)
    }

    pub fn release_all(&self) {
        self.held.lock().unwrap().clear();
        self.released.notify_all();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| u.as_str() == url).count()
    }
}

impl Fetcher for TestFetcher {
    fn fetch(&self, url: &str, cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());

        let mut held = self.held.lock().unwrap();
        while held.iter().any(|p| url.contains(p.as_str())) && !cancel.is_cancelled() {
            held = self.released.wait_timeout(held, Duration::from_millis(5)).unwrap().0;
        }
        drop(held);
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        if url.contains("missing") {
            anyhow::bail!("HTTP 404 Not Found");
        }

        let (width, height) = requested_size(url)?;
        let tile = image::RgbaImage::from_pixel(width, height, image::Rgba(TILE_COLOR));
        let mut png = Vec::new();
        tile.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        Ok(png)
    }
}

/// Size segment of `{id}/{region}/{w},{h}/0/default.{format}`
fn requested_size(url: &str) -> anyhow::Result<(u32, u32)> {
    let segments: Vec<&str> = url.rsplit('/').collect();
    let size = segments
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("no size in {}", url))?;
    let (w, h) = size
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("bad size {}", size))?;
    Ok((w.parse()?, h.parse()?))
}

/// 2000x1500 map, rotated by 0.1 rad, 1e-4 geo units per pixel, three GCPs.
pub fn rotated_map(id: &str, resource_id: &str) -> GeoreferencedMap {
    let (sin, cos) = 0.1f64.sin_cos();
    let s = 1e-4;
    let geo = |x: f64, y: f64| (10.0 + s * (x * cos + y * sin), 50.0 + s * (x * sin - y * cos));
    GeoreferencedMap::new(
        id,
        Resource {
            id: resource_id.to_string(),
            width: 2000,
            height: 1500,
        },
        vec![
            Gcp::new((0.0, 0.0), geo(0.0, 0.0)),
            Gcp::new((2000.0, 0.0), geo(2000.0, 0.0)),
            Gcp::new((0.0, 1500.0), geo(0.0, 1500.0)),
        ],
        GeoreferencedMap::full_image_mask(2000, 1500),
    )
}
