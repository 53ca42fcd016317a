//! Tile fetching: cancellation tokens, fetchers, decoders and the worker pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use log::debug;

use super::cache::CacheableTile;

pub const DEFAULT_USER_AGENT: &str = concat!("mapwarp-engine/", env!("CARGO_PKG_VERSION"));

/// Shared flag telling a fetch to stop as soon as it can.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Retrieves the raw bytes behind a tile URL.
///
/// Implementations should check `cancel` while transferring and give up
/// early once it is set. Whatever they return after cancellation is dropped.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, cancel: &CancelToken) -> anyhow::Result<Vec<u8>>;
}

/// Turns fetched bytes into tile data.
pub trait TileDecoder: Send + Sync {
    type Output: Send + Sync + 'static;

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Self::Output>;
}

/// Decodes PNG and JPEG tiles to RGBA8.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageDecoder;

impl TileDecoder for ImageDecoder {
    type Output = image::RgbaImage;

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<image::RgbaImage> {
        let img = image::load_from_memory(bytes)?;
        Ok(img.to_rgba8())
    }
}

/// Blocking HTTP fetcher
#[cfg(not(target_arch = "wasm32"))]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(not(target_arch = "wasm32"))]
impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: web_time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
        use anyhow::Context;
        use std::io::Read;

        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request to {} failed", url))?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }

        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if cancel.is_cancelled() {
                anyhow::bail!("fetch of {} aborted", url);
            }
            let read = response.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }
        Ok(body)
    }
}

/// Receives the progress of queued tiles. Implemented by the tile cache.
pub(crate) trait FetchSink<D>: Send + Sync {
    /// Claim a queued tile. `false` means it was aborted or replaced meanwhile.
    fn start(&self, tile: &Arc<CacheableTile<D>>) -> bool;

    fn finish(&self, tile: &Arc<CacheableTile<D>>, result: anyhow::Result<D>);
}

/// Fixed pool of fetch threads fed through a channel.
///
/// Jobs beyond the pool size wait in the channel. Dropping the loader closes
/// the channel; workers exit once they are done with their current tile.
pub struct TileLoader<D> {
    request_tx: Sender<Arc<CacheableTile<D>>>,
    _workers: Vec<JoinHandle<()>>,
}

impl<D: Send + Sync + 'static> TileLoader<D> {
    pub(crate) fn new(
        threads: usize,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn TileDecoder<Output = D>>,
        sink: Weak<dyn FetchSink<D>>,
    ) -> std::io::Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();

        let workers = (0..threads.max(1))
            .map(|i| {
                let request_rx = request_rx.clone();
                let fetcher = fetcher.clone();
                let decoder = decoder.clone();
                let sink = sink.clone();
                std::thread::Builder::new()
                    .name(format!("tile-fetch-{}", i))
                    .spawn(move || Self::worker_thread(request_rx, fetcher, decoder, sink))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            request_tx,
            _workers: workers,
        })
    }

    /// Queue a tile. Returns `false` when no worker is left to take it.
    pub(crate) fn request(&self, tile: Arc<CacheableTile<D>>) -> bool {
        self.request_tx.send(tile).is_ok()
    }

    /// Number of tiles waiting for a free worker
    pub fn queued(&self) -> usize {
        self.request_tx.len()
    }

    fn worker_thread(
        request_rx: Receiver<Arc<CacheableTile<D>>>,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn TileDecoder<Output = D>>,
        sink: Weak<dyn FetchSink<D>>,
    ) {
        while let Ok(tile) = request_rx.recv() {
            if tile.cancel_token().is_cancelled() {
                debug!("Skipping aborted tile {}", tile.key());
                continue;
            }
            let Some(sink) = sink.upgrade() else {
                break; // cache dropped
            };
            if !sink.start(&tile) {
                continue;
            }

            let result = fetcher
                .fetch(tile.key(), tile.cancel_token())
                .and_then(|bytes| decoder.decode(&bytes));
            sink.finish(&tile, result);
        }
    }
}

/// Memory used by an RGBA8 texture of the given size
pub fn tile_memory_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}
