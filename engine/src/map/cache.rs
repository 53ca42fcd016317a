//! Shared tile cache with fetch deduplication, cancellation and LRU eviction

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use web_time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};

use super::georef::MapId;
use super::loader::{CancelToken, FetchSink, Fetcher, TileDecoder, TileLoader};
use super::raster::TileTexture;
use super::tile::{FetchableTile, TileKey};

pub const DEFAULT_MAX_TILES: usize = 512;
pub const DEFAULT_MAX_MEMORY: usize = 256 * 1024 * 1024;

/// Lifecycle of a cached tile.
///
/// `Pending -> Fetching -> Fetched | Error`, and `Pending | Fetching -> Aborted`.
/// Terminal tiles never change again; a new need creates a new tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TileState {
    Pending,
    Fetching,
    Fetched,
    Error,
    Aborted,
}

impl TileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TileState::Fetched | TileState::Error | TileState::Aborted)
    }

    fn is_in_flight(self) -> bool {
        matches!(self, TileState::Pending | TileState::Fetching)
    }
}

struct Slot<D> {
    state: TileState,
    data: Option<Arc<D>>,
    error: Option<Error>,
}

/// A tile in the cache together with its fetch state and decoded data.
pub struct CacheableTile<D> {
    fetchable: FetchableTile,
    cancel: CancelToken,
    created_at: Instant,
    slot: Mutex<Slot<D>>,
}

impl<D> CacheableTile<D> {
    fn new(fetchable: FetchableTile) -> Self {
        Self {
            fetchable,
            cancel: CancelToken::new(),
            created_at: Instant::now(),
            slot: Mutex::new(Slot {
                state: TileState::Pending,
                data: None,
                error: None,
            }),
        }
    }

    pub fn fetchable(&self) -> &FetchableTile {
        &self.fetchable
    }

    pub fn key(&self) -> &str {
        self.fetchable.key()
    }

    pub fn state(&self) -> TileState {
        self.lock().state
    }

    /// Decoded tile, once fetched
    pub fn data(&self) -> Option<Arc<D>> {
        self.lock().data.clone()
    }

    /// Why the tile holds no data: `TileFetch` once failed, `Aborted` once cancelled.
    pub fn error(&self) -> Option<Error> {
        let slot = self.lock();
        match slot.state {
            TileState::Aborted => Some(Error::Aborted {
                key: self.key().to_string(),
            }),
            _ => slot.error.clone(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn set_state(&self, state: TileState) {
        self.lock().state = state;
    }

    fn abort(&self) {
        self.cancel.cancel();
        self.set_state(TileState::Aborted);
    }

    fn lock(&self) -> MutexGuard<'_, Slot<D>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<D> std::fmt::Debug for CacheableTile<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheableTile")
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

struct Entry<D> {
    tile: Arc<CacheableTile<D>>,
    /// Maps that requested this tile
    referrers: HashSet<MapId>,
    memory_size: usize,
}

struct Inner<D> {
    entries: HashMap<TileKey, Entry<D>>,
    /// Fetched keys, least recently used first
    access_order: Vec<TileKey>,
    current_memory: usize,
    max_tiles: usize,
    max_memory: usize,
}

impl<D> Inner<D> {
    fn is_current(&self, tile: &Arc<CacheableTile<D>>) -> bool {
        self.entries
            .get(tile.key())
            .is_some_and(|entry| Arc::ptr_eq(&entry.tile, tile))
    }

    fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.tile.state().is_in_flight())
            .count()
    }

    fn fetched(&self) -> usize {
        self.access_order.len()
    }

    /// Remove `key`, aborting it when still in flight.
    fn evict(&mut self, key: &str, events: &mut Vec<Event>) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        match entry.tile.state() {
            TileState::Pending | TileState::Fetching => {
                entry.tile.abort();
                log::debug!("Aborted tile {}", key);
            }
            TileState::Fetched => {
                self.current_memory -= entry.memory_size;
                self.access_order.retain(|k| k != key);
                events.push(Event::TileRemoved {
                    key: key.to_string(),
                });
                log::debug!("Evicted tile {}", key);
            }
            TileState::Error | TileState::Aborted => {}
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            let key = self.access_order.remove(pos);
            self.access_order.push(key);
        }
    }

    /// Evict least recently used fetched tiles until the bounds hold, never `keep`.
    fn enforce_bounds(&mut self, keep: &str, events: &mut Vec<Event>) {
        while self.fetched() > self.max_tiles || self.current_memory > self.max_memory {
            let Some(oldest) = self.access_order.iter().find(|k| k.as_str() != keep).cloned() else {
                break;
            };
            self.evict(&oldest, events);
        }
    }
}

struct Shared<D> {
    inner: Mutex<Inner<D>>,
    changed: Condvar,
    events: EventBus,
}

impl<D> Shared<D> {
    fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

impl<D: TileTexture + Send + Sync + 'static> FetchSink<D> for Shared<D> {
    fn start(&self, tile: &Arc<CacheableTile<D>>) -> bool {
        let inner = self.lock();
        if inner.is_current(tile) && tile.state() == TileState::Pending {
            tile.set_state(TileState::Fetching);
            true
        } else {
            false
        }
    }

    fn finish(&self, tile: &Arc<CacheableTile<D>>, result: anyhow::Result<D>) {
        let mut events = Vec::new();
        let mut inner = self.lock();
        if !inner.is_current(tile) || tile.state() != TileState::Fetching {
            if let Some(aborted) = tile.error() {
                log::debug!("Discarding result: {}", aborted);
            } else {
                log::debug!("Discarding stale result for tile {}", tile.key());
            }
            return;
        }

        let key = tile.key().to_string();
        match result {
            Ok(data) => {
                let memory_size = data.byte_size();
                {
                    let mut slot = tile.lock();
                    slot.data = Some(Arc::new(data));
                    slot.state = TileState::Fetched;
                }
                let mut map_ids = Vec::new();
                if let Some(entry) = inner.entries.get_mut(&key) {
                    entry.memory_size = memory_size;
                    map_ids = entry.referrers.iter().cloned().collect();
                }
                map_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                inner.current_memory += memory_size;
                inner.access_order.push(key.clone());
                log::debug!(
                    "Loaded tile {} ({} bytes) in {:?}",
                    key,
                    memory_size,
                    tile.created_at().elapsed()
                );
                events.push(Event::TileLoaded {
                    key: key.clone(),
                    map_ids,
                });
                inner.enforce_bounds(&key, &mut events);
            }
            Err(err) => {
                let error = Error::TileFetch {
                    key: key.clone(),
                    reason: format!("{:#}", err),
                };
                log::warn!("{}", error);
                {
                    let mut slot = tile.lock();
                    slot.error = Some(error.clone());
                    slot.state = TileState::Error;
                }
                inner.entries.remove(&key);
                events.push(Event::TileLoadingError { key, error });
            }
        }

        if inner.in_flight() == 0 {
            events.push(Event::AllTilesLoaded);
        }
        // published before waking barrier waiters so they observe the events
        self.publish(events);
        drop(inner);
        self.changed.notify_all();
    }
}

/// Statistics snapshot of a [`TileCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub tile_count: usize,
    pub in_flight: usize,
    pub max_tiles: usize,
    pub memory_used: usize,
    pub max_memory: usize,
}

impl CacheStats {
    pub fn memory_usage_percent(&self) -> f32 {
        if self.max_memory == 0 {
            0.0
        } else {
            (self.memory_used as f32 / self.max_memory as f32) * 100.0
        }
    }

    pub fn tile_usage_percent(&self) -> f32 {
        if self.max_tiles == 0 {
            0.0
        } else {
            (self.tile_count as f32 / self.max_tiles as f32) * 100.0
        }
    }
}

/// Key to tile map shared by every map and every frame.
///
/// At most one entry exists per key and a key is never fetched twice at the
/// same time. Fetched tiles are bounded by count and decoded bytes.
pub struct TileCache<D> {
    shared: Arc<Shared<D>>,
    loader: TileLoader<D>,
}

impl<D: TileTexture + Send + Sync + 'static> TileCache<D> {
    /// - max_tiles: fetched tiles kept before LRU eviction
    /// - max_memory: decoded bytes kept before LRU eviction
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn TileDecoder<Output = D>>,
        max_concurrent_fetches: usize,
        max_tiles: usize,
        max_memory: usize,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                access_order: Vec::with_capacity(max_tiles.min(4096)),
                current_memory: 0,
                max_tiles,
                max_memory,
            }),
            changed: Condvar::new(),
            events,
        });
        let sink: Weak<dyn FetchSink<D>> = Arc::downgrade(&shared) as Weak<dyn FetchSink<D>>;
        let loader = TileLoader::new(max_concurrent_fetches, fetcher, decoder, sink)?;
        Ok(Self { shared, loader })
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Tile for `fetchable`, starting a fetch unless one is pending, running or done.
    pub fn request(&self, fetchable: &FetchableTile) -> Arc<CacheableTile<D>> {
        let mut inner = self.shared.lock();
        let key = fetchable.key();

        if let Some(entry) = inner.entries.get_mut(key) {
            let state = entry.tile.state();
            if state.is_in_flight() || state == TileState::Fetched {
                entry.referrers.insert(fetchable.map_id.clone());
                let tile = entry.tile.clone();
                if state == TileState::Fetched {
                    inner.touch(key);
                }
                return tile;
            }
        }

        let tile = Arc::new(CacheableTile::new(fetchable.clone()));
        inner.entries.insert(
            key.to_string(),
            Entry {
                tile: tile.clone(),
                referrers: HashSet::from([fetchable.map_id.clone()]),
                memory_size: 0,
            },
        );
        drop(inner);

        log::debug!("Requesting tile {}", key);
        if !self.loader.request(tile.clone()) {
            log::warn!("No fetch worker left for tile {}", key);
            let mut inner = self.shared.lock();
            inner.entries.remove(key);
            tile.abort();
        }
        tile
    }

    /// Abort or evict every tile whose key is not in `needed`.
    pub fn cancel_unneeded(&self, needed: &HashSet<String>) {
        let mut events = Vec::new();
        let mut inner = self.shared.lock();
        let unneeded: Vec<TileKey> = inner
            .entries
            .keys()
            .filter(|key| !needed.contains(*key))
            .cloned()
            .collect();
        for key in &unneeded {
            inner.evict(key, &mut events);
        }
        drop(inner);
        if !unneeded.is_empty() {
            self.shared.changed.notify_all();
        }
        self.shared.publish(events);
    }

    /// Block until every key is terminal or absent, at most `timeout`.
    pub fn all_requested<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a String> + Clone,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        loop {
            let pending = keys
                .clone()
                .into_iter()
                .filter(|key| {
                    inner
                        .entries
                        .get(key.as_str())
                        .is_some_and(|entry| entry.tile.state().is_in_flight())
                })
                .count();
            if pending == 0 {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::BarrierTimeout { pending });
            }
            inner = match self.shared.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Drop `map_id` as a referrer; tiles nobody refers to any more are released.
    pub fn release_map(&self, map_id: &MapId) {
        let mut events = Vec::new();
        let mut inner = self.shared.lock();
        let orphaned: Vec<TileKey> = inner
            .entries
            .iter_mut()
            .filter_map(|(key, entry)| {
                entry.referrers.remove(map_id);
                entry.referrers.is_empty().then(|| key.clone())
            })
            .collect();
        for key in &orphaned {
            inner.evict(key, &mut events);
        }
        drop(inner);
        if !orphaned.is_empty() {
            log::debug!("Released {} tiles of map {}", orphaned.len(), map_id);
            self.shared.changed.notify_all();
        }
        self.shared.publish(events);
    }

    /// Current tile for `key`, marking it recently used.
    pub fn get(&self, key: &str) -> Option<Arc<CacheableTile<D>>> {
        let mut inner = self.shared.lock();
        let tile = inner.entries.get(key).map(|entry| entry.tile.clone())?;
        if tile.state() == TileState::Fetched {
            inner.touch(key);
        }
        Some(tile)
    }

    /// Get a tile without updating access order
    pub fn peek(&self, key: &str) -> Option<Arc<CacheableTile<D>>> {
        self.shared.lock().entries.get(key).map(|entry| entry.tile.clone())
    }

    pub fn status(&self, key: &str) -> Option<TileState> {
        self.peek(key).map(|tile| tile.state())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    /// All current tiles, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<CacheableTile<D>>> {
        self.shared
            .lock()
            .entries
            .values()
            .map(|entry| entry.tile.clone())
            .collect()
    }

    /// Maps currently referring to `key`
    pub fn referrers(&self, key: &str) -> Vec<MapId> {
        self.shared
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.referrers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Abort everything in flight and drop all tiles.
    pub fn clear(&self) {
        self.cancel_unneeded(&HashSet::new());
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.lock();
        CacheStats {
            tile_count: inner.fetched(),
            in_flight: inner.in_flight(),
            max_tiles: inner.max_tiles,
            memory_used: inner.current_memory,
            max_memory: inner.max_memory,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }

    /// Tiles waiting for a free fetch worker
    pub fn queued(&self) -> usize {
        self.loader.queued()
    }
}

impl<D> Drop for TileCache<D> {
    fn drop(&mut self) {
        let inner = self.shared.lock();
        for entry in inner.entries.values() {
            entry.tile.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::image_info::{IiifImage, ImageInfo};
    use crate::map::raster::RasterBuffer;
    use crate::map::tile::Tile;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::Receiver;

    /// Serves a 1x1 tile after the gate opens, or fails for URLs containing "fail".
    struct GatedFetcher {
        open: Mutex<bool>,
        opened: Condvar,
        calls: AtomicUsize,
    }

    impl GatedFetcher {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(open),
                opened: Condvar::new(),
                calls: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl Fetcher for GatedFetcher {
        fn fetch(&self, url: &str, cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open && !cancel.is_cancelled() {
                open = self.opened.wait_timeout(open, Duration::from_millis(5)).unwrap().0;
            }
            if url.contains("fail") {
                anyhow::bail!("HTTP 404 Not Found");
            }
            Ok(vec![1, 2, 3, 255])
        }
    }

    struct RawDecoder;

    impl TileDecoder for RawDecoder {
        type Output = RasterBuffer;

        fn decode(&self, bytes: &[u8]) -> anyhow::Result<RasterBuffer> {
            RasterBuffer::from_rgba(1, 1, bytes.to_vec())
                .ok_or_else(|| anyhow::anyhow!("expected a single RGBA pixel"))
        }
    }

    fn cache(fetcher: Arc<GatedFetcher>, max_tiles: usize) -> (TileCache<RasterBuffer>, Receiver<Event>) {
        bounded_cache(fetcher, max_tiles, usize::MAX)
    }

    fn bounded_cache(
        fetcher: Arc<GatedFetcher>,
        max_tiles: usize,
        max_memory: usize,
    ) -> (TileCache<RasterBuffer>, Receiver<Event>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let cache = TileCache::new(fetcher, Arc::new(RawDecoder), 4, max_tiles, max_memory, events).unwrap();
        (cache, rx)
    }

    fn fetchable(map_id: &str, image: &str, column: u32) -> FetchableTile {
        let image = IiifImage::with_default_pyramid(image, 2048, 256, 256);
        let level = image.tile_zoom_levels()[0];
        FetchableTile::new(MapId::new(map_id), Tile::new(level, column, 0), &image)
    }

    fn wait(cache: &TileCache<RasterBuffer>, keys: &[String]) {
        cache.all_requested(keys, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_duplicate_requests_share_one_fetch() {
        let fetcher = GatedFetcher::new(false);
        let (cache, _rx) = cache(fetcher.clone(), 16);
        let tile = fetchable("a", "img", 0);

        let first = cache.request(&tile);
        let second = cache.request(&fetchable("b", "img", 0));
        assert!(Arc::ptr_eq(&first, &second));

        fetcher.open();
        wait(&cache, &[tile.tile_url.clone()]);
        let third = cache.request(&tile);
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.state(), TileState::Fetched);
        assert_eq!(cache.referrers(tile.key()).len(), 2);
    }

    #[test]
    fn test_cancel_unneeded_aborts_silently() {
        let fetcher = GatedFetcher::new(false);
        let (cache, rx) = cache(fetcher.clone(), 16);
        let tile = cache.request(&fetchable("a", "img", 1));

        cache.cancel_unneeded(&HashSet::new());
        assert_eq!(tile.state(), TileState::Aborted);
        assert!(tile.cancel_token().is_cancelled());
        assert!(!cache.contains(tile.key()));
        assert_eq!(
            tile.error(),
            Some(Error::Aborted {
                key: tile.key().to_string()
            })
        );

        fetcher.open();
        cache.all_requested(&[tile.key().to_string()], Duration::from_millis(50)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tile.state(), TileState::Aborted);
        assert!(rx.try_iter().all(|event| !matches!(event, Event::TileLoadingError { .. })));
    }

    #[test]
    fn test_fetch_error_is_reported_and_removed() {
        let (cache, rx) = cache(GatedFetcher::new(true), 16);
        let fetchable = fetchable("a", "fail", 0);
        let tile = cache.request(&fetchable);
        wait(&cache, &[fetchable.tile_url.clone()]);

        assert_eq!(tile.state(), TileState::Error);
        let error = tile.error().unwrap();
        assert!(matches!(&error, Error::TileFetch { key, reason } if key == &fetchable.tile_url && reason.contains("404")));
        assert!(!cache.contains(fetchable.key()));
        let events: Vec<Event> = rx.try_iter().collect();
        assert!(events.contains(&Event::TileLoadingError {
            key: fetchable.tile_url.clone(),
            error,
        }));
        assert!(events.contains(&Event::AllTilesLoaded));

        // no retry of the failed object, a new need creates a new tile
        let again = cache.request(&fetchable);
        assert!(!Arc::ptr_eq(&tile, &again));
        assert!(again.created_at() >= tile.created_at());
    }

    #[test]
    fn test_barrier_times_out_with_pending_count() {
        let fetcher = GatedFetcher::new(false);
        let (cache, _rx) = cache(fetcher.clone(), 16);
        let keys: Vec<String> = (0..3)
            .map(|c| cache.request(&fetchable("a", "img", c)).key().to_string())
            .collect();

        let result = cache.all_requested(&keys, Duration::from_millis(30));
        assert_eq!(result, Err(Error::BarrierTimeout { pending: 3 }));

        fetcher.open();
        wait(&cache, &keys);
        assert_eq!(cache.stats().tile_count, 3);
    }

    #[test]
    fn test_lru_bound_evicts_oldest_fetched() {
        let (cache, rx) = cache(GatedFetcher::new(true), 2);
        let mut keys = Vec::new();
        for column in 0..3 {
            let fetchable = fetchable("a", "img", column);
            cache.request(&fetchable);
            wait(&cache, &[fetchable.tile_url.clone()]);
            keys.push(fetchable.tile_url);
        }

        assert_eq!(cache.stats().tile_count, 2);
        assert!(!cache.contains(&keys[0]));
        assert!(cache.contains(&keys[2]));
        assert_eq!(cache.stats().memory_used, 8);
        assert!(rx.try_iter().any(|e| e == Event::TileRemoved { key: keys[0].clone() }));
    }

    #[test]
    fn test_release_map_keeps_shared_tiles() {
        let fetcher = GatedFetcher::new(false);
        let (cache, _rx) = cache(fetcher.clone(), 16);
        let shared = cache.request(&fetchable("a", "img", 0));
        cache.request(&fetchable("b", "img", 0));
        let own = cache.request(&fetchable("a", "img", 1));

        cache.release_map(&MapId::new("a"));
        assert_eq!(own.state(), TileState::Aborted);
        assert!(cache.contains(shared.key()));
        assert_eq!(cache.referrers(shared.key()), vec![MapId::new("b")]);

        fetcher.open();
        wait(&cache, &[shared.key().to_string()]);
        assert_eq!(shared.state(), TileState::Fetched);
    }

    #[test]
    fn test_memory_bound_evicts_oldest_fetched() {
        // every tile decodes to one RGBA pixel, so two tiles fit
        let (cache, rx) = bounded_cache(GatedFetcher::new(true), 1024, 8);
        let mut keys = Vec::new();
        for column in 0..3 {
            let fetchable = fetchable("a", "img", column);
            cache.request(&fetchable);
            wait(&cache, &[fetchable.tile_url.clone()]);
            keys.push(fetchable.tile_url);
            assert!(cache.stats().memory_used <= 8);
        }

        assert!(!cache.contains(&keys[0]));
        assert!(cache.contains(&keys[1]));
        assert!(cache.contains(&keys[2]));
        assert_eq!(cache.stats().tile_count, 2);
        assert_eq!(cache.stats().memory_used, 8);
        let removed: Vec<Event> = rx
            .try_iter()
            .filter(|e| matches!(e, Event::TileRemoved { .. }))
            .collect();
        assert_eq!(removed, vec![Event::TileRemoved { key: keys[0].clone() }]);
    }

    #[test]
    fn test_memory_bound_never_evicts_tile_in_its_own_completion() {
        // bound smaller than a single tile
        let (cache, rx) = bounded_cache(GatedFetcher::new(true), 1024, 2);
        let first = fetchable("a", "img", 0);
        let tile = cache.request(&first);
        wait(&cache, &[first.tile_url.clone()]);
        assert_eq!(tile.state(), TileState::Fetched);
        assert!(cache.contains(first.key()));
        assert!(tile.data().is_some());

        let second = fetchable("a", "img", 1);
        cache.request(&second);
        wait(&cache, &[second.tile_url.clone()]);
        assert!(!cache.contains(first.key()));
        assert!(cache.contains(second.key()));
        assert_eq!(cache.stats().memory_used, 4);
        // the evicted tile keeps its decoded data for frames still holding it
        assert!(tile.data().is_some());
        assert!(rx.try_iter().any(|e| e == Event::TileRemoved { key: first.tile_url.clone() }));
    }
}
