//! Engine events and the channel based event bus

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::map::georef::MapId;

/// Events emitted by the map list, the tile cache and the renderer.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    WarpedMapAdded(MapId),
    WarpedMapRemoved(MapId),
    ZIndicesChanged,
    TileLoaded { key: String, map_ids: Vec<MapId> },
    TileRemoved { key: String },
    /// `error` is always [`Error::TileFetch`]
    TileLoadingError { key: String, error: Error },
    AllTilesLoaded,
    /// Render options or geometry of a map changed
    Changed(MapId),
}

/// Fan-out of [`Event`]s to any number of subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: Event) {
        log::trace!("event {:?}", event);
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Event>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_prune() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(Event::ZIndicesChanged);
        assert_eq!(a.try_recv(), Ok(Event::ZIndicesChanged));
        assert_eq!(b.try_recv(), Ok(Event::ZIndicesChanged));

        drop(b);
        bus.emit(Event::AllTilesLoaded);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_recv(), Ok(Event::AllTilesLoaded));
    }
}
