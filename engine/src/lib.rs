//! Renders georeferenced raster maps warped into any viewport.
//!
//! Maps are added to a [`Renderer`], which picks the image tiles a viewport
//! needs, fetches them through a shared cache and composites them through a
//! triangulated approximation of each map's transform.

pub mod config;
pub mod error;
pub mod events;
pub mod geometry;
pub mod map;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use geometry::{Bbox, Point, Ring};
pub use map::{
    FitMode, Gcp, GeoreferencedMap, MapId, RasterBuffer, RenderOptions, Renderer, Resource,
    SoftwareBackend, Viewport,
};
