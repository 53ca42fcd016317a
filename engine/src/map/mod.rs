//! Warped maps, tile selection, caching and compositing

pub mod cache;
pub mod effects;
pub mod georef;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod image_info;
pub mod list;
pub mod loader;
pub mod mesh;
pub mod raster;
pub mod renderer;
pub mod selection;
pub mod tile;
pub mod transform;
pub mod viewport;
pub mod warped_map;

pub use cache::{CacheStats, CacheableTile, TileCache, TileState};
pub use effects::{Colorize, RemoveBackground, RenderOptions};
pub use georef::{Gcp, GeoreferencedMap, MapId, Resource, TransformationType};
#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;
pub use image_info::{IiifImage, IiifResolver, ImageInfo, ImageInfoResolver, ImageRequest, TileZoomLevel};
pub use list::WarpedMapList;
#[cfg(not(target_arch = "wasm32"))]
pub use loader::HttpFetcher;
pub use loader::{CancelToken, Fetcher, ImageDecoder, TileDecoder};
pub use raster::{RasterBuffer, SoftwareBackend, TileTexture};
pub use renderer::{CanvasMesh, CompositeBackend, PlacedTile, Renderer};
pub use selection::{select_tiles, TileSelection};
pub use tile::{FetchableTile, Tile, TileKey};
pub use transform::{AffineTransformerBuilder, Transformer, TransformerBuilder};
pub use viewport::{FitMode, Viewport};
pub use warped_map::WarpedMap;
