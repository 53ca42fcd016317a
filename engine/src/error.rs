//! Error types for the warped map engine

use thiserror::Error;

use crate::map::transform::TransformError;

/// Errors produced by the engine.
///
/// Map construction errors are returned synchronously and the offending map
/// is never added. Tile errors are reported through events and only degrade
/// the area covered by that tile.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("map {map_id}: resource mask needs at least 3 points, got {points}")]
    InvalidGeometry { map_id: String, points: usize },

    #[error("map {map_id}: at least 2 GCPs are required, got {count}")]
    InvalidGcps { map_id: String, count: usize },

    #[error("map {map_id}: could not build transformer: {source}")]
    TransformerConstruction {
        map_id: String,
        #[source]
        source: TransformError,
    },

    #[error("map {map_id}: image info unavailable: {reason}")]
    ImageInfo { map_id: String, reason: String },

    #[error("failed to load tile {key}: {reason}")]
    TileFetch { key: String, reason: String },

    #[error("tile {key} was aborted")]
    Aborted { key: String },

    #[error("{pending} tile(s) still loading when the barrier timed out")]
    BarrierTimeout { pending: usize },

    #[error("invalid viewport: {reason}")]
    InvalidViewport { reason: String },

    #[error("no map with id {0}")]
    UnknownMap(String),

    #[error("render backend failed: {reason}")]
    Backend { reason: String },
}

impl Error {
    pub(crate) fn backend(err: anyhow::Error) -> Self {
        Error::Backend {
            reason: format!("{:#}", err),
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
