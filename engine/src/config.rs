//! Engine configuration defaults and environment overrides

use web_time::Duration;

use crate::map::cache::{DEFAULT_MAX_MEMORY, DEFAULT_MAX_TILES};
use crate::map::loader::DEFAULT_USER_AGENT;
use crate::map::selection::LEVEL_TOLERANCE;
use crate::map::warped_map::DEFAULT_MESH_DENSITY;

pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 6;
pub const DEFAULT_BARRIER_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Engine tuning knobs.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub mesh_density: u32,
    pub max_tiles: usize,
    /// Decoded tile bytes kept in the cache
    pub max_memory: usize,
    pub max_concurrent_fetches: usize,
    /// Longest a frame waits for its tiles before drawing what is ready
    pub barrier_timeout: Duration,
    pub fetch_timeout: Duration,
    pub user_agent: String,
    pub level_tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mesh_density: DEFAULT_MESH_DENSITY,
            max_tiles: DEFAULT_MAX_TILES,
            max_memory: DEFAULT_MAX_MEMORY,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            barrier_timeout: Duration::from_millis(DEFAULT_BARRIER_TIMEOUT_MS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            level_tolerance: LEVEL_TOLERANCE,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MAPWARP_*` environment variables.
    ///
    /// Unparsable or non-positive values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            mesh_density: positive(&lookup, "MAPWARP_MESH_DENSITY").unwrap_or(defaults.mesh_density),
            max_tiles: positive(&lookup, "MAPWARP_MAX_TILES").unwrap_or(defaults.max_tiles),
            max_memory: positive::<usize>(&lookup, "MAPWARP_MAX_MEMORY_MB")
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(defaults.max_memory),
            max_concurrent_fetches: positive(&lookup, "MAPWARP_MAX_CONCURRENT_FETCHES")
                .unwrap_or(defaults.max_concurrent_fetches),
            barrier_timeout: positive(&lookup, "MAPWARP_BARRIER_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.barrier_timeout),
            fetch_timeout: positive(&lookup, "MAPWARP_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            user_agent: lookup("MAPWARP_USER_AGENT")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.user_agent),
            level_tolerance: lookup("MAPWARP_LEVEL_TOLERANCE")
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value >= 0.0)
                .unwrap_or(defaults.level_tolerance),
        }
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}
