//! Dispatch configuration.
//!
//! All tunables in one place, deserializable from a JSON config file.
//! Defaults match the production values the system was tuned for.

use serde::Deserialize;

/// Default absolute TTL for ephemeral position records (seconds).
pub const DEFAULT_POSITION_TTL_SECS: u64 = 300;

/// Default offer time-to-live (seconds).
pub const DEFAULT_OFFER_TTL_SECS: u64 = 15;

/// Default interval between location sync runs (seconds).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// Default maximum ring distance for nearby-driver searches.
pub const DEFAULT_MAX_RINGS: u32 = 5;

/// Default routing provider timeout (milliseconds).
pub const DEFAULT_ROUTING_TIMEOUT_MS: u64 = 5_000;

/// Default per-call timeout for durable store operations (milliseconds).
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Assumed average city speed used for ETA fallback when routing fails.
pub const DEFAULT_ASSUMED_SPEED_KMH: f64 = 30.0;

/// Per-channel outbound queue depth; exceeding it closes the channel.
pub const DEFAULT_EGRESS_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    /// H3 resolution for the spatial index. The codec is compiled for
    /// resolution 9; startup fails on a mismatch rather than silently
    /// indexing at the wrong granularity.
    pub cell_resolution: u8,
    pub position_ttl_seconds: u64,
    pub offer_ttl_seconds: u64,
    pub sync_interval_seconds: u64,
    pub max_rings: u32,
    pub min_candidates: usize,
    pub routing_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub assumed_speed_kmh: f64,
    pub egress_queue_capacity: usize,
    pub access_token_secret: String,
    pub refresh_token_secret: String,
    pub durable_store_dsn: String,
    pub ephemeral_store_dsn: String,
    /// OSRM-compatible routing endpoint; empty disables HTTP routing and
    /// every ETA falls back to the haversine heuristic.
    pub routing_endpoint: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cell_resolution: 9,
            position_ttl_seconds: DEFAULT_POSITION_TTL_SECS,
            offer_ttl_seconds: DEFAULT_OFFER_TTL_SECS,
            sync_interval_seconds: DEFAULT_SYNC_INTERVAL_SECS,
            max_rings: DEFAULT_MAX_RINGS,
            min_candidates: 1,
            routing_timeout_ms: DEFAULT_ROUTING_TIMEOUT_MS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            assumed_speed_kmh: DEFAULT_ASSUMED_SPEED_KMH,
            egress_queue_capacity: DEFAULT_EGRESS_QUEUE_CAPACITY,
            access_token_secret: String::new(),
            refresh_token_secret: String::new(),
            durable_store_dsn: String::new(),
            ephemeral_store_dsn: String::new(),
            routing_endpoint: String::new(),
        }
    }
}

impl DispatchConfig {
    pub fn position_ttl_ms(&self) -> u64 {
        self.position_ttl_seconds * 1_000
    }

    pub fn offer_ttl_ms(&self) -> u64 {
        self.offer_ttl_seconds * 1_000
    }
}
