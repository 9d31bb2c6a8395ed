//! Pluggable route providers for ETA/distance annotation.
//!
//! The routing collaborator is best-effort: a failed or slow route call
//! falls back to the haversine heuristic in the nearby query, never an
//! error. The OSRM provider talks to a `/route/v1/driving` endpoint; the
//! caching wrapper keys results by resolution-9 cell pairs so nearby
//! drivers in the same cell share one route call.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::spatial::cell_of;

/// Result of a route query between two points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEstimate {
    pub duration_secs: f64,
    pub distance_meters: f64,
}

/// Trait for routing backends. Implementations must be `Send + Sync` so the
/// provider can be shared across handlers.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Route between two `[lng, lat]` points.
    async fn route(&self, from: [f64; 2], to: [f64; 2]) -> Result<RouteEstimate>;
}

/// Minimal OSRM JSON response structures.
#[derive(Deserialize)]
struct OsrmResponse {
    code: String,
    routes: Option<Vec<OsrmRoute>>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    distance: f64, // metres
    duration: f64, // seconds
}

/// Routes via an OSRM HTTP endpoint.
pub struct OsrmRouteProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl OsrmRouteProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::RoutingUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RouteProvider for OsrmRouteProvider {
    async fn route(&self, from: [f64; 2], to: [f64; 2]) -> Result<RouteEstimate> {
        let url = format!(
            "{}/route/v1/driving/{},{};{},{}?overview=false",
            self.endpoint, from[0], from[1], to[0], to[1],
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout("routing provider".into())
            } else {
                DispatchError::RoutingUnavailable(e.to_string())
            }
        })?;

        let parsed: OsrmResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::RoutingUnavailable(e.to_string()))?;

        if parsed.code != "Ok" {
            return Err(DispatchError::RoutingUnavailable(format!(
                "OSRM returned {}",
                parsed.code
            )));
        }

        let route = parsed
            .routes
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| DispatchError::RoutingUnavailable("no route in response".into()))?;

        Ok(RouteEstimate {
            duration_secs: route.duration,
            distance_meters: route.distance,
        })
    }
}

/// Provider used when no routing endpoint is configured: every query fails
/// as unavailable, so callers use their haversine fallback.
pub struct NullRouteProvider;

#[async_trait]
impl RouteProvider for NullRouteProvider {
    async fn route(&self, _from: [f64; 2], _to: [f64; 2]) -> Result<RouteEstimate> {
        Err(DispatchError::RoutingUnavailable(
            "no routing endpoint configured".into(),
        ))
    }
}

/// LRU-cached wrapper around any [`RouteProvider`].
///
/// Cache key is the (from_cell, to_cell) pair at resolution 9, directional.
/// Points that fail cell conversion bypass the cache.
pub struct CachedRouteProvider {
    inner: Box<dyn RouteProvider>,
    cache: Mutex<LruCache<(u64, u64), RouteEstimate>>,
}

impl CachedRouteProvider {
    pub fn new(inner: Box<dyn RouteProvider>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("cache capacity must be > 0"),
            )),
        }
    }

    fn cache_key(from: [f64; 2], to: [f64; 2]) -> Option<(u64, u64)> {
        let from_cell = cell_of(from[1], from[0]).ok()?;
        let to_cell = cell_of(to[1], to[0]).ok()?;
        Some((u64::from(from_cell), u64::from(to_cell)))
    }
}

#[async_trait]
impl RouteProvider for CachedRouteProvider {
    async fn route(&self, from: [f64; 2], to: [f64; 2]) -> Result<RouteEstimate> {
        let key = Self::cache_key(from, to);

        if let Some(key) = key {
            if let Ok(mut cache) = self.cache.lock() {
                if let Some(cached) = cache.get(&key) {
                    return Ok(*cached);
                }
            }
        }

        let estimate = self.inner.route(from, to).await?;

        if let Some(key) = key {
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(key, estimate);
            }
        } else {
            debug!("route endpoints outside cell domain, result not cached");
        }

        Ok(estimate)
    }
}
