//! Test helpers for common test setup and utilities.
//!
//! Shared across in-crate unit tests and the integration scenarios.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::ManualClock;
use crate::connection::ConnectionRegistry;
use crate::durable::{DurableDriver, InMemoryDriverRepository};
use crate::error::Result;
use crate::ids::{DriverId, UserId};
use crate::nearby::{NearbyService, SearchConstraints};
use crate::offer::OfferManager;
use crate::position::{PositionStore, PositionWrite};
use crate::routing::{NullRouteProvider, RouteEstimate, RouteProvider};
use crate::spatial::cell_of;
use crate::sync::LocationSyncWorker;

/// A pickup point used across test files for consistency (central Berlin).
pub const PICKUP: (f64, f64) = (52.5200, 13.4050);

/// Kilometres per degree of latitude.
const KM_PER_DEG_LAT: f64 = 111.32;

/// A point `km` north of `base`; handy for placing drivers at known
/// straight-line distances.
pub fn north_of(base: (f64, f64), km: f64) -> (f64, f64) {
    (base.0 + km / KM_PER_DEG_LAT, base.1)
}

/// Routing double that answers a fixed estimate for every query.
pub struct FixedRouteProvider {
    pub duration_secs: f64,
    pub distance_meters: f64,
}

#[async_trait]
impl RouteProvider for FixedRouteProvider {
    async fn route(&self, _from: [f64; 2], _to: [f64; 2]) -> Result<RouteEstimate> {
        Ok(RouteEstimate {
            duration_secs: self.duration_secs,
            distance_meters: self.distance_meters,
        })
    }
}

/// Fully wired dispatch core over in-memory stores and a manual clock.
pub struct DispatchHarness {
    pub clock: Arc<ManualClock>,
    pub positions: Arc<PositionStore>,
    pub repo: Arc<InMemoryDriverRepository>,
    pub registry: Arc<ConnectionRegistry>,
    pub nearby: Arc<NearbyService>,
    pub offers: Arc<OfferManager>,
    pub sync: Arc<LocationSyncWorker>,
}

/// Default TTLs for harness wiring: 300s positions, 15s offers.
pub const HARNESS_POSITION_TTL_MS: u64 = 300_000;
pub const HARNESS_OFFER_TTL_MS: u64 = 15_000;

impl DispatchHarness {
    /// Build the full service graph with no routing backend (haversine ETAs).
    pub fn new() -> Self {
        Self::with_router(Arc::new(NullRouteProvider))
    }

    pub fn with_router(router: Arc<dyn RouteProvider>) -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        let positions = Arc::new(PositionStore::new(clock.clone(), HARNESS_POSITION_TTL_MS));
        let repo = Arc::new(InMemoryDriverRepository::new());
        let registry = Arc::new(ConnectionRegistry::new(64));
        let nearby = Arc::new(NearbyService::new(
            positions.clone(),
            repo.clone() as Arc<dyn crate::durable::DriverRepository>,
            router.clone(),
            30.0,
        ));
        let offers = Arc::new(OfferManager::new(
            positions.clone(),
            registry.clone(),
            repo.clone() as Arc<dyn crate::durable::DriverRepository>,
            nearby.clone(),
            router,
            clock.clone(),
            HARNESS_OFFER_TTL_MS,
            SearchConstraints::default(),
        ));
        let sync = Arc::new(LocationSyncWorker::new(
            positions.clone(),
            repo.clone() as Arc<dyn crate::durable::DriverRepository>,
            clock.clone(),
            std::time::Duration::from_secs(300),
        ));
        Self {
            clock,
            positions,
            repo,
            registry,
            nearby,
            offers,
            sync,
        }
    }

    /// Seed a verified, online, available driver at `(lat, lng)`.
    /// Returns its ids; attach a channel separately when the test needs one.
    pub fn seed_driver(&self, name: &str, lat: f64, lng: f64) -> (DriverId, UserId) {
        let driver_id = DriverId::new();
        let user_id = UserId::new();
        let mut durable = DurableDriver::new(driver_id, user_id, name);
        durable.verified = true;
        self.repo.insert(durable);
        self.positions.upsert(PositionWrite {
            driver_id,
            user_id,
            coordinates: [lng, lat],
            cell: cell_of(lat, lng).expect("seed coordinates must be valid"),
            is_online: true,
            is_available: true,
        });
        (driver_id, user_id)
    }
}

impl Default for DispatchHarness {
    fn default() -> Self {
        Self::new()
    }
}
