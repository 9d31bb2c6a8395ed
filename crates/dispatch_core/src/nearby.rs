//! Nearby-driver query: expanding-ring search over the position store.
//!
//! Rings bound total work regardless of driver density and give callers a
//! natural "how far did we have to look" signal. Ring 0 goes first because
//! the overwhelming majority of queries find a driver in the rider's own or
//! immediately adjacent cells.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::durable::DriverRepository;
use crate::error::Result;
use crate::ids::{ChannelId, DriverId, UserId};
use crate::position::PositionStore;
use crate::routing::RouteProvider;
use crate::spatial::{cell_of, haversine_km, ring_at};

/// Filters applied to candidate drivers.
#[derive(Debug, Clone, Copy)]
pub struct SearchConstraints {
    pub max_rings: u32,
    pub min_count: usize,
    pub only_online: bool,
    pub only_available: bool,
    pub only_verified: bool,
    pub only_unblocked: bool,
}

impl Default for SearchConstraints {
    fn default() -> Self {
        Self {
            max_rings: 5,
            min_count: 1,
            only_online: true,
            only_available: true,
            only_verified: true,
            only_unblocked: true,
        }
    }
}

/// One ranked candidate.
#[derive(Debug, Clone)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub user_id: UserId,
    pub name: String,
    /// `[lng, lat]`.
    pub coordinates: [f64; 2],
    pub straight_line_km: f64,
    pub eta_minutes: f64,
    /// Road distance when the routing collaborator answered.
    pub route_meters: Option<f64>,
    pub channel: Option<ChannelId>,
}

/// Search result with the ring distance the search had to reach.
#[derive(Debug, Clone)]
pub struct NearbySearch {
    pub candidates: Vec<NearbyDriver>,
    pub search_radius: u32,
}

/// Expanding-ring nearest-driver search.
pub struct NearbyService {
    positions: Arc<PositionStore>,
    repo: Arc<dyn DriverRepository>,
    router: Arc<dyn RouteProvider>,
    assumed_speed_kmh: f64,
}

impl NearbyService {
    pub fn new(
        positions: Arc<PositionStore>,
        repo: Arc<dyn DriverRepository>,
        router: Arc<dyn RouteProvider>,
        assumed_speed_kmh: f64,
    ) -> Self {
        Self {
            positions,
            repo,
            router,
            assumed_speed_kmh,
        }
    }

    /// Find drivers near `(lat, lng)`, closest ring first, ranked by ETA
    /// then straight-line distance.
    pub async fn find_nearby(
        &self,
        lat: f64,
        lng: f64,
        constraints: SearchConstraints,
    ) -> Result<NearbySearch> {
        let center = cell_of(lat, lng)?;
        let mut seen: HashSet<DriverId> = HashSet::new();
        let mut survivors: Vec<NearbyDriver> = Vec::new();

        for k in 0..=constraints.max_rings {
            let ring = ring_at(center, k);
            let members = self.positions.members_of_cells(&ring);

            for driver_id in members {
                // A driver mid-cell-transition can surface in two rings;
                // keep the first sighting only.
                if !seen.insert(driver_id) {
                    continue;
                }
                if let Some(candidate) = self
                    .evaluate_candidate(driver_id, lat, lng, &constraints)
                    .await
                {
                    survivors.push(candidate);
                }
            }

            if survivors.len() >= constraints.min_count {
                survivors.sort_by(|a, b| {
                    a.eta_minutes
                        .partial_cmp(&b.eta_minutes)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(
                            a.straight_line_km
                                .partial_cmp(&b.straight_line_km)
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                });
                debug!(
                    ring = k,
                    candidates = survivors.len(),
                    "nearby search satisfied"
                );
                return Ok(NearbySearch {
                    candidates: survivors,
                    search_radius: k,
                });
            }
        }

        Ok(NearbySearch {
            candidates: Vec::new(),
            search_radius: constraints.max_rings,
        })
    }

    async fn evaluate_candidate(
        &self,
        driver_id: DriverId,
        lat: f64,
        lng: f64,
        constraints: &SearchConstraints,
    ) -> Option<NearbyDriver> {
        let record = self.positions.get(driver_id)?;
        if constraints.only_online && !record.is_online {
            return None;
        }
        if constraints.only_available && !record.is_available {
            return None;
        }

        let durable = match self.repo.get_driver(driver_id).await {
            Ok(Some(d)) => d,
            Ok(None) => return None,
            Err(e) => {
                // One flaky durable read must not sink the whole search.
                warn!(driver_id = %driver_id, error = %e, "durable lookup failed, skipping driver");
                return None;
            }
        };
        if constraints.only_verified && !durable.verified {
            return None;
        }
        if constraints.only_unblocked && durable.blocked {
            return None;
        }

        let straight_line_km =
            haversine_km((record.coordinates[1], record.coordinates[0]), (lat, lng));

        let (eta_minutes, route_meters) =
            match self.router.route(record.coordinates, [lng, lat]).await {
                Ok(estimate) => (estimate.duration_secs / 60.0, Some(estimate.distance_meters)),
                Err(e) => {
                    debug!(driver_id = %driver_id, error = %e, "routing fallback to haversine");
                    (
                        (straight_line_km / self.assumed_speed_kmh * 60.0).round(),
                        None,
                    )
                }
            };

        Some(NearbyDriver {
            driver_id,
            user_id: record.user_id,
            name: durable.name,
            coordinates: record.coordinates,
            straight_line_km,
            eta_minutes,
            route_meters,
            channel: record.channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionWrite;
    use crate::test_helpers::{north_of, DispatchHarness, FixedRouteProvider, PICKUP};

    #[tokio::test]
    async fn finds_driver_in_same_cell_at_ring_zero() {
        let h = DispatchHarness::new();
        h.seed_driver("Ada", PICKUP.0, PICKUP.1);

        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, SearchConstraints::default())
            .await
            .expect("search");

        assert_eq!(search.candidates.len(), 1);
        assert_eq!(search.search_radius, 0);
        assert_eq!(search.candidates[0].name, "Ada");
    }

    #[tokio::test]
    async fn expands_rings_until_a_driver_appears() {
        let h = DispatchHarness::new();
        // ~0.9 km north: a few rings out at resolution 9.
        let (lat, lng) = north_of(PICKUP, 0.9);
        h.seed_driver("Far", lat, lng);

        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, SearchConstraints::default())
            .await
            .expect("search");

        assert_eq!(search.candidates.len(), 1);
        assert!(search.search_radius >= 1, "driver is not in the center cell");
        assert!(search.search_radius <= 5);
    }

    #[tokio::test]
    async fn closest_driver_ranks_first() {
        let h = DispatchHarness::new();
        let (near_lat, near_lng) = north_of(PICKUP, 0.3);
        let (far_lat, far_lng) = north_of(PICKUP, 0.9);
        let (very_far_lat, very_far_lng) = north_of(PICKUP, 4.0);
        let (near_id, _) = h.seed_driver("Near", near_lat, near_lng);
        h.seed_driver("Mid", far_lat, far_lng);
        h.seed_driver("Far", very_far_lat, very_far_lng);

        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, SearchConstraints::default())
            .await
            .expect("search");

        assert!(!search.candidates.is_empty());
        assert_eq!(search.candidates[0].driver_id, near_id);
        assert!(search.search_radius <= 3, "0.3 km should resolve within a few rings");
    }

    #[tokio::test]
    async fn min_count_keeps_expanding_past_first_hit() {
        let h = DispatchHarness::new();
        h.seed_driver("Close", PICKUP.0, PICKUP.1);
        let (lat, lng) = north_of(PICKUP, 0.6);
        h.seed_driver("Further", lat, lng);

        let mut constraints = SearchConstraints::default();
        constraints.min_count = 2;
        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, constraints)
            .await
            .expect("search");

        assert_eq!(search.candidates.len(), 2);
        assert!(search.search_radius >= 1);
    }

    #[tokio::test]
    async fn offline_unavailable_unverified_and_blocked_are_filtered() {
        let h = DispatchHarness::new();
        let (offline, offline_user) = h.seed_driver("Offline", PICKUP.0, PICKUP.1);
        h.positions.upsert(PositionWrite {
            driver_id: offline,
            user_id: offline_user,
            coordinates: [PICKUP.1, PICKUP.0],
            cell: cell_of(PICKUP.0, PICKUP.1).expect("cell"),
            is_online: false,
            is_available: true,
        });

        let (busy, _) = h.seed_driver("Busy", PICKUP.0, PICKUP.1);
        h.positions.set_availability(busy, false);

        let (unverified, _) = h.seed_driver("Unverified", PICKUP.0, PICKUP.1);
        h.repo
            .set_verified(unverified, false)
            .await
            .expect("unverify");

        let (blocked, _) = h.seed_driver("Blocked", PICKUP.0, PICKUP.1);
        h.repo.set_blocked(blocked, true).await.expect("block");

        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, SearchConstraints::default())
            .await
            .expect("search");
        assert!(search.candidates.is_empty());
        assert_eq!(search.search_radius, 5);
    }

    #[tokio::test]
    async fn expired_drivers_never_surface() {
        let h = DispatchHarness::new();
        h.seed_driver("Stale", PICKUP.0, PICKUP.1);
        h.clock
            .advance_ms(crate::test_helpers::HARNESS_POSITION_TTL_MS + 1);

        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, SearchConstraints::default())
            .await
            .expect("search");
        assert!(search.candidates.is_empty());
    }

    #[tokio::test]
    async fn routing_failure_falls_back_to_haversine_eta() {
        // Harness default router always fails.
        let h = DispatchHarness::new();
        let (lat, lng) = north_of(PICKUP, 2.0);
        h.seed_driver("NoRoute", lat, lng);

        let mut constraints = SearchConstraints::default();
        constraints.max_rings = 20;
        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, constraints)
            .await
            .expect("search");

        let candidate = &search.candidates[0];
        assert!(candidate.route_meters.is_none());
        // 2 km at 30 km/h is 4 minutes.
        assert!((candidate.eta_minutes - 4.0).abs() < 1.0, "eta {}", candidate.eta_minutes);
    }

    #[tokio::test]
    async fn routing_success_annotates_eta_and_distance() {
        let h = DispatchHarness::with_router(std::sync::Arc::new(FixedRouteProvider {
            duration_secs: 300.0,
            distance_meters: 2_500.0,
        }));
        h.seed_driver("Routed", PICKUP.0, PICKUP.1);

        let search = h
            .nearby
            .find_nearby(PICKUP.0, PICKUP.1, SearchConstraints::default())
            .await
            .expect("search");

        let candidate = &search.candidates[0];
        assert_eq!(candidate.route_meters, Some(2_500.0));
        assert!((candidate.eta_minutes - 5.0).abs() < 0.01);
    }
}
