//! Offer lifecycle: creation, fan-out, first-accept-wins arbitration,
//! rejection, rider cancellation, and TTL expiry.
//!
//! The single correctness-critical point is the OPEN -> ACCEPTED transition:
//! it happens under the offer entry's exclusive lock, so exactly one of any
//! number of concurrent accepts succeeds and every other caller observes the
//! already-set state. Notification delivery is best-effort and never rolls
//! a transition back; state takes precedence over notification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connection::ConnectionRegistry;
use crate::durable::DriverRepository;
use crate::error::{DispatchError, Result};
use crate::ids::{DriverId, OfferId, UserId};
use crate::nearby::{NearbyDriver, NearbyService, SearchConstraints};
use crate::position::PositionStore;
use crate::pricing;
use crate::protocol::{OfferPayload, OutboundEvent};
use crate::routing::RouteProvider;
use crate::spatial::haversine_km;

/// Offer lifecycle states. `Accepted` and `Expired` are terminal; the offer
/// is immutable once it reaches either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    Open,
    Accepted,
    Expired,
}

/// An open invitation from a rider to a bounded set of drivers.
#[derive(Debug, Clone)]
pub struct Offer {
    pub offer_id: OfferId,
    pub rider_id: UserId,
    /// `[lng, lat]`.
    pub pickup: [f64; 2],
    /// `[lng, lat]`.
    pub destination: [f64; 2],
    pub fare: f64,
    pub distance_km: f64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub recipients: HashSet<DriverId>,
    pub winner: Option<DriverId>,
    pub state: OfferState,
}

impl Offer {
    /// Wire payload for driver-facing events.
    pub fn payload(&self, now_ms: u64) -> OfferPayload {
        OfferPayload {
            request_id: self.offer_id,
            pickup: self.pickup,
            destination: self.destination,
            fare: self.fare,
            distance_km: self.distance_km,
            expires_in: self.expires_at_ms.saturating_sub(now_ms) / 1_000,
        }
    }
}

/// What a successful dispatch returns to the rider-facing caller.
#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    pub offer_id: OfferId,
    pub dispatched_to: usize,
    pub expires_in_secs: u64,
}

/// Shared offer table plus everything needed for fan-out and arbitration.
pub struct OfferManager {
    offers: DashMap<OfferId, Offer>,
    positions: Arc<PositionStore>,
    registry: Arc<ConnectionRegistry>,
    repo: Arc<dyn DriverRepository>,
    nearby: Arc<NearbyService>,
    router: Arc<dyn RouteProvider>,
    clock: Arc<dyn Clock>,
    offer_ttl_ms: u64,
    constraints: SearchConstraints,
}

impl OfferManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        positions: Arc<PositionStore>,
        registry: Arc<ConnectionRegistry>,
        repo: Arc<dyn DriverRepository>,
        nearby: Arc<NearbyService>,
        router: Arc<dyn RouteProvider>,
        clock: Arc<dyn Clock>,
        offer_ttl_ms: u64,
        constraints: SearchConstraints,
    ) -> Self {
        Self {
            offers: DashMap::new(),
            positions,
            registry,
            repo,
            nearby,
            router,
            clock,
            offer_ttl_ms,
            constraints,
        }
    }

    /// Full dispatch flow: search, price, open the offer, fan out.
    ///
    /// When no reachable driver exists the rider's channel (if live) gets a
    /// `ride:request:failed` and the caller sees `PreconditionFailed`.
    pub async fn request_ride(
        self: &Arc<Self>,
        rider_id: UserId,
        pickup: [f64; 2],
        destination: [f64; 2],
    ) -> Result<DispatchReceipt> {
        let search = self
            .nearby
            .find_nearby(pickup[1], pickup[0], self.constraints)
            .await?;

        if search.candidates.is_empty() {
            self.registry.emit_to_user(
                rider_id,
                OutboundEvent::RideRequestFailed {
                    message: "no drivers available nearby".into(),
                },
            );
            return Err(DispatchError::PreconditionFailed(
                "no reachable drivers".into(),
            ));
        }

        let distance_km = match self.router.route(pickup, destination).await {
            Ok(estimate) => estimate.distance_meters / 1_000.0,
            Err(e) => {
                debug!(error = %e, "trip routing fallback to haversine");
                haversine_km((pickup[1], pickup[0]), (destination[1], destination[0]))
            }
        };
        let fare = pricing::quote_fare(distance_km);

        self.open_offer(
            rider_id,
            pickup,
            destination,
            &search.candidates,
            fare,
            distance_km,
        )
    }

    /// Create an OPEN offer and fan `ride:request` out to every recipient
    /// with a live channel. Reachability is re-checked here: the candidate
    /// list may be stale by the time dispatch happens.
    pub fn open_offer(
        self: &Arc<Self>,
        rider_id: UserId,
        pickup: [f64; 2],
        destination: [f64; 2],
        candidates: &[NearbyDriver],
        fare: f64,
        distance_km: f64,
    ) -> Result<DispatchReceipt> {
        let now = self.clock.now_ms();
        let mut recipients: HashSet<DriverId> = HashSet::new();
        let mut reachable: Vec<UserId> = Vec::new();

        for candidate in candidates {
            let Some(record) = self.positions.get(candidate.driver_id) else {
                continue;
            };
            if !record.is_online || !record.is_available {
                continue;
            }
            if self.registry.handle_for(record.user_id).is_none() {
                continue;
            }
            if recipients.insert(candidate.driver_id) {
                reachable.push(record.user_id);
            }
        }

        if recipients.is_empty() {
            self.registry.emit_to_user(
                rider_id,
                OutboundEvent::RideRequestFailed {
                    message: "no drivers available nearby".into(),
                },
            );
            return Err(DispatchError::PreconditionFailed(
                "no reachable drivers".into(),
            ));
        }

        let offer = Offer {
            offer_id: OfferId::new(),
            rider_id,
            pickup,
            destination,
            fare,
            distance_km,
            created_at_ms: now,
            expires_at_ms: now + self.offer_ttl_ms,
            recipients,
            winner: None,
            state: OfferState::Open,
        };
        let offer_id = offer.offer_id;
        let payload = offer.payload(now);
        let dispatched_to = offer.recipients.len();
        let expires_in_secs = payload.expires_in;

        self.offers.insert(offer_id, offer);

        for user_id in reachable {
            self.registry
                .emit_to_user(user_id, OutboundEvent::RideRequest(payload.clone()));
        }

        info!(
            offer = %offer_id,
            rider = %rider_id,
            recipients = dispatched_to,
            fare,
            "offer opened"
        );

        let manager = Arc::clone(self);
        let ttl = Duration::from_millis(self.offer_ttl_ms);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            manager.expire_offer(offer_id);
        });

        Ok(DispatchReceipt {
            offer_id,
            dispatched_to,
            expires_in_secs,
        })
    }

    /// First-accept-wins arbitration.
    ///
    /// Exactly one concurrent caller gets `Ok`; the rest see `Conflict`
    /// ("taken") or `NotFound` ("expired or gone"). On success the winner is
    /// marked busy, the rider and winner are notified, and every loser gets
    /// a cancellation.
    pub async fn accept_offer(&self, offer_id: OfferId, driver_id: DriverId) -> Result<Offer> {
        // Resolve the driver's display name before touching offer state, so
        // a durable-store outage fails the accept without a half-done
        // transition. One retry per the store's transient contract.
        let durable = match self.repo.get_driver(driver_id).await {
            Ok(d) => d,
            Err(e) if e.is_transient() => self.repo.get_driver(driver_id).await?,
            Err(e) => return Err(e),
        };
        let driver_name = durable
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?
            .name;

        let now = self.clock.now_ms();
        let (accepted, losers): (Offer, Vec<DriverId>) = {
            let mut entry = self
                .offers
                .get_mut(&offer_id)
                .ok_or_else(|| DispatchError::NotFound(format!("offer {offer_id}")))?;

            match entry.state {
                OfferState::Open => {}
                OfferState::Accepted => {
                    return Err(DispatchError::Conflict("offer already taken".into()))
                }
                OfferState::Expired => {
                    return Err(DispatchError::NotFound(format!("offer {offer_id}")))
                }
            }
            if now >= entry.expires_at_ms {
                // The expiry timer will notify the rider; this accept is too late.
                return Err(DispatchError::NotFound(format!("offer {offer_id}")));
            }
            if !entry.recipients.contains(&driver_id) {
                return Err(DispatchError::NotFound(format!("offer {offer_id}")));
            }

            entry.state = OfferState::Accepted;
            entry.winner = Some(driver_id);
            let losers = entry
                .recipients
                .iter()
                .copied()
                .filter(|d| *d != driver_id)
                .collect();
            (entry.clone(), losers)
        };

        // Post-transition effects. Failures here are logged, never rolled back.
        if !self.positions.set_availability(driver_id, false) {
            warn!(driver = %driver_id, "winner's position record missing while marking busy");
        }

        self.registry.emit_to_user(
            accepted.rider_id,
            OutboundEvent::RideAccepted {
                request_id: offer_id,
                driver_id,
                driver_name: driver_name.clone(),
                message: format!("{driver_name} is on the way"),
            },
        );

        if let Some(record) = self.positions.get(driver_id) {
            self.registry.emit_to_user(
                record.user_id,
                OutboundEvent::RideAcceptSuccess {
                    request_id: offer_id,
                    ride_details: accepted.payload(now),
                },
            );
        }

        for loser in losers {
            if let Some(record) = self.positions.get(loser) {
                self.registry.emit_to_user(
                    record.user_id,
                    OutboundEvent::RideRequestCancelled {
                        request_id: offer_id,
                        reason: "accepted_by_other".into(),
                    },
                );
            }
        }

        info!(offer = %offer_id, winner = %driver_id, "offer accepted");
        Ok(accepted)
    }

    /// Remove a driver from the recipient set. The offer stays OPEN; even a
    /// rejection by the last recipient leaves the rider's timer running.
    pub fn reject_offer(&self, offer_id: OfferId, driver_id: DriverId) -> Result<()> {
        let mut entry = self
            .offers
            .get_mut(&offer_id)
            .ok_or_else(|| DispatchError::NotFound(format!("offer {offer_id}")))?;
        entry.recipients.remove(&driver_id);
        debug!(offer = %offer_id, driver = %driver_id, "offer rejected");
        Ok(())
    }

    /// Rider-initiated cancellation while OPEN. Recipients still holding the
    /// offer are notified.
    pub fn cancel_offer(&self, offer_id: OfferId, rider_id: UserId) -> Result<()> {
        let recipients: Vec<DriverId> = {
            let mut entry = self
                .offers
                .get_mut(&offer_id)
                .ok_or_else(|| DispatchError::NotFound(format!("offer {offer_id}")))?;
            if entry.rider_id != rider_id {
                return Err(DispatchError::PreconditionFailed(
                    "only the originating rider may cancel".into(),
                ));
            }
            if entry.state != OfferState::Open {
                return Err(DispatchError::Conflict("offer is no longer open".into()));
            }
            entry.state = OfferState::Expired;
            entry.recipients.iter().copied().collect()
        };

        for driver_id in recipients {
            if let Some(record) = self.positions.get(driver_id) {
                self.registry.emit_to_user(
                    record.user_id,
                    OutboundEvent::RideRequestCancelled {
                        request_id: offer_id,
                        reason: "cancelled_by_rider".into(),
                    },
                );
            }
        }
        info!(offer = %offer_id, "offer cancelled by rider");
        Ok(())
    }

    /// TTL expiry. Exactly one `ride:request:expired` reaches the rider
    /// because only the OPEN -> EXPIRED transition emits it.
    pub fn expire_offer(&self, offer_id: OfferId) {
        let rider_id = {
            let Some(mut entry) = self.offers.get_mut(&offer_id) else {
                return;
            };
            if entry.state != OfferState::Open {
                return;
            }
            if self.clock.now_ms() < entry.expires_at_ms {
                return;
            }
            entry.state = OfferState::Expired;
            entry.rider_id
        };

        self.registry.emit_to_user(
            rider_id,
            OutboundEvent::RideRequestExpired {
                request_id: offer_id,
                message: "no driver accepted your request".into(),
            },
        );
        info!(offer = %offer_id, "offer expired");
    }

    /// Current offer snapshot; the reconcile-on-reconnect surface for riders
    /// and the recovery path for a winner that missed its success event.
    pub fn get_offer(&self, offer_id: OfferId) -> Option<Offer> {
        self.offers.get(&offer_id).map(|o| o.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::connection::Identity;
    use crate::test_helpers::{DispatchHarness, HARNESS_OFFER_TTL_MS, PICKUP};
    use futures::future::join_all;
    use tokio::sync::mpsc;

    const DESTINATION: [f64; 2] = [13.3320, 52.5076];

    fn pickup_lnglat() -> [f64; 2] {
        [PICKUP.1, PICKUP.0]
    }

    /// Seed a driver and attach a live channel for it.
    fn connected_driver(
        h: &DispatchHarness,
        name: &str,
    ) -> (DriverId, UserId, mpsc::Receiver<OutboundEvent>) {
        let (driver_id, user_id) = h.seed_driver(name, PICKUP.0, PICKUP.1);
        let (handle, rx) = h.registry.attach(Identity {
            user_id,
            role: Role::Driver,
        });
        h.positions.set_connection(driver_id, Some(handle.channel_id()));
        (driver_id, user_id, rx)
    }

    fn attach_rider(h: &DispatchHarness) -> (UserId, mpsc::Receiver<OutboundEvent>) {
        let rider_id = UserId::new();
        let (_handle, rx) = h.registry.attach(Identity {
            user_id: rider_id,
            role: Role::Rider,
        });
        (rider_id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn request_ride_fans_out_to_reachable_drivers() {
        let h = DispatchHarness::new();
        let (_d1, _u1, mut rx1) = connected_driver(&h, "One");
        let (_d2, _u2, mut rx2) = connected_driver(&h, "Two");
        // Online and available but never connected: must be skipped.
        h.seed_driver("Unreachable", PICKUP.0, PICKUP.1);
        let (rider_id, _rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");

        assert_eq!(receipt.dispatched_to, 2);
        assert_eq!(receipt.expires_in_secs, HARNESS_OFFER_TTL_MS / 1_000);
        for rx in [&mut rx1, &mut rx2] {
            let events = drain(rx);
            assert!(matches!(events.as_slice(), [OutboundEvent::RideRequest(_)]));
        }

        let offer = h.offers.get_offer(receipt.offer_id).expect("offer");
        assert_eq!(offer.state, OfferState::Open);
        assert_eq!(offer.recipients.len(), 2);
        assert!(offer.winner.is_none());
    }

    #[tokio::test]
    async fn request_ride_without_drivers_notifies_rider_of_failure() {
        let h = DispatchHarness::new();
        let (rider_id, mut rider_rx) = attach_rider(&h);

        let err = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PreconditionFailed(_)));

        let events = drain(&mut rider_rx);
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::RideRequestFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn accept_marks_winner_busy_and_notifies_everyone() {
        let h = DispatchHarness::new();
        let (winner_id, _wu, mut winner_rx) = connected_driver(&h, "Winner");
        let (loser_id, _lu, mut loser_rx) = connected_driver(&h, "Loser");
        let (rider_id, mut rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");
        drain(&mut winner_rx);
        drain(&mut loser_rx);

        let accepted = h
            .offers
            .accept_offer(receipt.offer_id, winner_id)
            .await
            .expect("accept");
        assert_eq!(accepted.state, OfferState::Accepted);
        assert_eq!(accepted.winner, Some(winner_id));

        // Winner is busy: no second offer may reach them.
        assert!(!h.positions.get(winner_id).expect("record").is_available);
        assert!(h.positions.get(loser_id).expect("record").is_available);

        let rider_events = drain(&mut rider_rx);
        assert!(matches!(
            rider_events.as_slice(),
            [OutboundEvent::RideAccepted { driver_name, .. }] if driver_name == "Winner"
        ));
        let winner_events = drain(&mut winner_rx);
        assert!(matches!(
            winner_events.as_slice(),
            [OutboundEvent::RideAcceptSuccess { .. }]
        ));
        let loser_events = drain(&mut loser_rx);
        assert!(matches!(
            loser_events.as_slice(),
            [OutboundEvent::RideRequestCancelled { reason, .. }] if reason == "accepted_by_other"
        ));
    }

    #[tokio::test]
    async fn only_one_of_many_concurrent_accepts_wins() {
        let h = DispatchHarness::new();
        let mut drivers = Vec::new();
        for i in 0..5 {
            let (driver_id, _user, rx) = connected_driver(&h, &format!("Driver {i}"));
            drivers.push((driver_id, rx));
        }
        let (rider_id, mut rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");

        let results = join_all(
            drivers
                .iter()
                .map(|(driver_id, _)| h.offers.accept_offer(receipt.offer_id, *driver_id)),
        )
        .await;

        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one concurrent accept succeeds");
        for result in &results {
            if let Err(e) = result {
                assert!(
                    matches!(e, DispatchError::Conflict(_)),
                    "losers observe the taken state, got {e:?}"
                );
            }
        }

        let rider_events = drain(&mut rider_rx);
        let accepted_count = rider_events
            .iter()
            .filter(|e| matches!(e, OutboundEvent::RideAccepted { .. }))
            .count();
        assert_eq!(accepted_count, 1);

        let offer = h.offers.get_offer(receipt.offer_id).expect("offer");
        assert_eq!(offer.state, OfferState::Accepted);
        assert!(offer.winner.is_some());
        assert!(offer.recipients.contains(&offer.winner.expect("winner")));
    }

    #[tokio::test]
    async fn accept_after_expiry_fails_as_gone() {
        let h = DispatchHarness::new();
        let (driver_id, _user, _rx) = connected_driver(&h, "Late");
        let (rider_id, _rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");

        h.clock.advance_ms(HARNESS_OFFER_TTL_MS + 1);
        let err = h
            .offers
            .accept_offer(receipt.offer_id, driver_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn rejection_shrinks_recipients_but_keeps_offer_open() {
        let h = DispatchHarness::new();
        let (driver_id, _user, _rx) = connected_driver(&h, "Decliner");
        let (rider_id, mut rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");

        h.offers
            .reject_offer(receipt.offer_id, driver_id)
            .expect("reject");

        // Even the last rejection leaves the rider's timer running.
        let offer = h.offers.get_offer(receipt.offer_id).expect("offer");
        assert_eq!(offer.state, OfferState::Open);
        assert!(offer.recipients.is_empty());
        assert!(drain(&mut rider_rx).is_empty());

        // And the decliner can no longer win the offer.
        let err = h
            .offers
            .accept_offer(receipt.offer_id, driver_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn rider_cancel_notifies_remaining_recipients() {
        let h = DispatchHarness::new();
        let (_driver_id, _user, mut driver_rx) = connected_driver(&h, "Cancelled On");
        let (rider_id, _rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");
        drain(&mut driver_rx);

        // Only the originating rider may cancel.
        let err = h
            .offers
            .cancel_offer(receipt.offer_id, UserId::new())
            .unwrap_err();
        assert!(matches!(err, DispatchError::PreconditionFailed(_)));

        h.offers
            .cancel_offer(receipt.offer_id, rider_id)
            .expect("cancel");
        let offer = h.offers.get_offer(receipt.offer_id).expect("offer");
        assert_eq!(offer.state, OfferState::Expired);
        assert!(offer.winner.is_none());

        let events = drain(&mut driver_rx);
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::RideRequestCancelled { reason, .. }] if reason == "cancelled_by_rider"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_timer_notifies_the_rider_exactly_once() {
        let h = DispatchHarness::new();
        let (_driver_id, _user, mut driver_rx) = connected_driver(&h, "Silent");
        let (rider_id, mut rider_rx) = attach_rider(&h);

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");
        drain(&mut driver_rx);

        // Cross the TTL on both the wall clock and the timer wheel.
        h.clock.advance_ms(HARNESS_OFFER_TTL_MS + 1);
        tokio::time::sleep(Duration::from_millis(HARNESS_OFFER_TTL_MS + 100)).await;

        let offer = h.offers.get_offer(receipt.offer_id).expect("offer");
        assert_eq!(offer.state, OfferState::Expired);

        let rider_events = drain(&mut rider_rx);
        let expired_count = rider_events
            .iter()
            .filter(|e| matches!(e, OutboundEvent::RideRequestExpired { .. }))
            .count();
        assert_eq!(expired_count, 1);

        // Silent drivers hear nothing further.
        assert!(drain(&mut driver_rx).is_empty());

        // A second expiry sweep is a no-op on the terminal state.
        h.offers.expire_offer(receipt.offer_id);
        assert!(drain(&mut rider_rx).is_empty());
    }

    #[tokio::test]
    async fn accepted_offer_survives_without_a_live_rider_channel() {
        let h = DispatchHarness::new();
        let (driver_id, _user, _rx) = connected_driver(&h, "Solo");
        // Rider never attaches a channel.
        let rider_id = UserId::new();

        let receipt = h
            .offers
            .request_ride(rider_id, pickup_lnglat(), DESTINATION)
            .await
            .expect("dispatch");

        let accepted = h
            .offers
            .accept_offer(receipt.offer_id, driver_id)
            .await
            .expect("accept");
        assert_eq!(accepted.state, OfferState::Accepted);

        // The rider reconciles later by querying offer state.
        let offer = h.offers.get_offer(receipt.offer_id).expect("offer");
        assert_eq!(offer.winner, Some(driver_id));
    }
}
