//! HTTP surface: rider queries, dispatch entry, offer introspection, and
//! the admin endpoints for sync and driver verification.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use dispatch_core::auth::Role;
use dispatch_core::error::DispatchError;
use dispatch_core::ids::{DriverId, OfferId};
use dispatch_core::nearby::{NearbySearch, SearchConstraints};
use dispatch_core::offer::{Offer, OfferState};
use dispatch_core::sync::{SyncReport, SyncRun, SyncStatus};

use crate::app::{AdminUser, AppState, AuthedUser};
use crate::error::ApiError;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Nearby search
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub max_rings: Option<u32>,
    pub min_count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyDriverDto {
    pub driver_id: DriverId,
    pub name: String,
    /// `[lng, lat]`.
    pub coordinates: [f64; 2],
    pub straight_line_km: f64,
    pub eta_minutes: f64,
    pub route_meters: Option<f64>,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyResponse {
    pub candidates: Vec<NearbyDriverDto>,
    pub search_radius: u32,
}

impl From<NearbySearch> for NearbyResponse {
    fn from(search: NearbySearch) -> Self {
        Self {
            search_radius: search.search_radius,
            candidates: search
                .candidates
                .into_iter()
                .map(|c| NearbyDriverDto {
                    driver_id: c.driver_id,
                    name: c.name,
                    coordinates: c.coordinates,
                    straight_line_km: c.straight_line_km,
                    eta_minutes: c.eta_minutes,
                    route_meters: c.route_meters,
                    connected: c.channel.is_some(),
                })
                .collect(),
        }
    }
}

pub async fn nearby_drivers(
    State(state): State<AppState>,
    AuthedUser(_claims): AuthedUser,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<NearbyResponse>, ApiError> {
    let mut constraints = SearchConstraints {
        max_rings: state.config.max_rings,
        min_count: state.config.min_candidates,
        ..SearchConstraints::default()
    };
    if let Some(max_rings) = query.max_rings {
        constraints.max_rings = max_rings;
    }
    if let Some(min_count) = query.min_count {
        constraints.min_count = min_count;
    }

    let search = state
        .nearby
        .find_nearby(query.lat, query.lng, constraints)
        .await?;
    Ok(Json(search.into()))
}

// ---------------------------------------------------------------------------
// Ride request / offers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequestBody {
    /// `[lng, lat]`.
    pub pickup: [f64; 2],
    /// `[lng, lat]`.
    pub destination: [f64; 2],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequestResponse {
    pub offer_id: OfferId,
    pub dispatched_to: usize,
    pub expires_in: u64,
}

pub async fn request_ride(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Json(body): Json<RideRequestBody>,
) -> Result<Json<RideRequestResponse>, ApiError> {
    if claims.role != Role::Rider {
        return Err(ApiError(DispatchError::PreconditionFailed(
            "only riders may request rides".into(),
        )));
    }

    let receipt = state
        .offers
        .request_ride(claims.sub, body.pickup, body.destination)
        .await?;
    Ok(Json(RideRequestResponse {
        offer_id: receipt.offer_id,
        dispatched_to: receipt.dispatched_to,
        expires_in: receipt.expires_in_secs,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDto {
    pub offer_id: OfferId,
    pub state: &'static str,
    pub winner: Option<DriverId>,
    /// `[lng, lat]`.
    pub pickup: [f64; 2],
    /// `[lng, lat]`.
    pub destination: [f64; 2],
    pub fare: f64,
    pub distance_km: f64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl From<Offer> for OfferDto {
    fn from(offer: Offer) -> Self {
        Self {
            offer_id: offer.offer_id,
            state: match offer.state {
                OfferState::Open => "open",
                OfferState::Accepted => "accepted",
                OfferState::Expired => "expired",
            },
            winner: offer.winner,
            pickup: offer.pickup,
            destination: offer.destination,
            fare: offer.fare,
            distance_km: offer.distance_km,
            created_at_ms: offer.created_at_ms,
            expires_at_ms: offer.expires_at_ms,
        }
    }
}

/// Offer state lookup; how riders reconcile after a reconnect and how a
/// winning driver recovers a missed accept confirmation.
pub async fn get_offer(
    State(state): State<AppState>,
    AuthedUser(_claims): AuthedUser,
    Path(offer_id): Path<OfferId>,
) -> Result<Json<OfferDto>, ApiError> {
    let offer = state
        .offers
        .get_offer(offer_id)
        .ok_or_else(|| ApiError(DispatchError::NotFound(format!("offer {offer_id}"))))?;
    Ok(Json(offer.into()))
}

pub async fn cancel_offer(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(offer_id): Path<OfferId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.offers.cancel_offer(offer_id, claims.sub)?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

// ---------------------------------------------------------------------------
// Admin: sync worker
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTriggerResponse {
    pub triggered: bool,
    pub report: Option<SyncReportDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReportDto {
    pub snapshot: usize,
    pub persisted: usize,
    pub failed: usize,
    pub expired: usize,
}

impl From<SyncReport> for SyncReportDto {
    fn from(r: SyncReport) -> Self {
        Self {
            snapshot: r.snapshot,
            persisted: r.persisted,
            failed: r.failed,
            expired: r.expired,
        }
    }
}

pub async fn trigger_sync(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
) -> Json<SyncTriggerResponse> {
    match state.sync.trigger_now().await {
        SyncRun::Completed(report) => Json(SyncTriggerResponse {
            triggered: true,
            report: Some(report.into()),
        }),
        SyncRun::Skipped => Json(SyncTriggerResponse {
            triggered: false,
            report: None,
        }),
    }
}

pub async fn sync_status(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
) -> Json<SyncStatus> {
    Json(state.sync.status())
}

// ---------------------------------------------------------------------------
// Admin: driver verification
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingVerificationDto {
    pub driver_id: DriverId,
    pub name: String,
    pub license_plate: String,
    pub vehicle_model: String,
}

pub async fn list_pending_verifications(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
) -> Result<Json<Vec<PendingVerificationDto>>, ApiError> {
    let pending = state.repo.list_pending_verifications().await?;
    Ok(Json(
        pending
            .into_iter()
            .map(|d| PendingVerificationDto {
                driver_id: d.driver_id,
                name: d.name,
                license_plate: d.license_plate,
                vehicle_model: d.vehicle_model,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SetVerifiedBody {
    pub verified: bool,
}

pub async fn set_verified(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    Path(driver_id): Path<DriverId>,
    Json(body): Json<SetVerifiedBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.repo.set_verified(driver_id, body.verified).await?;
    Ok(Json(serde_json::json!({ "updated": true })))
}

#[derive(Debug, Deserialize)]
pub struct SetBlockedBody {
    pub blocked: bool,
}

pub async fn set_blocked(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    Path(driver_id): Path<DriverId>,
    Json(body): Json<SetBlockedBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.repo.set_blocked(driver_id, body.blocked).await?;
    Ok(Json(serde_json::json!({ "updated": true })))
}
