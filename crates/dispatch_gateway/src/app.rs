//! Service wiring and the axum router.
//!
//! Construction order follows the dependency graph: codec (stateless),
//! position store, connection registry, nearby query, offer manager, sync
//! worker. Everything is passed explicitly; nothing is process-global.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;

use dispatch_core::auth::{Claims, Role, TokenSigner};
use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::config::DispatchConfig;
use dispatch_core::connection::ConnectionRegistry;
use dispatch_core::durable::{DriverRepository, InMemoryDriverRepository};
use dispatch_core::error::DispatchError;
use dispatch_core::nearby::{NearbyService, SearchConstraints};
use dispatch_core::offer::OfferManager;
use dispatch_core::position::PositionStore;
use dispatch_core::routing::{
    CachedRouteProvider, NullRouteProvider, OsrmRouteProvider, RouteProvider,
};
use dispatch_core::spatial::CELL_RESOLUTION;
use dispatch_core::sync::LocationSyncWorker;

use crate::error::ApiError;
use crate::{http, ws};

/// Route cache capacity for the OSRM provider.
const ROUTE_CACHE_CAPACITY: usize = 20_000;

/// Shared handles to every core service.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DispatchConfig>,
    pub clock: Arc<dyn Clock>,
    pub positions: Arc<PositionStore>,
    pub repo: Arc<dyn DriverRepository>,
    pub registry: Arc<ConnectionRegistry>,
    pub nearby: Arc<NearbyService>,
    pub offers: Arc<OfferManager>,
    pub sync: Arc<LocationSyncWorker>,
    pub signer: TokenSigner,
}

/// Build the full service graph from configuration.
///
/// Fails when the configured cell resolution disagrees with the compiled
/// codec; indexing at a different granularity than clients would silently
/// break cell agreement.
pub fn build_state(config: DispatchConfig) -> Result<AppState, DispatchError> {
    if config.cell_resolution != u8::from(CELL_RESOLUTION) {
        return Err(DispatchError::PreconditionFailed(format!(
            "cellResolution {} does not match the compiled resolution {}",
            config.cell_resolution,
            u8::from(CELL_RESOLUTION),
        )));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let positions = Arc::new(PositionStore::new(clock.clone(), config.position_ttl_ms()));
    let repo: Arc<dyn DriverRepository> = Arc::new(InMemoryDriverRepository::new());
    let registry = Arc::new(ConnectionRegistry::new(config.egress_queue_capacity));

    let router: Arc<dyn RouteProvider> = if config.routing_endpoint.is_empty() {
        Arc::new(NullRouteProvider)
    } else {
        let osrm = OsrmRouteProvider::new(
            &config.routing_endpoint,
            Duration::from_millis(config.routing_timeout_ms),
        )?;
        Arc::new(CachedRouteProvider::new(Box::new(osrm), ROUTE_CACHE_CAPACITY))
    };

    let nearby = Arc::new(NearbyService::new(
        positions.clone(),
        repo.clone(),
        router.clone(),
        config.assumed_speed_kmh,
    ));

    let constraints = SearchConstraints {
        max_rings: config.max_rings,
        min_count: config.min_candidates,
        ..SearchConstraints::default()
    };
    let offers = Arc::new(OfferManager::new(
        positions.clone(),
        registry.clone(),
        repo.clone(),
        nearby.clone(),
        router,
        clock.clone(),
        config.offer_ttl_ms(),
        constraints,
    ));

    let sync = Arc::new(LocationSyncWorker::new(
        positions.clone(),
        repo.clone(),
        clock.clone(),
        Duration::from_secs(config.sync_interval_seconds),
    ));

    let signer = TokenSigner::new(config.access_token_secret.clone().into_bytes());

    Ok(AppState {
        config: Arc::new(config),
        clock,
        positions,
        repo,
        registry,
        nearby,
        offers,
        sync,
        signer,
    })
}

/// Authenticated caller, extracted once from the bearer token.
pub struct AuthedUser(pub Claims);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(DispatchError::AuthFailed("missing bearer token".into()))
            })?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError(DispatchError::AuthFailed("malformed header".into())))?;
        let claims = state.signer.verify(token, state.clock.now_ms())?;
        Ok(AuthedUser(claims))
    }
}

/// Authenticated admin caller; gates the operational endpoints.
pub struct AdminUser(pub Claims);

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthedUser(claims) = AuthedUser::from_request_parts(parts, state).await?;
        if claims.role != Role::Admin {
            return Err(ApiError(DispatchError::AuthFailed(
                "admin credentials required".into(),
            )));
        }
        Ok(AdminUser(claims))
    }
}

/// The gateway router: realtime channel plus the HTTP query/admin surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/ws", get(ws::ws_handler))
        .route("/drivers/nearby", get(http::nearby_drivers))
        .route("/rides/request", post(http::request_ride))
        .route("/offers/:id", get(http::get_offer))
        .route("/offers/:id/cancel", post(http::cancel_offer))
        .route("/admin/sync/trigger", post(http::trigger_sync))
        .route("/admin/sync/status", get(http::sync_status))
        .route("/admin/verifications", get(http::list_pending_verifications))
        .route("/admin/drivers/:id/verified", post(http::set_verified))
        .route("/admin/drivers/:id/blocked", post(http::set_blocked))
        .with_state(state)
}
