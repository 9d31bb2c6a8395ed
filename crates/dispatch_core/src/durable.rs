//! Durable driver records and the repository seam.
//!
//! The durable store is authoritative for everything non-ephemeral:
//! identity, vehicle, verification flags, counters, last-known position.
//! The core consumes it through [`DriverRepository`]; the in-memory
//! implementation backs tests and single-node deployments, with a
//! database-backed implementation being a deployment substitution.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::ids::{DriverId, UserId};

/// Long-lived driver entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableDriver {
    pub driver_id: DriverId,
    pub user_id: UserId,
    pub name: String,
    pub license_plate: String,
    pub vehicle_model: String,
    pub verified: bool,
    pub blocked: bool,
    pub completed_trips: u64,
    pub rating: f64,
    /// Last synced position, `[lng, lat]`.
    pub last_position: Option<[f64; 2]>,
    /// Last synced H3 cell (raw index).
    pub last_cell: Option<u64>,
    pub is_online: bool,
    pub is_available: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl DurableDriver {
    /// A fresh, unverified driver with no position history.
    pub fn new(driver_id: DriverId, user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            driver_id,
            user_id,
            name: name.into(),
            license_plate: String::new(),
            vehicle_model: String::new(),
            verified: false,
            blocked: false,
            completed_trips: 0,
            rating: 5.0,
            last_position: None,
            last_cell: None,
            is_online: false,
            is_available: false,
            last_seen_at: None,
        }
    }
}

/// One position write flowing from the ephemeral store to the durable store.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    /// `[lng, lat]`.
    pub coordinates: [f64; 2],
    pub cell: u64,
    pub is_online: bool,
    pub is_available: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// Durable store operations the dispatch core consumes.
#[async_trait]
pub trait DriverRepository: Send + Sync {
    async fn get_driver(&self, driver_id: DriverId) -> Result<Option<DurableDriver>>;

    async fn find_by_user(&self, user_id: UserId) -> Result<Option<DurableDriver>>;

    /// Idempotent position write; the sync worker may deliver the same
    /// update more than once.
    async fn update_driver_position(
        &self,
        driver_id: DriverId,
        update: PositionUpdate,
    ) -> Result<()>;

    async fn list_pending_verifications(&self) -> Result<Vec<DurableDriver>>;

    async fn set_verified(&self, driver_id: DriverId, verified: bool) -> Result<()>;

    async fn set_blocked(&self, driver_id: DriverId, blocked: bool) -> Result<()>;
}

/// In-memory repository.
///
/// `fail_position_updates_for` marks drivers whose position writes fail with
/// a transient error, which is how the sync-worker merge path is exercised.
#[derive(Debug, Default)]
pub struct InMemoryDriverRepository {
    drivers: DashMap<DriverId, DurableDriver>,
    failing: Mutex<HashSet<DriverId>>,
}

impl InMemoryDriverRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, driver: DurableDriver) {
        self.drivers.insert(driver.driver_id, driver);
    }

    /// Make `update_driver_position` fail for this driver until cleared.
    pub fn fail_position_updates_for(&self, driver_id: DriverId, failing: bool) {
        let mut set = self.failing.lock().expect("failing set lock");
        if failing {
            set.insert(driver_id);
        } else {
            set.remove(&driver_id);
        }
    }

    fn is_failing(&self, driver_id: DriverId) -> bool {
        self.failing
            .lock()
            .expect("failing set lock")
            .contains(&driver_id)
    }
}

#[async_trait]
impl DriverRepository for InMemoryDriverRepository {
    async fn get_driver(&self, driver_id: DriverId) -> Result<Option<DurableDriver>> {
        Ok(self.drivers.get(&driver_id).map(|d| d.clone()))
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Option<DurableDriver>> {
        Ok(self
            .drivers
            .iter()
            .find(|d| d.user_id == user_id)
            .map(|d| d.clone()))
    }

    async fn update_driver_position(
        &self,
        driver_id: DriverId,
        update: PositionUpdate,
    ) -> Result<()> {
        if self.is_failing(driver_id) {
            return Err(DispatchError::TransientStore(format!(
                "injected failure for driver {driver_id}"
            )));
        }
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        driver.last_position = Some(update.coordinates);
        driver.last_cell = Some(update.cell);
        driver.is_online = update.is_online;
        driver.is_available = update.is_available;
        driver.last_seen_at = Some(update.last_seen_at);
        Ok(())
    }

    async fn list_pending_verifications(&self) -> Result<Vec<DurableDriver>> {
        Ok(self
            .drivers
            .iter()
            .filter(|d| !d.verified && !d.blocked)
            .map(|d| d.clone())
            .collect())
    }

    async fn set_verified(&self, driver_id: DriverId, verified: bool) -> Result<()> {
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        driver.verified = verified;
        Ok(())
    }

    async fn set_blocked(&self, driver_id: DriverId, blocked: bool) -> Result<()> {
        let mut driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        driver.blocked = blocked;
        Ok(())
    }
}
