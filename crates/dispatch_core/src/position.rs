//! Ephemeral driver position store.
//!
//! This module provides:
//!
//! - **Position records**: per-driver position with an absolute TTL
//! - **Cell membership**: cell -> driver sets inheriting the record TTL
//! - **Active-dirty tracking**: which drivers still need durable persistence
//!
//! Liveness is TTL-driven: a driver that stops sending updates disappears
//! from every index at TTL without an explicit offline event. All writes go
//! through one mutex so a record, its cell membership, and its dirty mark
//! land atomically with the TTL attached in the same operation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use h3o::CellIndex;

use crate::clock::Clock;
use crate::ids::{ChannelId, DriverId, UserId};

/// Ephemeral per-driver state. Authoritative for liveness only.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub driver_id: DriverId,
    pub user_id: UserId,
    /// `[lng, lat]`.
    pub coordinates: [f64; 2],
    pub cell: CellIndex,
    /// Milliseconds since the Unix epoch of the last update.
    pub last_seen_ms: u64,
    pub is_online: bool,
    pub is_available: bool,
    /// Live channel, if the driver is currently connected.
    pub channel: Option<ChannelId>,
}

/// Fields a position update writes; the store manages TTL and channel.
#[derive(Debug, Clone)]
pub struct PositionWrite {
    pub driver_id: DriverId,
    pub user_id: UserId,
    /// `[lng, lat]`.
    pub coordinates: [f64; 2],
    pub cell: CellIndex,
    pub is_online: bool,
    pub is_available: bool,
}

#[derive(Debug)]
struct Entry {
    record: PositionRecord,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<DriverId, Entry>,
    /// Cell -> member -> membership expiry. Memberships inherit the record TTL.
    cells: HashMap<CellIndex, HashMap<DriverId, u64>>,
    /// Drivers whose position changed since the last successful durable sync.
    active: HashSet<DriverId>,
    /// Drivers snapshotted by an in-flight sync run.
    processing: HashSet<DriverId>,
}

impl State {
    fn remove_membership(&mut self, cell: CellIndex, driver_id: DriverId) {
        if let Some(members) = self.cells.get_mut(&cell) {
            members.remove(&driver_id);
            if members.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    fn drop_expired(&mut self, driver_id: DriverId) {
        if let Some(entry) = self.records.remove(&driver_id) {
            self.remove_membership(entry.record.cell, driver_id);
        }
    }
}

/// TTL-bearing in-memory store for driver positions.
pub struct PositionStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl PositionStore {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            ttl_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("position store lock")
    }

    /// Write a position record, refresh its TTL, update cell membership, and
    /// mark the driver dirty for the next sync run.
    ///
    /// A pre-existing live channel is preserved; position updates and
    /// connection lifecycle are independent.
    pub fn upsert(&self, write: PositionWrite) {
        let now = self.clock.now_ms();
        let expires_at_ms = now + self.ttl_ms;
        let mut state = self.lock();

        let prior = state.records.get(&write.driver_id);
        let prior_cell = prior.map(|e| e.record.cell);
        let channel = prior.and_then(|e| e.record.channel);

        if let Some(old_cell) = prior_cell {
            if old_cell != write.cell {
                state.remove_membership(old_cell, write.driver_id);
            }
        }

        state
            .cells
            .entry(write.cell)
            .or_default()
            .insert(write.driver_id, expires_at_ms);

        state.records.insert(
            write.driver_id,
            Entry {
                record: PositionRecord {
                    driver_id: write.driver_id,
                    user_id: write.user_id,
                    coordinates: write.coordinates,
                    cell: write.cell,
                    last_seen_ms: now,
                    is_online: write.is_online,
                    is_available: write.is_available,
                    channel,
                },
                expires_at_ms,
            },
        );

        // Idempotent; an update landing during a sync run re-dirties the
        // driver so the newer value wins at reconcile.
        state.active.insert(write.driver_id);
    }

    /// Current record, or `None` once the TTL has elapsed.
    pub fn get(&self, driver_id: DriverId) -> Option<PositionRecord> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        match state.records.get(&driver_id) {
            Some(entry) if entry.expires_at_ms > now => Some(entry.record.clone()),
            Some(_) => {
                state.drop_expired(driver_id);
                None
            }
            None => None,
        }
    }

    /// Union of live members across the given cells.
    pub fn members_of_cells(&self, cells: &[CellIndex]) -> HashSet<DriverId> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let mut members = HashSet::new();
        let mut expired: Vec<DriverId> = Vec::new();

        for cell in cells {
            if let Some(cell_members) = state.cells.get(cell) {
                for (&driver_id, &expires_at_ms) in cell_members {
                    if expires_at_ms > now {
                        members.insert(driver_id);
                    } else {
                        expired.push(driver_id);
                    }
                }
            }
        }
        for driver_id in expired {
            state.drop_expired(driver_id);
        }
        members
    }

    /// Mutate only the connection field. Does not refresh the TTL.
    /// Returns false if no live record exists.
    pub fn set_connection(&self, driver_id: DriverId, channel: Option<ChannelId>) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        match state.records.get_mut(&driver_id) {
            Some(entry) if entry.expires_at_ms > now => {
                entry.record.channel = channel;
                true
            }
            _ => false,
        }
    }

    /// Drop the channel on disconnect; position data persists so the driver
    /// can reconnect and continue.
    pub fn clear_on_disconnect(&self, driver_id: DriverId) {
        self.set_connection(driver_id, None);
    }

    /// Flip availability without refreshing the TTL. Returns false if no
    /// live record exists.
    pub fn set_availability(&self, driver_id: DriverId, is_available: bool) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        match state.records.get_mut(&driver_id) {
            Some(entry) if entry.expires_at_ms > now => {
                entry.record.is_available = is_available;
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Active-dirty set primitives for the sync worker
    // ------------------------------------------------------------------

    /// Atomically move the active-dirty set into processing and return the
    /// snapshot. Updates arriving afterwards accumulate in a fresh active
    /// set.
    pub fn snapshot_dirty(&self) -> Vec<DriverId> {
        let mut state = self.lock();
        let snapshot: Vec<DriverId> = state.active.drain().collect();
        state.processing.extend(snapshot.iter().copied());
        snapshot
    }

    /// Remove successfully persisted (or expired-in-flight) ids from
    /// processing.
    pub fn complete_processing(&self, ids: &[DriverId]) {
        let mut state = self.lock();
        for id in ids {
            state.processing.remove(id);
        }
    }

    /// Return failed ids to the active set. If a newer update already
    /// re-dirtied the driver, the processing copy is simply discarded so the
    /// newer value wins.
    pub fn requeue_failed(&self, ids: &[DriverId]) {
        let mut state = self.lock();
        for id in ids {
            if state.processing.remove(id) && !state.active.contains(id) {
                state.active.insert(*id);
            }
        }
    }

    /// Merge any leftover processing entries back into active. Called once
    /// at startup so a crash mid-run cannot silently lose updates.
    pub fn recover_processing(&self) -> usize {
        let mut state = self.lock();
        let leftover: Vec<DriverId> = state.processing.drain().collect();
        let count = leftover.len();
        for id in leftover {
            state.active.insert(id);
        }
        count
    }

    /// (active, processing) sizes, for sync status introspection and tests.
    pub fn dirty_sizes(&self) -> (usize, usize) {
        let state = self.lock();
        (state.active.len(), state.processing.len())
    }
}
