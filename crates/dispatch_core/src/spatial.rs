//! Spatial operations: H3-based geographic indexing and distance calculations.
//!
//! This module provides:
//!
//! - **Cell codec**: Map (lat, lng) to the resolution-9 cell used everywhere
//! - **Grid disk / ring queries**: Cells within (or at exactly) K grid distance
//! - **Distance calculations**: Haversine distance between coordinates or cells
//!
//! Resolution 9 (~170m edge) keeps a city block to a handful of cells, so the
//! expanding-ring search rarely needs more than two rings. Clients compute the
//! same cell locally; the codec is pure so both sides agree bit for bit.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;

use crate::error::{DispatchError, Result};

/// The one resolution the whole system indexes at.
pub const CELL_RESOLUTION: Resolution = Resolution::Nine;

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Map coordinates to their resolution-9 cell.
pub fn cell_of(lat: f64, lng: f64) -> Result<CellIndex> {
    let point =
        LatLng::new(lat, lng).map_err(|_| DispatchError::InvalidCoordinates { lat, lng })?;
    Ok(point.to_cell(CELL_RESOLUTION))
}

/// Straight-line distance between two (lat, lng) points in kilometres.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Uncached cell-to-cell distance (internal use).
fn distance_km_between_cells_uncached(a: CellIndex, b: CellIndex) -> f64 {
    let a: LatLng = a.into();
    let b: LatLng = b.into();
    haversine_km((a.lat(), a.lng()), (b.lat(), b.lng()))
}

/// Global distance cache (50,000 entries, ~800KB memory).
fn get_distance_cache() -> &'static Mutex<LruCache<(CellIndex, CellIndex), f64>> {
    static CACHE: OnceLock<Mutex<LruCache<(CellIndex, CellIndex), f64>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(50_000).expect("cache size must be non-zero"),
        ))
    })
}

/// Calculate distance between two H3 cells with LRU caching.
pub fn distance_km_between_cells(a: CellIndex, b: CellIndex) -> f64 {
    // Use symmetric key (smaller cell first) to maximize cache hits
    let key = if a < b { (a, b) } else { (b, a) };

    let mut cache = match get_distance_cache().lock() {
        Ok(guard) => guard,
        Err(_) => return distance_km_between_cells_uncached(key.0, key.1),
    };

    *cache.get_or_insert(key, || distance_km_between_cells_uncached(key.0, key.1))
}

/// Grid disk cache for nearby-driver searches.
struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(1_000).expect("cache size must be non-zero"),
            )),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(_) => return origin.grid_disk::<Vec<_>>(k),
        };
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

static GRID_DISK_CACHE: OnceLock<GridDiskCache> = OnceLock::new();

fn get_grid_disk_cache() -> &'static GridDiskCache {
    GRID_DISK_CACHE.get_or_init(GridDiskCache::new)
}

/// All cells within graph distance `k` of `origin` (k=0 is the origin alone).
pub fn grid_disk_cached(origin: CellIndex, k: u32) -> Vec<CellIndex> {
    get_grid_disk_cache().get_or_compute(origin, k)
}

/// Cells at graph distance exactly `k` from `origin`.
///
/// Computed as disk(k) minus disk(k-1); with the disk cache warm this costs
/// two cache hits. The expanding-ring search uses this so ring k never
/// rescans cells already covered at k-1.
pub fn ring_at(origin: CellIndex, k: u32) -> Vec<CellIndex> {
    if k == 0 {
        return vec![origin];
    }
    let outer = grid_disk_cached(origin, k);
    let inner: std::collections::HashSet<CellIndex> =
        grid_disk_cached(origin, k - 1).into_iter().collect();
    outer.into_iter().filter(|c| !inner.contains(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BERLIN: (f64, f64) = (52.5200, 13.4050);

    #[test]
    fn cell_of_is_deterministic_at_resolution_nine() {
        let a = cell_of(BERLIN.0, BERLIN.1).expect("cell");
        let b = cell_of(BERLIN.0, BERLIN.1).expect("cell");
        assert_eq!(a, b);
        assert_eq!(a.resolution(), CELL_RESOLUTION);
    }

    #[test]
    fn cell_of_rejects_out_of_range_coordinates() {
        assert!(cell_of(123.0, 13.4).is_err());
        assert!(cell_of(52.5, 543.0).is_err());
    }

    #[test]
    fn grid_disk_contains_origin_and_neighbors() {
        let origin = cell_of(BERLIN.0, BERLIN.1).expect("cell");
        let cells = grid_disk_cached(origin, 1);

        assert!(cells.contains(&origin));
        assert_eq!(cells.len(), 7);
        for cell in cells {
            let distance = origin.grid_distance(cell).expect("grid distance");
            assert!(distance <= 1);
        }
    }

    #[test]
    fn ring_at_returns_only_exact_distance() {
        let origin = cell_of(BERLIN.0, BERLIN.1).expect("cell");

        assert_eq!(ring_at(origin, 0), vec![origin]);

        let ring2 = ring_at(origin, 2);
        assert_eq!(ring2.len(), 12);
        for cell in ring2 {
            assert_eq!(origin.grid_distance(cell).expect("grid distance"), 2);
        }
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Berlin Alexanderplatz to Berlin Zoo is roughly 5.7 km.
        let alexanderplatz = (52.5219, 13.4132);
        let zoo = (52.5076, 13.3320);
        let km = haversine_km(alexanderplatz, zoo);
        assert!((5.0..6.5).contains(&km), "got {km}");
    }

    #[test]
    fn cell_distance_agrees_with_coordinate_distance() {
        let a = cell_of(52.5200, 13.4050).expect("cell");
        let b = cell_of(52.5300, 13.4200).expect("cell");
        let by_cell = distance_km_between_cells(a, b);
        let by_coord = haversine_km((52.5200, 13.4050), (52.5300, 13.4200));
        // Cell centroids shift each endpoint by at most one cell edge.
        assert!((by_cell - by_coord).abs() < 0.5);
    }
}
