//! Fare quotation for dispatch offers.

/// Base fare in currency units.
pub const BASE_FARE: f64 = 2.50;

/// Per-kilometer rate in currency units.
pub const PER_KM_RATE: f64 = 1.50;

/// Quote the fare for a trip of the given road distance.
///
/// Formula: `fare = BASE_FARE + (distance_km * PER_KM_RATE)`, rounded to
/// cents. The quoted fare is frozen into the offer at dispatch time.
pub fn quote_fare(distance_km: f64) -> f64 {
    let raw = BASE_FARE + (distance_km.max(0.0) * PER_KM_RATE);
    (raw * 100.0).round() / 100.0
}
