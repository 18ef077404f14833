//! Displacement filter for location fixes.

use crate::constants::{DISTANCE_FILTER_METERS, EARTH_RADIUS_METERS};
use crate::protocol::GeoPoint;

/// Great-circle distance between two points, in meters (haversine).
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Suppresses fixes closer than a threshold to the last accepted one.
#[derive(Debug, Clone)]
pub struct DistanceFilter {
    threshold_meters: f64,
    last_accepted: Option<GeoPoint>,
}

impl Default for DistanceFilter {
    fn default() -> Self {
        Self::new(DISTANCE_FILTER_METERS)
    }
}

impl DistanceFilter {
    /// Filter with a custom threshold.
    pub fn new(threshold_meters: f64) -> Self {
        Self {
            threshold_meters,
            last_accepted: None,
        }
    }

    /// Accept `point` if it is the first fix or at least the threshold away.
    pub fn accept(&mut self, point: GeoPoint) -> bool {
        let accepted = match self.last_accepted {
            None => true,
            Some(last) => haversine_meters(last, point) >= self.threshold_meters,
        };
        if accepted {
            self.last_accepted = Some(point);
        }
        accepted
    }

    /// Forget the last accepted fix.
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }

    /// Threshold in meters.
    pub fn threshold_meters(&self) -> f64 {
        self.threshold_meters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One degree of latitude is ~111.2 km, so 0.0001° ≈ 11 m.
    const TEN_METERS_NORTH: f64 = 0.00009;

    #[test]
    fn test_haversine_known_distance() {
        // Chicago → Milwaukee, roughly 130 km.
        let chicago = GeoPoint::new(41.8781, -87.6298);
        let milwaukee = GeoPoint::new(43.0389, -87.9065);
        let d = haversine_meters(chicago, milwaukee);
        assert!((d - 130_000.0).abs() < 3_000.0, "distance was {d}");
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        let p = GeoPoint::new(10.0, 20.0);
        assert!(haversine_meters(p, p).abs() < f64::EPSILON);
    }

    #[test]
    fn test_first_fix_always_accepted() {
        let mut filter = DistanceFilter::default();
        assert!(filter.accept(GeoPoint::new(0.0, 0.0)));
    }

    #[test]
    fn test_small_moves_suppressed_until_threshold() {
        let mut filter = DistanceFilter::default();
        let origin = GeoPoint::new(40.0, -75.0);
        assert!(filter.accept(origin));

        // Four ~10 m steps stay within 50 m of the origin.
        for step in 1..=4 {
            let p = GeoPoint::new(origin.latitude + TEN_METERS_NORTH * f64::from(step), origin.longitude);
            assert!(!filter.accept(p), "step {step} should be suppressed");
        }

        // ~60 m away from the last accepted fix.
        let far = GeoPoint::new(origin.latitude + TEN_METERS_NORTH * 6.0, origin.longitude);
        assert!(filter.accept(far));

        // Distance is measured from the new anchor now.
        let near_far = GeoPoint::new(far.latitude + TEN_METERS_NORTH, far.longitude);
        assert!(!filter.accept(near_far));
    }

    #[test]
    fn test_reset_accepts_next_fix() {
        let mut filter = DistanceFilter::default();
        let p = GeoPoint::new(1.0, 1.0);
        assert!(filter.accept(p));
        assert!(!filter.accept(p));
        filter.reset();
        assert!(filter.accept(p));
    }
}
