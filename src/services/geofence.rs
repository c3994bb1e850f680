//! Great-circle distance and circular fence containment

use crate::domain::types::Coordinate;
use crate::infra::config::Config;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points, in meters
pub fn distance_m(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi1 = a.lat().to_radians();
    let phi2 = b.lat().to_radians();
    let d_phi = (b.lat() - a.lat()).to_radians();
    let d_lambda = (b.lng() - a.lng()).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1 for antipodal points
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Boundary inclusive
#[inline]
pub fn within_fence(point: &Coordinate, center: &Coordinate, radius_m: f64) -> bool {
    distance_m(point, center) <= radius_m
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fence {
    pub center: Coordinate,
    pub radius_m: f64,
}

impl Fence {
    pub fn new(center: Coordinate, radius_m: f64) -> Self {
        Self { center, radius_m }
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        within_fence(point, &self.center, self.radius_m)
    }

    pub fn distance_to(&self, point: &Coordinate) -> f64 {
        distance_m(point, &self.center)
    }
}

/// Radii of the three fences the application uses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceRadii {
    /// Courier must be this close to the pick-up point to start a delivery
    pub pick_up_m: f64,
    /// Parcel counts as arrived inside this radius of the destination
    pub arrival_m: f64,
    /// Device test run ends inside this radius of the test marker
    pub device_test_m: f64,
}

impl Default for GeofenceRadii {
    fn default() -> Self {
        Self { pick_up_m: 50.0, arrival_m: 150.0, device_test_m: 20.0 }
    }
}

impl GeofenceRadii {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pick_up_m: config.pick_up_radius_m(),
            arrival_m: config.arrival_radius_m(),
            device_test_m: config.device_test_radius_m(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(lat: f64, lng: f64) -> Coordinate {
        Coordinate::new(lat, lng).unwrap()
    }

    #[test]
    fn test_identical_points() {
        let p = coord(-6.2, 106.8);
        assert_eq!(distance_m(&p, &p), 0.0);
        assert!(within_fence(&p, &p, 0.0));
    }

    #[test]
    fn test_antipodal_points() {
        let d = distance_m(&coord(0.0, 0.0), &coord(0.0, 180.0));
        assert!((d - 20_015_086.8).abs() < 1.0, "got {d}");
        let d = distance_m(&coord(90.0, 0.0), &coord(-90.0, 0.0));
        assert!((d - 20_015_086.8).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_symmetric() {
        let a = coord(-6.2, 106.8);
        let b = coord(-6.21, 106.83);
        assert!((distance_m(&a, &b) - distance_m(&b, &a)).abs() < 1e-9);
    }

    #[test]
    fn test_one_degree_latitude() {
        // pi * R / 180
        let d = distance_m(&coord(0.0, 0.0), &coord(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 0.1, "got {d}");
    }

    #[test]
    fn test_fence_boundary() {
        let center = coord(0.0, 0.0);
        let fence = Fence::new(center, 150.0);
        let deg_per_m = 180.0 / (std::f64::consts::PI * EARTH_RADIUS_M);
        assert!(fence.contains(&coord(100.0 * deg_per_m, 0.0)));
        assert!(!fence.contains(&coord(200.0 * deg_per_m, 0.0)));
        assert!((fence.distance_to(&coord(100.0 * deg_per_m, 0.0)) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_default_radii() {
        let radii = GeofenceRadii::default();
        assert_eq!(radii, GeofenceRadii::from_config(&Config::default()));
        assert_eq!(radii.arrival_m, 150.0);
    }
}
