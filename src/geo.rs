//! Geo-vector model: 3D/2D vectors with cartesian and polar views,
//! lat/lon conversion and great-circle discretization.
//!
//! Vectors store cartesian components only. Polar and lat/lon forms are
//! computed on demand, so a value can never hold two disagreeing
//! representations.

use crate::error::{Error, Result};
use serde::Serialize;
use std::f64::consts::{FRAC_PI_2, PI, TAU};
use std::ops::{Add, Div, Mul, Neg, Sub};

const DEG_TO_RAD: f64 = PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / PI;

/// Past this magnitude the subtraction loop would crawl; fold with `%` first.
const FOLD_THRESHOLD: f64 = TAU * 1024.0;

/// Bring an angle (radians) into `(-2π, 2π]` by whole turns.
pub fn normalize_angle(angle: f64) -> f64 {
    let mut angle = angle;
    if angle.abs() > FOLD_THRESHOLD {
        angle %= TAU;
    }
    while angle > TAU {
        angle -= TAU;
    }
    while angle <= -TAU {
        angle += TAU;
    }
    angle
}

// ============================================================================
// GeoCoordinate
// ============================================================================

/// Latitude/longitude in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GeoCoordinate {
    pub lat: f64,
    pub lon: f64,
}

impl GeoCoordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(Error::InvalidCoordinate { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    /// Planar (lat, lon) form used for path interpolation
    pub fn to_plane(self) -> PlaneVector {
        PlaneVector::from_cartesian(self.lat, self.lon)
    }

    /// Point on a sphere of the given radius
    pub fn to_space(self, radius: f64) -> SpaceVector {
        SpaceVector::from_lat_lon(self.lat, self.lon, radius)
    }
}

// ============================================================================
// SpaceVector (3D)
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SpaceVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SpaceVector {
    pub fn from_cartesian(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Build from (angle_xy, angle_xz, length). A negative length points
    /// the vector the opposite way.
    pub fn from_polar(angle_xy: f64, angle_xz: f64, length: f64) -> Self {
        let angle_xy = normalize_angle(angle_xy);
        let angle_xz = normalize_angle(angle_xz);
        let length_xy = angle_xz.cos() * length;
        Self {
            x: angle_xy.cos() * length_xy,
            y: angle_xy.sin() * length_xy,
            z: angle_xz.sin() * length,
        }
    }

    pub fn from_lat_lon(lat: f64, lon: f64, length: f64) -> Self {
        Self::from_polar(lon * DEG_TO_RAD, lat * DEG_TO_RAD, length)
    }

    pub fn cartesian(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }

    /// (angle_xy, angle_xz, length)
    pub fn polar(&self) -> (f64, f64, f64) {
        (self.angle_xy(), self.angle_xz(), self.length())
    }

    pub fn angle_xy(&self) -> f64 {
        self.y.atan2(self.x)
    }

    /// Elevation above the xy plane.
    pub fn angle_xz(&self) -> f64 {
        self.z.atan2(self.length_xy())
    }

    pub fn length_xy(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Same direction, new length
    pub fn with_length(&self, length: f64) -> Self {
        Self::from_polar(self.angle_xy(), self.angle_xz(), length)
    }

    pub fn with_angle_xy(&self, angle_xy: f64) -> Self {
        Self::from_polar(angle_xy, self.angle_xz(), self.length())
    }

    pub fn with_angle_xz(&self, angle_xz: f64) -> Self {
        Self::from_polar(self.angle_xy(), angle_xz, self.length())
    }

    /// (lat, lon) in degrees as a plane vector
    pub fn lat_lon(&self) -> PlaneVector {
        PlaneVector::from_cartesian(self.angle_xz() * RAD_TO_DEG, self.angle_xy() * RAD_TO_DEG)
    }

    /// Decompose into the part facing `direction` and two orthogonal carries.
    pub fn split(&self, direction: &SpaceVector) -> (SpaceVector, SpaceVector, SpaceVector) {
        let length = self.length();
        let (dir_xy, dir_xz) = (direction.angle_xy(), direction.angle_xz());
        let a = dir_xy - self.angle_xy();
        let b = dir_xz - self.angle_xz();

        let tmp = a.cos() * length;
        let carry_z = a.sin() * length;
        let facing = b.cos() * tmp;
        let carry_y = b.sin() * tmp;

        (
            SpaceVector::from_polar(dir_xy, dir_xz, facing),
            SpaceVector::from_polar(dir_xy - FRAC_PI_2, dir_xz, carry_y),
            SpaceVector::from_polar(dir_xy, dir_xz - FRAC_PI_2, carry_z),
        )
    }

    pub fn cross(&self, other: &SpaceVector) -> SpaceVector {
        SpaceVector::from_cartesian(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }
}

impl Add for SpaceVector {
    type Output = SpaceVector;

    fn add(self, other: SpaceVector) -> SpaceVector {
        SpaceVector::from_cartesian(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Add<f64> for SpaceVector {
    type Output = SpaceVector;

    fn add(self, other: f64) -> SpaceVector {
        SpaceVector::from_cartesian(self.x + other, self.y + other, self.z + other)
    }
}

impl Sub for SpaceVector {
    type Output = SpaceVector;

    fn sub(self, other: SpaceVector) -> SpaceVector {
        SpaceVector::from_cartesian(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Sub<f64> for SpaceVector {
    type Output = SpaceVector;

    fn sub(self, other: f64) -> SpaceVector {
        SpaceVector::from_cartesian(self.x - other, self.y - other, self.z - other)
    }
}

/// Rotation compose: angles add, lengths multiply.
impl Mul for SpaceVector {
    type Output = SpaceVector;

    fn mul(self, other: SpaceVector) -> SpaceVector {
        SpaceVector::from_polar(
            self.angle_xy() + other.angle_xy(),
            self.angle_xz() + other.angle_xz(),
            self.length() * other.length(),
        )
    }
}

impl Mul<f64> for SpaceVector {
    type Output = SpaceVector;

    fn mul(self, other: f64) -> SpaceVector {
        SpaceVector::from_cartesian(self.x * other, self.y * other, self.z * other)
    }
}

impl Div<f64> for SpaceVector {
    type Output = SpaceVector;

    fn div(self, other: f64) -> SpaceVector {
        SpaceVector::from_cartesian(self.x / other, self.y / other, self.z / other)
    }
}

impl Neg for SpaceVector {
    type Output = SpaceVector;

    fn neg(self) -> SpaceVector {
        SpaceVector::from_cartesian(-self.x, -self.y, -self.z)
    }
}

// ============================================================================
// PlaneVector (2D)
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PlaneVector {
    pub x: f64,
    pub y: f64,
}

impl PlaneVector {
    pub fn from_cartesian(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn from_polar(angle: f64, length: f64) -> Self {
        let angle = normalize_angle(angle);
        Self {
            x: angle.cos() * length,
            y: angle.sin() * length,
        }
    }

    pub fn xy(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    /// (angle, length)
    pub fn polar(&self) -> (f64, f64) {
        (self.angle(), self.length())
    }

    pub fn angle(&self) -> f64 {
        self.y.atan2(self.x)
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn with_length(&self, length: f64) -> Self {
        Self::from_polar(self.angle(), length)
    }

    pub fn with_angle(&self, angle: f64) -> Self {
        Self::from_polar(angle, self.length())
    }

    /// Split into (component along `direction`, orthogonal remainder).
    pub fn split_vector(&self, direction: &PlaneVector) -> (PlaneVector, PlaneVector) {
        let length = self.length();
        let a = direction.angle() - self.angle();
        let facing = PlaneVector::from_polar(direction.angle(), length * a.cos());
        let other = PlaneVector::from_polar(direction.angle() - FRAC_PI_2, length * a.sin());
        (facing, other)
    }
}

impl Add for PlaneVector {
    type Output = PlaneVector;

    fn add(self, other: PlaneVector) -> PlaneVector {
        PlaneVector::from_cartesian(self.x + other.x, self.y + other.y)
    }
}

impl Add<f64> for PlaneVector {
    type Output = PlaneVector;

    fn add(self, other: f64) -> PlaneVector {
        PlaneVector::from_cartesian(self.x + other, self.y + other)
    }
}

impl Sub for PlaneVector {
    type Output = PlaneVector;

    fn sub(self, other: PlaneVector) -> PlaneVector {
        PlaneVector::from_cartesian(self.x - other.x, self.y - other.y)
    }
}

impl Sub<f64> for PlaneVector {
    type Output = PlaneVector;

    fn sub(self, other: f64) -> PlaneVector {
        PlaneVector::from_cartesian(self.x - other, self.y - other)
    }
}

impl Mul for PlaneVector {
    type Output = PlaneVector;

    fn mul(self, other: PlaneVector) -> PlaneVector {
        PlaneVector::from_polar(self.angle() + other.angle(), self.length() * other.length())
    }
}

impl Mul<f64> for PlaneVector {
    type Output = PlaneVector;

    fn mul(self, other: f64) -> PlaneVector {
        PlaneVector::from_cartesian(self.x * other, self.y * other)
    }
}

impl Div<f64> for PlaneVector {
    type Output = PlaneVector;

    fn div(self, other: f64) -> PlaneVector {
        PlaneVector::from_cartesian(self.x / other, self.y / other)
    }
}

impl Neg for PlaneVector {
    type Output = PlaneVector;

    fn neg(self) -> PlaneVector {
        PlaneVector::from_cartesian(-self.x, -self.y)
    }
}

// ============================================================================
// Great-circle paths
// ============================================================================

/// Discretized path between two (lat, lon) points at a fixed radius.
///
/// The value is cheap to copy; every call to [`GreatCircle::points`]
/// starts a fresh walk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GreatCircle {
    start: PlaneVector,
    end: PlaneVector,
    step: PlaneVector,
    steps: usize,
    radius: f64,
}

/// Upper bound on steps per path, whatever the resolution.
pub const MAX_PATH_STEPS: usize = 1 << 16;

/// `resolution` is the angular step in degrees. Non-positive or non-finite
/// resolutions collapse the path to a single step; tiny ones are capped at
/// [`MAX_PATH_STEPS`].
pub fn great_circle_path(pos1: PlaneVector, pos2: PlaneVector, radius: f64, resolution: f64) -> GreatCircle {
    let delta = pos2 - pos1;
    let steps = if resolution > 0.0 && resolution.is_finite() {
        let n = (delta.length() / resolution).round();
        if n >= MAX_PATH_STEPS as f64 {
            MAX_PATH_STEPS
        } else if n >= 1.0 {
            n as usize
        } else {
            1
        }
    } else {
        1
    };

    GreatCircle {
        start: pos1,
        end: pos2,
        step: delta / steps as f64,
        steps,
        radius,
    }
}

impl GreatCircle {
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn points(&self) -> GreatCirclePoints {
        GreatCirclePoints { path: *self, index: 0 }
    }
}

impl IntoIterator for GreatCircle {
    type Item = SpaceVector;
    type IntoIter = GreatCirclePoints;

    fn into_iter(self) -> GreatCirclePoints {
        self.points()
    }
}

/// Lazy walk over a [`GreatCircle`], both endpoints included
#[derive(Clone, Debug)]
pub struct GreatCirclePoints {
    path: GreatCircle,
    index: usize,
}

impl Iterator for GreatCirclePoints {
    type Item = SpaceVector;

    fn next(&mut self) -> Option<SpaceVector> {
        let path = &self.path;
        if self.index > path.steps {
            return None;
        }

        // Land exactly on the end point instead of accumulating drift
        let at = if self.index == path.steps {
            path.end
        } else {
            path.start + path.step * self.index as f64
        };
        self.index += 1;

        Some(SpaceVector::from_lat_lon(at.x, at.y, path.radius))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.path.steps.saturating_add(1).saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GreatCirclePoints {}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn cartesian_polar_round_trip() {
        let samples = [
            (1.0, 0.0, 0.0),
            (1.0, 1.0, 1.0),
            (-3.5, 2.0, -0.25),
            (0.0, -4.0, 7.0),
            (-1.0, -1.0, 0.5),
            (0.2, 0.0, -9.0),
        ];
        for (x, y, z) in samples {
            let v = SpaceVector::from_cartesian(x, y, z);
            let (axy, axz, len) = v.polar();
            let back = SpaceVector::from_polar(axy, axz, len);
            assert!(close(back.x, x) && close(back.y, y) && close(back.z, z), "{:?} -> {:?}", v, back);
        }
    }

    #[test]
    fn normalize_angle_is_bounded_and_idempotent() {
        for a in [0.0, 1.0, -1.0, TAU, -TAU, 3.0 * TAU + 0.5, -7.0 * TAU - 0.1, 1e9, -1e9, 12.0] {
            let n = normalize_angle(a);
            assert!(n > -TAU && n <= TAU, "{} -> {}", a, n);
            assert_eq!(normalize_angle(n), n);
        }
    }

    #[test]
    fn normalize_angle_keeps_in_range_values() {
        assert_eq!(normalize_angle(TAU), TAU);
        assert_eq!(normalize_angle(-1.5), -1.5);
        assert!(close(normalize_angle(-TAU), 0.0));
    }

    #[test]
    fn lat_lon_recovered() {
        for lat in [-89.0, -45.5, 0.0, 12.25, 60.0, 89.9] {
            for lon in [-179.0, -90.0, 0.0, 33.3, 120.0, 180.0] {
                let ll = SpaceVector::from_lat_lon(lat, lon, 1.0).lat_lon();
                assert!((ll.x - lat).abs() < 1e-6, "lat {} -> {}", lat, ll.x);
                assert!((ll.y - lon).abs() < 1e-6, "lon {} -> {}", lon, ll.y);
            }
        }
    }

    #[test]
    fn lat_lon_scales_with_radius() {
        let v = SpaceVector::from_lat_lon(10.0, 20.0, 3.0);
        assert!(close(v.length(), 3.0));
        let ll = v.lat_lon();
        assert!((ll.x - 10.0).abs() < 1e-9);
        assert!((ll.y - 20.0).abs() < 1e-9);
    }

    #[test]
    fn negative_length_flips_direction() {
        let v = SpaceVector::from_polar(0.0, 0.0, -2.0);
        assert!(close(v.x, -2.0) && close(v.y, 0.0) && close(v.z, 0.0));
        assert!(close(v.length(), 2.0));
    }

    #[test]
    fn with_length_rescales_without_turning() {
        let v = SpaceVector::from_cartesian(1.0, 2.0, 2.0);
        let w = v.with_length(6.0);
        assert!(close(w.x, 2.0) && close(w.y, 4.0) && close(w.z, 4.0));
    }

    #[test]
    fn arithmetic() {
        let a = SpaceVector::from_cartesian(1.0, 2.0, 3.0);
        let b = SpaceVector::from_cartesian(0.5, -1.0, 2.0);
        assert_eq!(a + b, SpaceVector::from_cartesian(1.5, 1.0, 5.0));
        assert_eq!(a + 1.0, SpaceVector::from_cartesian(2.0, 3.0, 4.0));
        assert_eq!(a * 2.0, SpaceVector::from_cartesian(2.0, 4.0, 6.0));
        assert_eq!(a / 2.0, SpaceVector::from_cartesian(0.5, 1.0, 1.5));
        assert_eq!(-a, SpaceVector::from_cartesian(-1.0, -2.0, -3.0));
    }

    #[test]
    fn multiply_composes_rotations() {
        let a = SpaceVector::from_polar(0.3, 0.1, 2.0);
        let b = SpaceVector::from_polar(0.4, 0.2, 1.5);
        let (axy, axz, len) = (a * b).polar();
        assert!(close(axy, 0.7));
        assert!(close(axz, 0.3));
        assert!(close(len, 3.0));
    }

    #[test]
    fn cross_product_of_axes() {
        let x = SpaceVector::from_cartesian(1.0, 0.0, 0.0);
        let y = SpaceVector::from_cartesian(0.0, 1.0, 0.0);
        assert_eq!(x.cross(&y), SpaceVector::from_cartesian(0.0, 0.0, 1.0));
        assert_eq!(y.cross(&x), SpaceVector::from_cartesian(0.0, 0.0, -1.0));
    }

    #[test]
    fn split_vector_components_sum_back() {
        let v = PlaneVector::from_cartesian(3.0, 1.0);
        let dir = PlaneVector::from_polar(0.8, 1.0);
        let (facing, other) = v.split_vector(&dir);
        let sum = facing + other;
        assert!(close(sum.x, v.x) && close(sum.y, v.y));
        assert!(close(facing.angle(), 0.8) || close(facing.length(), 0.0));
    }

    #[test]
    fn split_along_own_direction() {
        let v = SpaceVector::from_polar(0.5, 0.25, 4.0);
        let (facing, carry_y, carry_z) = v.split(&v);
        assert!(close(facing.x, v.x) && close(facing.y, v.y) && close(facing.z, v.z));
        assert!(close(carry_y.length(), 0.0));
        assert!(close(carry_z.length(), 0.0));
    }

    #[test]
    fn great_circle_includes_both_endpoints() {
        let from = GeoCoordinate::new(48.2, 16.4).unwrap();
        let to = GeoCoordinate::new(40.7, -74.0).unwrap();
        let path = great_circle_path(from.to_plane(), to.to_plane(), 1.4, 2.0);

        let points: Vec<_> = path.points().collect();
        assert_eq!(points.len(), path.steps() + 1);

        let first = points[0].lat_lon();
        let last = points[points.len() - 1].lat_lon();
        assert!((first.x - 48.2).abs() < 1e-6 && (first.y - 16.4).abs() < 1e-6);
        assert!((last.x - 40.7).abs() < 1e-6 && (last.y + 74.0).abs() < 1e-6);
        assert!(points.iter().all(|p| (p.length() - 1.4).abs() < 1e-9));
    }

    #[test]
    fn great_circle_step_count_rounds() {
        let a = PlaneVector::from_cartesian(0.0, 0.0);
        let b = PlaneVector::from_cartesian(0.0, 9.0);
        assert_eq!(great_circle_path(a, b, 1.0, 2.0).steps(), 5);
        assert_eq!(great_circle_path(a, b, 1.0, 4.0).steps(), 2);
    }

    #[test]
    fn great_circle_degenerate_paths_have_one_step() {
        let a = PlaneVector::from_cartesian(10.0, 10.0);
        assert_eq!(great_circle_path(a, a, 1.0, 2.0).steps(), 1);
        assert_eq!(great_circle_path(a, a + 50.0, 1.0, 0.0).steps(), 1);
        assert_eq!(great_circle_path(a, a, 1.0, 2.0).points().count(), 2);
    }

    #[test]
    fn great_circle_steps_are_capped() {
        let a = PlaneVector::from_cartesian(0.0, 0.0);
        let b = PlaneVector::from_cartesian(40.0, 90.0);
        let path = great_circle_path(a, b, 1.0, 1e-300);
        assert_eq!(path.steps(), MAX_PATH_STEPS);

        assert_eq!(path.points().len(), MAX_PATH_STEPS + 1);
        let last = path.points().last().unwrap().lat_lon();
        assert!((last.x - 40.0).abs() < 1e-6 && (last.y - 90.0).abs() < 1e-6);
    }

    #[test]
    fn great_circle_is_restartable() {
        let path = great_circle_path(
            PlaneVector::from_cartesian(0.0, 0.0),
            PlaneVector::from_cartesian(10.0, 10.0),
            2.0,
            1.0,
        );
        let first: Vec<_> = path.points().collect();
        let second: Vec<_> = path.into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn coordinate_range_is_checked() {
        assert!(GeoCoordinate::new(90.0, 180.0).is_ok());
        assert!(GeoCoordinate::new(-90.0, -180.0).is_ok());
        assert!(matches!(GeoCoordinate::new(91.0, 0.0), Err(Error::InvalidCoordinate { .. })));
        assert!(GeoCoordinate::new(0.0, 180.5).is_err());
        assert!(GeoCoordinate::new(f64::NAN, 0.0).is_err());
    }
}
