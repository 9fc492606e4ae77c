//! Coordinate types and planar/profile geometry
//!
//! Provides the 3D scene coordinate, the 2D unfolded-profile point, axis
//! aligned envelopes and the small set of geometric primitives the profile
//! and path machinery is built on: segment intersection, point projection,
//! barycentric triangle tests, ordinary least squares mean-plane fitting
//! and convex hulls.
//!
//! All heights are metres; the plan coordinate system is an arbitrary
//! metric projection shared by every scene input.

use serde::{Deserialize, Serialize};

/// 3D scene coordinate in metres.
///
/// A `z` of NaN on input geometry means "resolve from the terrain".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate with unresolved height.
    pub fn flat(x: f64, y: f64) -> Self {
        Self { x, y, z: f64::NAN }
    }

    /// Planar distance to another coordinate in metres.
    pub fn distance_2d(&self, other: &Coord) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Full 3D distance to another coordinate in metres.
    pub fn distance_3d(&self, other: &Coord) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        if dz.is_nan() {
            return self.distance_2d(other);
        }
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Planar equality within an absolute tolerance.
    pub fn same_position_2d(&self, other: &Coord, eps: f64) -> bool {
        (self.x - other.x).abs() <= eps && (self.y - other.y).abs() <= eps
    }

    /// Ordering used by cut profiles: x first, then y.
    pub fn cmp_position(&self, other: &Coord) -> std::cmp::Ordering {
        self.x
            .partial_cmp(&other.x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                self.y
                    .partial_cmp(&other.y)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    }
}

/// Point in the unfolded vertical profile plane: `x` is the distance along
/// the propagation direction, `y` is the height.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pt2 {
    pub x: f64,
    pub y: f64,
}

impl Pt2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Pt2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis aligned bounding box over plan coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Envelope of two coordinates.
    pub fn of(a: &Coord, b: &Coord) -> Self {
        Self {
            min_x: a.x.min(b.x),
            min_y: a.y.min(b.y),
            max_x: a.x.max(b.x),
            max_y: a.y.max(b.y),
        }
    }

    /// Degenerate envelope of one coordinate.
    pub fn of_coord(c: &Coord) -> Self {
        Self {
            min_x: c.x,
            min_y: c.y,
            max_x: c.x,
            max_y: c.y,
        }
    }

    pub fn expand_by(&mut self, margin: f64) {
        self.min_x -= margin;
        self.min_y -= margin;
        self.max_x += margin;
        self.max_y += margin;
    }

    pub fn expand_to_include(&mut self, c: &Coord) {
        self.min_x = self.min_x.min(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_x = self.max_x.max(c.x);
        self.max_y = self.max_y.max(c.y);
    }

    pub fn merge(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }
}

/// Projection factor of `p` on the infinite line through `a` and `b`.
///
/// 0 maps to `a`, 1 to `b`; values outside [0, 1] lie beyond the segment.
pub fn segment_fraction(a: &Coord, b: &Coord, p: &Coord) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 <= f64::EPSILON {
        return 0.0;
    }
    ((p.x - a.x) * dx + (p.y - a.y) * dy) / len2
}

/// Point at fraction `t` along the plan segment `a`-`b`, height included.
pub fn point_along(a: &Coord, b: &Coord, t: f64) -> Coord {
    Coord::new(
        a.x + (b.x - a.x) * t,
        a.y + (b.y - a.y) * t,
        a.z + (b.z - a.z) * t,
    )
}

/// Height of the straight line `a`-`b` above the plan position of `p`.
pub fn line_z_at(a: &Coord, b: &Coord, p: &Coord) -> f64 {
    let t = segment_fraction(a, b, p);
    a.z + (b.z - a.z) * t
}

/// 2D intersection of segments `a0`-`a1` and `b0`-`b1`.
///
/// Collinear overlaps report no intersection; endpoint touches do.
pub fn segment_intersection_2d(a0: &Coord, a1: &Coord, b0: &Coord, b1: &Coord) -> Option<Coord> {
    let d1x = a1.x - a0.x;
    let d1y = a1.y - a0.y;
    let d2x = b1.x - b0.x;
    let d2y = b1.y - b0.y;
    let denom = d1x * d2y - d1y * d2x;
    if denom.abs() <= f64::EPSILON {
        return None;
    }
    let sx = b0.x - a0.x;
    let sy = b0.y - a0.y;
    let t = (sx * d2y - sy * d2x) / denom;
    let u = (sx * d1y - sy * d1x) / denom;
    let eps = 1e-12;
    if t < -eps || t > 1.0 + eps || u < -eps || u > 1.0 + eps {
        return None;
    }
    Some(Coord::new(a0.x + t * d1x, a0.y + t * d1y, f64::NAN))
}

/// True when segments `a0`-`a1` and `b0`-`b1` cross in plan, touches at the
/// endpoints of the first segment excluded.
pub fn segments_cross_2d(a0: &Coord, a1: &Coord, b0: &Coord, b1: &Coord) -> bool {
    match segment_intersection_2d(a0, a1, b0, b1) {
        Some(p) => {
            let eps = 1e-9;
            !p.same_position_2d(a0, eps) && !p.same_position_2d(a1, eps)
        }
        None => false,
    }
}

/// 3D distance from `p` to the segment `a`-`b`.
pub fn distance_point_segment_3d(p: &Coord, a: &Coord, b: &Coord) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let dz = b.z - a.z;
    let len2 = dx * dx + dy * dy + dz * dz;
    let t = if len2 <= f64::EPSILON {
        0.0
    } else {
        (((p.x - a.x) * dx + (p.y - a.y) * dy + (p.z - a.z) * dz) / len2).clamp(0.0, 1.0)
    };
    let cx = a.x + t * dx - p.x;
    let cy = a.y + t * dy - p.y;
    let cz = a.z + t * dz - p.z;
    (cx * cx + cy * cy + cz * cz).sqrt()
}

/// Side of the directed line `p0`->`p1` the point `q` falls on, in the
/// profile plane: 1 left (above), -1 right (below), 0 on the line.
pub fn orientation_index(p0: &Pt2, p1: &Pt2, q: &Pt2) -> f64 {
    let cross = (p1.x - p0.x) * (q.y - p0.y) - (p1.y - p0.y) * (q.x - p0.x);
    if cross > 1e-12 {
        1.0
    } else if cross < -1e-12 {
        -1.0
    } else {
        0.0
    }
}

/// Orthogonal projection of `p` onto the line `y = a*x + b`.
pub fn project_on_mean_plane(p: &Pt2, a: f64, b: f64) -> Pt2 {
    if a.abs() <= f64::EPSILON {
        return Pt2::new(p.x, b);
    }
    let x = (p.x + a * (p.y - b)) / (a * a + 1.0);
    Pt2::new(x, a * x + b)
}

/// Ordinary least squares fit `y = a*x + b` over profile points.
///
/// A fit over fewer than two distinct abscissae degenerates to a
/// horizontal plane at the mean height.
pub fn mean_plane(points: &[Pt2]) -> (f64, f64) {
    let n = points.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean_x: f64 = points.iter().map(|p| p.x).sum::<f64>() / n as f64;
    let mean_y: f64 = points.iter().map(|p| p.y).sum::<f64>() / n as f64;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for p in points {
        sxx += (p.x - mean_x) * (p.x - mean_x);
        sxy += (p.x - mean_x) * (p.y - mean_y);
    }
    if sxx <= f64::EPSILON {
        return (0.0, mean_y);
    }
    let a = sxy / sxx;
    (a, mean_y - a * mean_x)
}

/// Unfold 3D profile coordinates into the vertical plane of their straight
/// line: `x` becomes the plan distance from the first point, `y` the height.
pub fn unfold(points: &[Coord]) -> Vec<Pt2> {
    match points.first() {
        Some(origin) => points
            .iter()
            .map(|p| Pt2::new(origin.distance_2d(p), p.z))
            .collect(),
        None => Vec::new(),
    }
}

/// Unfold a polyline by cumulative plan distance, for paths that bend in
/// plan (side hulls, reflection chains).
pub fn unfold_cumulative(points: &[Coord]) -> Vec<Pt2> {
    let mut out = Vec::with_capacity(points.len());
    let mut d = 0.0;
    let mut prev: Option<&Coord> = None;
    for p in points {
        if let Some(q) = prev {
            d += q.distance_2d(p);
        }
        out.push(Pt2::new(d, p.z));
        prev = Some(p);
    }
    out
}

/// Barycentric height interpolation of `p` inside triangle `a`,`b`,`c`.
pub fn interpolate_z_triangle(p: &Coord, a: &Coord, b: &Coord, c: &Coord) -> f64 {
    let det = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);
    if det.abs() <= f64::EPSILON {
        return (a.z + b.z + c.z) / 3.0;
    }
    let l1 = ((b.y - c.y) * (p.x - c.x) + (c.x - b.x) * (p.y - c.y)) / det;
    let l2 = ((c.y - a.y) * (p.x - c.x) + (a.x - c.x) * (p.y - c.y)) / det;
    let l3 = 1.0 - l1 - l2;
    l1 * a.z + l2 * b.z + l3 * c.z
}

/// Barycentric containment test, with the distance the point falls outside
/// the triangle as a second result for nearest-match lookups.
pub fn in_triangle(p: &Coord, a: &Coord, b: &Coord, c: &Coord) -> (bool, f64) {
    let det = (b.y - c.y) * (a.x - c.x) + (c.x - b.x) * (a.y - c.y);
    if det.abs() <= f64::EPSILON {
        return (false, f64::MAX);
    }
    let l1 = ((b.y - c.y) * (p.x - c.x) + (c.x - b.x) * (p.y - c.y)) / det;
    let l2 = ((c.y - a.y) * (p.x - c.x) + (a.x - c.x) * (p.y - c.y)) / det;
    let l3 = 1.0 - l1 - l2;
    let mut err = 0.0;
    for l in [l1, l2, l3] {
        if l < 0.0 {
            err += -l;
        } else if l > 1.0 {
            err += l - 1.0;
        }
    }
    (err <= 1e-9, err)
}

/// Monotone chain convex hull over plan coordinates.
///
/// Returns a counter-clockwise closed ring (first vertex repeated at the
/// end). Input heights travel with their vertices. Fewer than 3 distinct
/// points return the input as-is, closed.
pub fn convex_hull(points: &[Coord]) -> Vec<Coord> {
    let mut pts: Vec<Coord> = points.to_vec();
    pts.sort_by(|a, b| a.cmp_position(b));
    pts.dedup_by(|a, b| a.same_position_2d(b, 1e-12));
    let n = pts.len();
    if n < 3 {
        let mut ring = pts;
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
        return ring;
    }
    let cross = |o: &Coord, a: &Coord, b: &Coord| -> f64 {
        (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
    };
    let mut hull: Vec<Coord> = Vec::with_capacity(2 * n);
    // Lower chain
    for p in &pts {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    // Upper chain; ends by re-pushing the first point, closing the ring
    let lower_len = hull.len() + 1;
    for p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    hull
}

/// Perimeter of a closed plan ring.
pub fn ring_length(ring: &[Coord]) -> f64 {
    ring.windows(2).map(|w| w[0].distance_2d(&w[1])).sum()
}

/// Mirror image of `p` across the infinite plan line through `a`-`b`.
/// The height of `p` is preserved.
pub fn mirror_2d(p: &Coord, a: &Coord, b: &Coord) -> Coord {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 <= f64::EPSILON {
        return *p;
    }
    let t = ((p.x - a.x) * dx + (p.y - a.y) * dy) / len2;
    let fx = a.x + t * dx;
    let fy = a.y + t * dy;
    Coord::new(2.0 * fx - p.x, 2.0 * fy - p.y, p.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_intersection() {
        let a0 = Coord::new(0.0, 0.0, 0.0);
        let a1 = Coord::new(10.0, 0.0, 0.0);
        let b0 = Coord::new(5.0, -5.0, 0.0);
        let b1 = Coord::new(5.0, 5.0, 0.0);
        let p = segment_intersection_2d(&a0, &a1, &b0, &b1).unwrap();
        assert!((p.x - 5.0).abs() < 1e-12);
        assert!(p.y.abs() < 1e-12);
        // Disjoint
        let c0 = Coord::new(20.0, -5.0, 0.0);
        let c1 = Coord::new(20.0, 5.0, 0.0);
        assert!(segment_intersection_2d(&a0, &a1, &c0, &c1).is_none());
    }

    #[test]
    fn test_mean_plane_fits_slope() {
        let pts: Vec<Pt2> = (0..10).map(|i| Pt2::new(i as f64, 2.0 * i as f64 + 1.0)).collect();
        let (a, b) = mean_plane(&pts);
        assert!((a - 2.0).abs() < 1e-9);
        assert!((b - 1.0).abs() < 1e-9);
        // Flat profile
        let flat: Vec<Pt2> = (0..5).map(|i| Pt2::new(i as f64, 3.5)).collect();
        let (a, b) = mean_plane(&flat);
        assert!(a.abs() < 1e-12);
        assert!((b - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_project_on_mean_plane() {
        // Horizontal plane: projection drops straight down
        let p = project_on_mean_plane(&Pt2::new(3.0, 7.0), 0.0, 1.0);
        assert!((p.x - 3.0).abs() < 1e-12);
        assert!((p.y - 1.0).abs() < 1e-12);
        // 45 degree plane through origin
        let q = project_on_mean_plane(&Pt2::new(0.0, 2.0), 1.0, 0.0);
        assert!((q.x - 1.0).abs() < 1e-12);
        assert!((q.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_convex_hull_square() {
        let mut pts = vec![
            Coord::new(0.0, 0.0, 0.0),
            Coord::new(4.0, 0.0, 0.0),
            Coord::new(4.0, 4.0, 0.0),
            Coord::new(0.0, 4.0, 0.0),
        ];
        // Interior points must not survive
        pts.push(Coord::new(2.0, 2.0, 0.0));
        pts.push(Coord::new(1.0, 3.0, 0.0));
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 5);
        assert!(hull[0].same_position_2d(&hull[4], 1e-12));
        assert!((ring_length(&hull) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_hull_is_counter_clockwise() {
        let pts = vec![
            Coord::new(0.0, 0.0, 0.0),
            Coord::new(2.0, 0.0, 0.0),
            Coord::new(1.0, 2.0, 0.0),
        ];
        let hull = convex_hull(&pts);
        let mut area2 = 0.0;
        for w in hull.windows(2) {
            area2 += w[0].x * w[1].y - w[1].x * w[0].y;
        }
        assert!(area2 > 0.0, "signed area should be positive for CCW");
    }

    #[test]
    fn test_triangle_interpolation() {
        let a = Coord::new(0.0, 0.0, 0.0);
        let b = Coord::new(10.0, 0.0, 0.0);
        let c = Coord::new(0.0, 10.0, 10.0);
        let p = Coord::new(2.0, 2.0, f64::NAN);
        let z = interpolate_z_triangle(&p, &a, &b, &c);
        assert!((z - 2.0).abs() < 1e-9);
        let (inside, err) = in_triangle(&p, &a, &b, &c);
        assert!(inside);
        assert!(err < 1e-12);
        let (outside, err) = in_triangle(&Coord::new(20.0, 20.0, 0.0), &a, &b, &c);
        assert!(!outside);
        assert!(err > 0.0);
    }

    #[test]
    fn test_mirror_2d() {
        let a = Coord::new(5.0, -1.0, 0.0);
        let b = Coord::new(5.0, 1.0, 0.0);
        let m = mirror_2d(&Coord::new(2.0, 0.0, 1.5), &a, &b);
        assert!((m.x - 8.0).abs() < 1e-12);
        assert!(m.y.abs() < 1e-12);
        assert!((m.z - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_unfold_profile() {
        let pts = vec![
            Coord::new(0.0, 0.0, 1.0),
            Coord::new(3.0, 4.0, 2.0),
            Coord::new(6.0, 8.0, 3.0),
        ];
        let u = unfold(&pts);
        assert!((u[0].x).abs() < 1e-12 && (u[0].y - 1.0).abs() < 1e-12);
        assert!((u[1].x - 5.0).abs() < 1e-12);
        assert!((u[2].x - 10.0).abs() < 1e-12);
        let c = unfold_cumulative(&pts);
        assert!((c[2].x - 10.0).abs() < 1e-12);
    }
}
