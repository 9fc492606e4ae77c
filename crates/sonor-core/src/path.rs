//! Propagation path data model
//!
//! A propagation path is an ordered list of points in the unfolded
//! vertical plane (source, diffraction and reflection points, receiver)
//! plus the straight legs between them. Each leg carries the mean ground
//! plane it was fitted against, the mirror images of its endpoints and the
//! homogeneous/favorable distance variants the attenuation formulas
//! consume downstream. The engine fills these structures in; it never
//! evaluates band attenuation itself.

use serde::{Deserialize, Serialize};

use crate::geometry::{project_on_mean_plane, Pt2};
use crate::profile::CutPoint;

/// Vertical curvature coefficient of the favorable-condition ray model.
const ALPHA0: f64 = 2e-4;

/// Role of a point inside a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathPointKind {
    Source,
    Receiver,
    /// Diffraction over a horizontal edge (roof line, wall top).
    VerticalDiffraction,
    /// Diffraction around a vertical edge (building corner).
    HorizontalDiffraction,
    /// Specular reflection on a wall.
    Reflection,
}

/// Source orientation, degrees. Yaw turns about the vertical axis, pitch
/// lifts the nose, roll banks around the forward axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Orientation {
    pub fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Orientation pointing along `(dx, dy, dz)` with the given roll.
    pub fn from_vector(dx: f64, dy: f64, dz: f64, roll: f64) -> Self {
        let horiz = (dx * dx + dy * dy).sqrt();
        Self {
            yaw: dy.atan2(dx).to_degrees(),
            pitch: dz.atan2(horiz).to_degrees(),
            roll,
        }
    }

    /// Rotate a vector by this orientation. With `inverse` the rotation is
    /// undone instead, mapping a world direction into the oriented frame.
    pub fn rotate(&self, v: [f64; 3], inverse: bool) -> [f64; 3] {
        let (sy, cy) = self.yaw.to_radians().sin_cos();
        let (sp, cp) = self.pitch.to_radians().sin_cos();
        let (sr, cr) = self.roll.to_radians().sin_cos();
        // Row-major yaw-pitch-roll composition; positive pitch lifts +x up
        let m = [
            [cy * cp, -cy * sp * sr - sy * cr, -cy * sp * cr + sy * sr],
            [sy * cp, -sy * sp * sr + cy * cr, -sy * sp * cr - cy * sr],
            [sp, cp * sr, cp * cr],
        ];
        if inverse {
            [
                m[0][0] * v[0] + m[1][0] * v[1] + m[2][0] * v[2],
                m[0][1] * v[0] + m[1][1] * v[1] + m[2][1] * v[2],
                m[0][2] * v[0] + m[1][2] * v[1] + m[2][2] * v[2],
            ]
        } else {
            [
                m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
                m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
                m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
            ]
        }
    }
}

/// One point of a propagation path, in unfolded profile coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPoint {
    pub coord: Pt2,
    /// Ground elevation under the point.
    pub altitude: f64,
    /// Per-band absorption of the obstacle the point sits on.
    pub alpha: Vec<f64>,
    pub kind: PathPointKind,
    pub building: Option<usize>,
    pub wall: Option<usize>,
    /// Height of the obstacle carrying the point, when any.
    pub obstacle_height: Option<f64>,
    /// Directivity of the outgoing ray at a source point.
    pub orientation: Option<Orientation>,
}

impl PathPoint {
    pub fn new(coord: Pt2, altitude: f64, alpha: Vec<f64>, kind: PathPointKind) -> Self {
        Self {
            coord,
            altitude,
            alpha,
            kind,
            building: None,
            wall: None,
            obstacle_height: None,
            orientation: None,
        }
    }
}

/// Geometry of one straight leg of a path against its mean ground plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentPath {
    /// Leg endpoints in the unfolded plane.
    pub s: Pt2,
    pub r: Pt2,
    /// Projections of the endpoints on the mean plane.
    pub s_mean: Pt2,
    pub r_mean: Pt2,
    /// Mirror images of the endpoints through the mean plane.
    pub s_prime: Pt2,
    pub r_prime: Pt2,
    /// Mean plane coefficients of `y = a*x + b`.
    pub mean_a: f64,
    pub mean_b: f64,
    /// Straight length of the leg.
    pub d: f64,
    /// Length of the leg projected on the mean plane.
    pub dp: f64,
    /// Mirror-to-mirror length, filled by diffraction computations.
    pub d_prime: f64,
    /// Direct 3D source-receiver distance for bent (side) paths.
    pub dc: f64,
    /// Endpoint heights above the mean plane, homogeneous conditions.
    pub zs_h: f64,
    pub zr_h: f64,
    /// Endpoint heights corrected for favorable (curved ray) conditions.
    pub zs_f: f64,
    pub zr_f: f64,
    pub test_form_h: f64,
    pub test_form_f: f64,
    /// Ground coefficient along the leg.
    pub g_path: f64,
    /// Ground coefficient corrected for source proximity.
    pub g_path_prime: f64,
}

impl SegmentPath {
    /// Derive the full leg geometry from its endpoints and mean plane.
    pub fn compute(s: Pt2, r: Pt2, mean: (f64, f64), g_path: f64, g_s: f64) -> Self {
        let (a, b) = mean;
        let s_mean = project_on_mean_plane(&s, a, b);
        let r_mean = project_on_mean_plane(&r, a, b);
        let s_prime = Pt2::new(s.x + (s_mean.x - s.x) * 2.0, s.y + (s_mean.y - s.y) * 2.0);
        let r_prime = Pt2::new(r.x + (r_mean.x - r.x) * 2.0, r.y + (r_mean.y - r.y) * 2.0);
        let d = s.distance(&r);
        let dp = s_mean.distance(&r_mean);
        let zs_h = s.distance(&s_mean);
        let zr_h = r.distance(&r_mean);
        let test_form_h = dp / (30.0 * (zs_h + zr_h));
        let g_path_prime = if test_form_h <= 1.0 {
            g_path * test_form_h + g_s * (1.0 - test_form_h)
        } else {
            g_path
        };
        let delta_zt = 6e-3 * dp / (zs_h + zr_h);
        let delta_zs = ALPHA0 * (zs_h / (zs_h + zr_h)).powi(2) * dp * dp / 2.0;
        let delta_zr = ALPHA0 * (zr_h / (zs_h + zr_h)).powi(2) * dp * dp / 2.0;
        let zs_f = zs_h + delta_zs + delta_zt;
        let zr_f = zr_h + delta_zr + delta_zt;
        let test_form_f = dp / (30.0 * (zs_f + zr_f));
        SegmentPath {
            s,
            r,
            s_mean,
            r_mean,
            s_prime,
            r_prime,
            mean_a: a,
            mean_b: b,
            d,
            dp,
            d_prime: 0.0,
            dc: d,
            zs_h,
            zr_h,
            zs_f,
            zr_f,
            test_form_h,
            test_form_f,
            g_path,
            g_path_prime,
        }
    }

    /// Minimal leg between two reflection points; only the length is
    /// meaningful, the mean plane data stays at its defaults.
    pub fn between(s: Pt2, r: Pt2) -> Self {
        SegmentPath {
            s,
            r,
            d: s.distance(&r),
            dc: s.distance(&r),
            g_path: 1.0,
            ..Default::default()
        }
    }

    /// Re-assign the ground coefficient, refreshing the source-proximity
    /// corrected variant.
    pub fn set_g_path(&mut self, g_path: f64, g_s: f64) {
        self.g_path = g_path;
        self.g_path_prime = if self.test_form_h <= 1.0 {
            g_path * self.test_form_h + g_s * (1.0 - self.test_form_h)
        } else {
            g_path
        };
    }
}

/// Curved-ray length of a chord `mn` over a path of direct length `d`,
/// favorable (downward refracting) conditions.
pub fn to_curve(mn: f64, d: f64) -> f64 {
    let gamma = 2.0 * 1000.0_f64.max(8.0 * d);
    gamma * (mn / gamma).asin()
}

/// One candidate propagation path between a source and a receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationPath {
    pub points: Vec<PathPoint>,
    pub segments: Vec<SegmentPath>,
    /// Whole source-to-receiver leg.
    pub sr_segment: Option<SegmentPath>,
    /// Favorable propagation conditions flag.
    pub favorable: bool,
    /// Plan incidence angle at the receiver, radians.
    pub angle: f64,
    /// Cut points retained for downstream absorption lookups.
    pub cut_points: Vec<CutPoint>,
    /// Indices into `points` per diffraction/reflection kind.
    pub vertical_diffraction: Vec<usize>,
    pub horizontal_diffraction: Vec<usize>,
    pub reflections: Vec<usize>,
    /// Path length differences, homogeneous and favorable.
    pub delta_h: f64,
    pub delta_f: f64,
    pub delta_prime_h: f64,
    pub delta_prime_f: f64,
    pub delta_s_prime_r_h: f64,
    pub delta_s_prime_r_f: f64,
    pub delta_s_r_prime_h: f64,
    pub delta_s_r_prime_f: f64,
    /// Spread between first and last diffraction edge.
    pub e: f64,
    pub source_id: usize,
    pub receiver_id: usize,
    /// Directivity of the ray leaving the source.
    pub directivity: Option<Orientation>,
}

impl PropagationPath {
    /// Total unfolded length over the point list.
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| w[0].coord.distance(&w[1].coord))
            .sum()
    }

    /// True when the path bends nowhere: a pure line of sight leg.
    pub fn is_direct(&self) -> bool {
        self.vertical_diffraction.is_empty()
            && self.horizontal_diffraction.is_empty()
            && self.reflections.is_empty()
    }
}

/// Directivity of the ray leaving `from` toward `next`, relative to the
/// source orientation.
pub fn ray_orientation(
    source: Option<Orientation>,
    from: &crate::geometry::Coord,
    next: &crate::geometry::Coord,
) -> Option<Orientation> {
    let source = source?;
    let dx = next.x - from.x;
    let dy = next.y - from.y;
    let dz = next.z - from.z;
    let len = (dx * dx + dy * dy + dz * dz).sqrt();
    if len <= f64::EPSILON {
        return Some(source);
    }
    let local = source.rotate([dx / len, dy / len, dz / len], true);
    Some(Orientation::from_vector(local[0], local[1], local[2], 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_flat_ground() {
        // Source 1 m and receiver 2 m above flat ground at z = 0
        let seg = SegmentPath::compute(Pt2::new(0.0, 1.0), Pt2::new(50.0, 2.0), (0.0, 0.0), 0.0, 0.0);
        assert!((seg.zs_h - 1.0).abs() < 1e-9);
        assert!((seg.zr_h - 2.0).abs() < 1e-9);
        assert!((seg.d - (50.0_f64 * 50.0 + 1.0).sqrt()).abs() < 1e-9);
        assert!((seg.dp - 50.0).abs() < 1e-9);
        // Mirror images sit below the plane
        assert!((seg.s_prime.y + 1.0).abs() < 1e-9);
        assert!((seg.r_prime.y + 2.0).abs() < 1e-9);
        // Favorable heights exceed homogeneous ones
        assert!(seg.zs_f > seg.zs_h);
        assert!(seg.zr_f > seg.zr_h);
    }

    #[test]
    fn test_g_path_prime_blend() {
        let mut seg =
            SegmentPath::compute(Pt2::new(0.0, 10.0), Pt2::new(10.0, 10.0), (0.0, 0.0), 0.0, 0.0);
        // Short leg over tall endpoints: test form well below 1
        assert!(seg.test_form_h < 1.0);
        seg.set_g_path(1.0, 0.5);
        let expected = 1.0 * seg.test_form_h + 0.5 * (1.0 - seg.test_form_h);
        assert!((seg.g_path_prime - expected).abs() < 1e-12);
    }

    #[test]
    fn test_to_curve_close_to_chord() {
        // Curved length is slightly above the chord and converges to it
        let d = 200.0;
        let c = to_curve(d, d);
        assert!(c >= d);
        assert!(c - d < 1.0);
    }

    #[test]
    fn test_orientation_round_trip() {
        let o = Orientation::new(30.0, 10.0, 0.0);
        let v = [1.0, 0.5, 0.2];
        let w = o.rotate(o.rotate(v, false), true);
        for (a, b) in v.iter().zip(w.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_ray_orientation_forward() {
        // A ray leaving along the source nose reads as zero yaw/pitch
        let src = Orientation::new(90.0, 0.0, 0.0);
        let from = crate::geometry::Coord::new(0.0, 0.0, 0.0);
        let next = crate::geometry::Coord::new(0.0, 10.0, 0.0);
        let rel = ray_orientation(Some(src), &from, &next).unwrap();
        assert!(rel.yaw.abs() < 1e-9);
        assert!(rel.pitch.abs() < 1e-9);
    }
}
