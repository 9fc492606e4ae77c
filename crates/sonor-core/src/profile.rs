//! Cut profiles
//!
//! A cut profile is the ordered record of everything the straight line
//! between two points crosses: terrain triangle edges, building facades,
//! free-standing walls and ground effect boundaries. The extraction walk
//! chops the ray into sub-segments no longer than the scene's maximum line
//! length so each spatial index query stays local, then post-processes the
//! raw crossings into a clean source-to-receiver sequence.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::geometry::{
    distance_point_segment_3d, point_along, segment_fraction, segment_intersection_2d, Coord,
    Envelope,
};
use crate::scene::Scene;

/// Tolerance under which an intermediate terrain point counts as aligned
/// with its neighbors and is dropped.
const ALIGNMENT_DELTA: f64 = 1e-3;

/// What a cut point was cut on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CutKind {
    Source,
    Receiver,
    Building,
    Wall,
    Topography,
    GroundEffect,
}

/// One crossing along a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutPoint {
    pub coord: Coord,
    pub kind: CutKind,
    /// Index of the originating entity: triangle, building, wall or
    /// ground region. None for the profile endpoints.
    pub id: Option<usize>,
    pub building: Option<usize>,
    pub wall: Option<usize>,
    /// Height of the obstacle owning the point.
    pub height: Option<f64>,
    /// Terrain elevation under the point, resolved lazily.
    pub z_ground: Option<f64>,
    /// Ground effect coefficient at the point.
    pub ground_coef: f64,
    /// Per-band absorption of the obstacle owning the point.
    pub alpha: Vec<f64>,
}

impl CutPoint {
    pub fn new(coord: Coord, kind: CutKind, id: Option<usize>) -> Self {
        Self {
            coord,
            kind,
            id,
            building: None,
            wall: None,
            height: None,
            z_ground: None,
            ground_coef: 0.0,
            alpha: Vec::new(),
        }
    }

    fn cmp_position(&self, other: &CutPoint) -> std::cmp::Ordering {
        self.coord.cmp_position(&other.coord)
    }
}

/// Ordered cut point list between one source and one receiver.
#[derive(Debug, Clone, Default)]
pub struct CutProfile {
    pts: Vec<CutPoint>,
    has_obstacle: bool,
    has_topography: bool,
    has_ground_effect: bool,
}

impl CutProfile {
    pub fn points(&self) -> &[CutPoint] {
        &self.pts
    }

    /// Source endpoint; always first after post-processing.
    pub fn source(&self) -> &CutPoint {
        &self.pts[0]
    }

    /// Receiver endpoint; always last after post-processing.
    pub fn receiver(&self) -> &CutPoint {
        &self.pts[self.pts.len() - 1]
    }

    /// True when the profile crossed a building or wall facade.
    pub fn intersects_obstacle(&self) -> bool {
        self.has_obstacle
    }

    pub fn intersects_topography(&self) -> bool {
        self.has_topography
    }

    pub fn intersects_ground_effect(&self) -> bool {
        self.has_ground_effect
    }

    /// True when nothing solid rises above the straight source-receiver
    /// line: either every facade crossing coincides with an endpoint, or
    /// no crossing reaches over the sight line.
    pub fn is_free_field(&self) -> bool {
        let s = self.source().coord;
        let r = self.receiver().coord;
        let mut obstacle_away_from_ends = false;
        for pt in &self.pts {
            if matches!(pt.kind, CutKind::Building | CutKind::Wall)
                && !pt.coord.same_position_2d(&s, 1e-9)
                && !pt.coord.same_position_2d(&r, 1e-9)
            {
                obstacle_away_from_ends = true;
                break;
            }
        }
        if !obstacle_away_from_ends {
            return true;
        }
        for pt in &self.pts {
            let t = segment_fraction(&s, &r, &pt.coord);
            let line_z = s.z + t * (r.z - s.z);
            if line_z < pt.coord.z {
                return false;
            }
        }
        true
    }

    /// Length-weighted ground coefficient between two profile points,
    /// following the region in force over each stretch.
    pub fn g_path(&self, from: &CutPoint, to: &CutPoint) -> f64 {
        let total = from.coord.distance_2d(&to.coord);
        if total <= f64::EPSILON {
            return from.ground_coef;
        }
        let mut carriers: Vec<&CutPoint> = self
            .pts
            .iter()
            .filter(|c| !matches!(c.kind, CutKind::Topography | CutKind::Building))
            .collect();
        carriers.sort_by(|a, b| a.cmp_position(b));
        let mut current = from;
        let mut weighted = 0.0;
        for cut in carriers {
            if cut.cmp_position(current) != std::cmp::Ordering::Less
                && cut.cmp_position(to) == std::cmp::Ordering::Less
            {
                weighted += current.coord.distance_2d(&cut.coord) * current.ground_coef;
                current = cut;
            }
        }
        weighted += current.coord.distance_2d(&to.coord) * to.ground_coef;
        weighted / total
    }

    /// Ground coefficient over the whole profile.
    pub fn g_path_full(&self) -> f64 {
        self.g_path(self.source(), self.receiver())
    }
}

impl Scene {
    /// Extract the cut profile of the straight line `c0` -> `c1`.
    ///
    /// `default_ground` applies wherever no ground effect region covers
    /// the profile.
    pub fn cut_profile(&self, c0: &Coord, c1: &Coord, default_ground: f64) -> CutProfile {
        let mut profile = CutProfile::default();
        let mut pts: Vec<CutPoint> = Vec::new();

        let mut source = CutPoint::new(*c0, CutKind::Source, None);
        source.z_ground = Some(self.z_ground(c0));
        pts.push(source);
        let mut receiver = CutPoint::new(*c1, CutKind::Receiver, None);
        receiver.z_ground = Some(self.z_ground(c1));
        pts.push(receiver);

        // Long rays are chopped so each index query covers a small box
        let length = c0.distance_2d(c1);
        let mut sub_lines: Vec<(Coord, Coord)> = Vec::new();
        if length <= self.max_line_length() {
            sub_lines.push((*c0, *c1));
        } else {
            let count = (length / self.max_line_length()).ceil() as usize;
            for i in 0..count {
                let t0 = i as f64 / count as f64;
                let t1 = ((i + 1) as f64 / count as f64).min(1.0);
                sub_lines.push((point_along(c0, c1, t0), point_along(c0, c1, t1)));
            }
        }

        self.collect_terrain_cuts(&sub_lines, &mut pts, &mut profile);
        self.collect_facet_cuts(&sub_lines, c0, c1, &mut pts, &mut profile);

        // (a) order everything along the ray
        pts.sort_by(|a, b| a.cmp_position(b));
        // (b) ground the profile on both sides of every building run
        let mut pts = self.insert_building_base(pts);
        // (c) the list must run source -> receiver
        orient_source_first(&mut pts);
        // (d) resolve the ground coefficient under every point
        self.resolve_ground_effects(&mut pts, default_ground);
        // (e) aligned terrain points add nothing but noise to the fits
        drop_aligned_topography(&mut pts);

        profile.pts = pts;
        profile
    }

    fn collect_terrain_cuts(
        &self,
        sub_lines: &[(Coord, Coord)],
        pts: &mut Vec<CutPoint>,
        profile: &mut CutProfile,
    ) {
        let Some(mesh) = self.terrain() else {
            return;
        };
        let mut topo: Vec<CutPoint> = Vec::new();
        for (p0, p1) in sub_lines {
            let mut ids = self.triangles_in(&Envelope::of(p0, p1));
            ids.sort_unstable();
            ids.dedup();
            for idx in ids {
                let [a, b, c] = mesh.triangle_coords(idx);
                for (va, vb) in [(a, b), (b, c), (c, a)] {
                    if let Some(mut hit) = segment_intersection_2d(p0, p1, &va, &vb) {
                        let t = segment_fraction(&va, &vb, &hit).clamp(0.0, 1.0);
                        hit.z = va.z + (vb.z - va.z) * t;
                        topo.push(CutPoint::new(hit, CutKind::Topography, Some(idx)));
                    }
                }
            }
        }
        // Shared triangle edges produce the same crossing twice
        let mut seen: Vec<Coord> = Vec::new();
        topo.retain(|cut| {
            if seen.iter().any(|c| c.same_position_2d(&cut.coord, 1e-9)) {
                false
            } else {
                seen.push(cut.coord);
                true
            }
        });
        if !topo.is_empty() {
            profile.has_topography = true;
        }
        pts.append(&mut topo);
    }

    fn collect_facet_cuts(
        &self,
        sub_lines: &[(Coord, Coord)],
        c0: &Coord,
        c1: &Coord,
        pts: &mut Vec<CutPoint>,
        profile: &mut CutProfile,
    ) {
        let mut ids: Vec<usize> = Vec::new();
        for (p0, p1) in sub_lines {
            ids.extend(self.facets_in(&Envelope::of(p0, p1)));
        }
        ids.sort_unstable();
        ids.dedup();
        for idx in ids {
            let facet = &self.facets()[idx];
            let Some(mut hit) = segment_intersection_2d(c0, c1, &facet.p0, &facet.p1) else {
                continue;
            };
            match facet.kind {
                CutKind::Building => {
                    hit.z = facet.top_z_at(&hit);
                    let building = &self.buildings()[facet.origin];
                    let mut cut = CutPoint::new(hit, CutKind::Building, Some(facet.origin));
                    cut.building = Some(facet.origin);
                    cut.height = Some(building.height());
                    cut.alpha = building.alphas().to_vec();
                    pts.push(cut);
                    profile.has_obstacle = true;
                }
                CutKind::Wall => {
                    hit.z = facet.top_z_at(&hit);
                    let wall = &self.walls()[facet.origin];
                    let mut cut = CutPoint::new(hit, CutKind::Wall, Some(facet.origin));
                    cut.wall = Some(facet.origin);
                    cut.height = Some(wall.height);
                    cut.alpha = wall.alphas.clone();
                    pts.push(cut);
                    profile.has_obstacle = true;
                }
                CutKind::GroundEffect => {
                    // Boundary corners double as two segment ends
                    if hit.same_position_2d(&facet.p0, 1e-9) || hit.same_position_2d(&facet.p1, 1e-9)
                    {
                        continue;
                    }
                    hit.z = self.z_ground(&hit);
                    pts.push(CutPoint::new(hit, CutKind::GroundEffect, Some(facet.origin)));
                    profile.has_ground_effect = true;
                }
                _ => {}
            }
        }
    }

    /// A profile must touch the ground right before climbing a facade and
    /// right after leaving it, so runs of crossings on the same building
    /// are wrapped in ground-level copies.
    fn insert_building_base(&self, pts: Vec<CutPoint>) -> Vec<CutPoint> {
        let mut out: Vec<CutPoint> = Vec::with_capacity(pts.len() + 4);
        let mut run_id: Option<usize> = None;
        let mut last_in_run: Option<CutPoint> = None;
        for cut in pts {
            match (cut.kind, run_id) {
                (CutKind::Building, current) => {
                    if current != cut.id {
                        if let Some(prev) = last_in_run.take() {
                            out.push(self.grounded_copy(&prev));
                        }
                        out.push(self.grounded_copy(&cut));
                        run_id = cut.id;
                    }
                    last_in_run = Some(cut.clone());
                    out.push(cut);
                }
                (_, Some(_)) => {
                    if let Some(prev) = last_in_run.take() {
                        out.push(self.grounded_copy(&prev));
                    }
                    run_id = None;
                    out.push(cut);
                }
                (_, None) => out.push(cut),
            }
        }
        if let Some(prev) = last_in_run.take() {
            out.push(self.grounded_copy(&prev));
        }
        out
    }

    fn grounded_copy(&self, cut: &CutPoint) -> CutPoint {
        let mut grounded = cut.clone();
        let z = cut.z_ground.unwrap_or_else(|| self.z_ground(&cut.coord));
        grounded.coord.z = z;
        grounded.z_ground = Some(z);
        grounded
    }

    /// Resolve ground coefficients with the region overlap stack: the most
    /// recently entered region wins, the caller default applies outside
    /// every region.
    fn resolve_ground_effects(&self, pts: &mut Vec<CutPoint>, default_ground: f64) {
        let start = pts[0].coord;
        let mut stack: Vec<usize> = Vec::new();
        for (idx, region) in self.grounds().iter().enumerate() {
            if region.contains(&start) {
                stack.push(idx);
            }
        }
        let mut drop_mask = vec![false; pts.len()];
        let mut previous: Option<usize> = None;
        for i in 0..pts.len() {
            if pts[i].kind == CutKind::GroundEffect {
                let region = pts[i].id.unwrap_or(usize::MAX);
                if stack.last() == Some(&region) {
                    stack.pop();
                } else {
                    stack.push(region);
                    if let Some(p) = previous {
                        let duplicate = pts[p].coord.same_position_2d(&pts[i].coord, 1e-9)
                            && !matches!(
                                pts[p].kind,
                                CutKind::Source | CutKind::Receiver | CutKind::Building
                            );
                        if duplicate {
                            drop_mask[p] = true;
                        }
                    }
                }
                previous = Some(i);
            }
            pts[i].ground_coef = stack
                .last()
                .map(|&r| self.grounds()[r].coefficient())
                .unwrap_or(default_ground);
        }
        let mut keep = drop_mask.iter().map(|d| !d);
        pts.retain(|_| keep.next().unwrap_or(true));
    }
}

/// Reverse the profile when the sort left the receiver first. A profile
/// without its endpoints at the extremes breaks the walk downstream, so
/// that state is loudly surfaced before being repaired.
fn orient_source_first(pts: &mut [CutPoint]) {
    let first = pts[0].kind;
    let last = pts[pts.len() - 1].kind;
    if first == CutKind::Source {
        return;
    }
    if first != CutKind::Source && last != CutKind::Source {
        error!("profile source must be the first or last cut point");
    }
    if first != CutKind::Receiver && last != CutKind::Receiver {
        error!("profile receiver must be the first or last cut point");
    }
    pts.reverse();
}

/// Drop terrain points collinear with their neighbors; they carry no
/// relief information and destabilise the mean plane fits.
fn drop_aligned_topography(pts: &mut Vec<CutPoint>) {
    let ground_z = |cut: &CutPoint| -> f64 {
        match cut.kind {
            CutKind::Source | CutKind::Receiver => cut.z_ground.unwrap_or(cut.coord.z),
            _ => cut.coord.z,
        }
    };
    let sequence: Vec<usize> = pts
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            matches!(
                c.kind,
                CutKind::Topography | CutKind::Source | CutKind::Receiver
            )
        })
        .map(|(i, _)| i)
        .collect();
    if sequence.len() < 3 {
        return;
    }
    let mut drop_mask = vec![false; pts.len()];
    for w in sequence.windows(3) {
        let (i0, i1, i2) = (w[0], w[1], w[2]);
        if pts[i1].kind != CutKind::Topography {
            continue;
        }
        let a = Coord::new(pts[i0].coord.x, pts[i0].coord.y, ground_z(&pts[i0]));
        let m = Coord::new(pts[i1].coord.x, pts[i1].coord.y, ground_z(&pts[i1]));
        let b = Coord::new(pts[i2].coord.x, pts[i2].coord.y, ground_z(&pts[i2]));
        let flat = a.z == m.z && m.z == b.z;
        if flat || distance_point_segment_3d(&m, &a, &b) < ALIGNMENT_DELTA {
            drop_mask[i1] = true;
        }
    }
    let mut keep = drop_mask.iter().map(|d| !d);
    pts.retain(|_| keep.next().unwrap_or(true));
}
