//! Terrain mesh triangulation
//!
//! Builds a Delaunay triangulation (Bowyer-Watson insertion) over the
//! topographic points once, at scene finish time. The mesh is immutable
//! afterwards; every height query goes through barycentric interpolation
//! inside one triangle. Each triangle stores its three neighbor links so
//! rays can walk the mesh from triangle to triangle without touching the
//! spatial index again.

use std::collections::{HashMap, HashSet};

use crate::error::{SceneError, SceneResult};
use crate::geometry::{
    in_triangle, interpolate_z_triangle, segment_intersection_2d, Coord, Envelope,
};

/// One terrain facet. `neighbors[k]` is the triangle across the edge
/// opposite vertex `k`, or `None` at the mesh boundary.
#[derive(Debug, Clone)]
pub struct Triangle {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub neighbors: [Option<usize>; 3],
}

impl Triangle {
    /// Vertex indices of the edge opposite vertex slot `k`.
    fn opposite_edge(&self, k: usize) -> (usize, usize) {
        match k {
            0 => (self.b, self.c),
            1 => (self.c, self.a),
            _ => (self.a, self.b),
        }
    }
}

/// Immutable triangulated terrain.
#[derive(Debug, Clone)]
pub struct TerrainMesh {
    vertices: Vec<Coord>,
    triangles: Vec<Triangle>,
}

impl TerrainMesh {
    /// Triangulate the given elevation points.
    ///
    /// Points sharing a plan position are collapsed to the first
    /// occurrence. Fails when fewer than three distinct points remain or
    /// when all of them are collinear.
    pub fn build(points: &[Coord]) -> SceneResult<TerrainMesh> {
        let mut vertices: Vec<Coord> = Vec::with_capacity(points.len());
        for p in points {
            if !vertices.iter().any(|v| v.same_position_2d(p, 1e-9)) {
                let z = if p.z.is_nan() { 0.0 } else { p.z };
                vertices.push(Coord::new(p.x, p.y, z));
            }
        }
        if vertices.len() < 3 {
            return Err(SceneError::Triangulation(format!(
                "need at least 3 distinct points, got {}",
                vertices.len()
            )));
        }

        let n = vertices.len();
        let mut env = Envelope::of_coord(&vertices[0]);
        for v in &vertices[1..] {
            env.expand_to_include(v);
        }
        let span = (env.max_x - env.min_x).max(env.max_y - env.min_y).max(1.0);
        let cx = (env.min_x + env.max_x) / 2.0;
        let cy = (env.min_y + env.max_y) / 2.0;
        // Super-triangle well outside the data extent
        vertices.push(Coord::new(cx - 20.0 * span, cy - 10.0 * span, 0.0));
        vertices.push(Coord::new(cx + 20.0 * span, cy - 10.0 * span, 0.0));
        vertices.push(Coord::new(cx, cy + 20.0 * span, 0.0));

        let mut tris: Vec<[usize; 3]> = vec![ccw(&vertices, [n, n + 1, n + 2])];
        for p_idx in 0..n {
            let p = vertices[p_idx];
            let mut bad: Vec<usize> = Vec::new();
            for (t_idx, t) in tris.iter().enumerate() {
                if in_circumcircle(&p, &vertices[t[0]], &vertices[t[1]], &vertices[t[2]]) {
                    bad.push(t_idx);
                }
            }
            // Boundary of the carved cavity: edges used by exactly one bad triangle
            let mut edge_use: HashMap<(usize, usize), usize> = HashMap::new();
            for &t_idx in &bad {
                let t = tris[t_idx];
                for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                    *edge_use.entry(undirected(a, b)).or_insert(0) += 1;
                }
            }
            let mut boundary: Vec<(usize, usize)> = Vec::new();
            for &t_idx in &bad {
                let t = tris[t_idx];
                for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                    if edge_use[&undirected(a, b)] == 1 {
                        boundary.push((a, b));
                    }
                }
            }
            let bad_set: HashSet<usize> = bad.into_iter().collect();
            let mut kept: Vec<[usize; 3]> = Vec::with_capacity(tris.len());
            for (t_idx, t) in tris.into_iter().enumerate() {
                if !bad_set.contains(&t_idx) {
                    kept.push(t);
                }
            }
            tris = kept;
            for (a, b) in boundary {
                tris.push(ccw(&vertices, [a, b, p_idx]));
            }
        }

        // Drop triangles still attached to the super-triangle
        tris.retain(|t| t.iter().all(|&v| v < n));
        vertices.truncate(n);
        if tris.is_empty() {
            return Err(SceneError::Triangulation(
                "input points are collinear".into(),
            ));
        }

        // Neighbor links: triangles sharing an undirected edge
        let mut by_edge: HashMap<(usize, usize), Vec<(usize, usize)>> = HashMap::new();
        for (t_idx, t) in tris.iter().enumerate() {
            for (slot, (a, b)) in [(0, (t[1], t[2])), (1, (t[2], t[0])), (2, (t[0], t[1]))] {
                by_edge
                    .entry(undirected(a, b))
                    .or_default()
                    .push((t_idx, slot));
            }
        }
        let mut triangles: Vec<Triangle> = tris
            .iter()
            .map(|t| Triangle {
                a: t[0],
                b: t[1],
                c: t[2],
                neighbors: [None; 3],
            })
            .collect();
        for users in by_edge.values() {
            if users.len() == 2 {
                let (t0, s0) = users[0];
                let (t1, s1) = users[1];
                triangles[t0].neighbors[s0] = Some(t1);
                triangles[t1].neighbors[s1] = Some(t0);
            }
        }

        Ok(TerrainMesh {
            vertices,
            triangles,
        })
    }

    pub fn vertices(&self) -> &[Coord] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Corner coordinates of triangle `idx`.
    pub fn triangle_coords(&self, idx: usize) -> [Coord; 3] {
        let t = &self.triangles[idx];
        [self.vertices[t.a], self.vertices[t.b], self.vertices[t.c]]
    }

    /// Plan envelope of triangle `idx`.
    pub fn triangle_envelope(&self, idx: usize) -> Envelope {
        let [a, b, c] = self.triangle_coords(idx);
        let mut env = Envelope::of(&a, &b);
        env.expand_to_include(&c);
        env
    }

    /// Interpolated terrain height at `p` inside triangle `idx`.
    pub fn interpolate_z(&self, idx: usize, p: &Coord) -> f64 {
        let [a, b, c] = self.triangle_coords(idx);
        interpolate_z_triangle(p, &a, &b, &c)
    }

    /// Containment test with the outside-distance error term.
    pub fn triangle_error(&self, idx: usize, p: &Coord) -> (bool, f64) {
        let [a, b, c] = self.triangle_coords(idx);
        in_triangle(p, &a, &b, &c)
    }

    /// Neighbor reached by following the ray `p0`->`p1` out of triangle
    /// `idx`, skipping already visited triangles. Picks the exit edge whose
    /// crossing point lies nearest to `p1`, together with that crossing
    /// point (height interpolated along the edge).
    pub fn next_triangle(
        &self,
        idx: usize,
        p0: &Coord,
        p1: &Coord,
        visited: &HashSet<usize>,
    ) -> Option<(usize, Coord)> {
        let tri = &self.triangles[idx];
        let mut best: Option<(usize, Coord)> = None;
        let mut best_dist = f64::MAX;
        for slot in 0..3 {
            let Some(neighbor) = tri.neighbors[slot] else {
                continue;
            };
            if visited.contains(&neighbor) {
                continue;
            }
            let (ea, eb) = tri.opposite_edge(slot);
            let va = self.vertices[ea];
            let vb = self.vertices[eb];
            if let Some(mut cross) = segment_intersection_2d(p0, p1, &va, &vb) {
                let t = crate::geometry::segment_fraction(&va, &vb, &cross);
                cross.z = va.z + (vb.z - va.z) * t.clamp(0.0, 1.0);
                let dist = cross.distance_2d(p1);
                if dist < best_dist {
                    best_dist = dist;
                    best = Some((neighbor, cross));
                }
            }
        }
        best
    }

    /// Walk the mesh along `p0`->`p1` starting inside triangle `start`,
    /// collecting every edge crossing with its interpolated height.
    pub fn traverse(&self, start: usize, p0: &Coord, p1: &Coord) -> Vec<Coord> {
        let mut crossings = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start;
        loop {
            visited.insert(current);
            let (inside, _) = self.triangle_error(current, p1);
            if inside {
                break;
            }
            match self.next_triangle(current, p0, p1, &visited) {
                Some((next, crossing)) => {
                    crossings.push(crossing);
                    current = next;
                }
                None => break,
            }
        }
        crossings
    }
}

fn undirected(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Reorder triangle vertices counter-clockwise.
fn ccw(vertices: &[Coord], t: [usize; 3]) -> [usize; 3] {
    let a = &vertices[t[0]];
    let b = &vertices[t[1]];
    let c = &vertices[t[2]];
    let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    if cross < 0.0 {
        [t[0], t[2], t[1]]
    } else {
        t
    }
}

/// Circumcircle containment for a counter-clockwise triangle.
fn in_circumcircle(p: &Coord, a: &Coord, b: &Coord, c: &Coord) -> bool {
    let ax = a.x - p.x;
    let ay = a.y - p.y;
    let bx = b.x - p.x;
    let by = b.y - p.y;
    let cx = c.x - p.x;
    let cy = c.y - p.y;
    let det = (ax * ax + ay * ay) * (bx * cy - cx * by)
        - (bx * bx + by * by) * (ax * cy - cx * ay)
        + (cx * cx + cy * cy) * (ax * by - bx * ay);
    det > 0.0
}
