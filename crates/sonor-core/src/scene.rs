//! Scene model and spatial index
//!
//! The scene is built in two phases. A [`SceneBuilder`] accumulates raw
//! geometry: building footprints, free-standing walls, ground effect
//! regions, topographic points and lines, sound sources and receivers.
//! Calling [`SceneBuilder::finish`] consumes the builder, triangulates the
//! terrain, explodes every obstacle into indexed edge segments, resolves
//! base elevations against the terrain and returns an immutable [`Scene`].
//! Because `finish` takes the builder by value, feeding after the
//! transition is rejected at compile time.
//!
//! A finished scene is read-only and safely shared across worker threads.
//!
//! # Example
//!
//! ```
//! use sonor_core::scene::SceneBuilder;
//! use sonor_core::geometry::Coord;
//!
//! let mut builder = SceneBuilder::new();
//! builder.add_building(
//!     vec![
//!         Coord::flat(10.0, -5.0),
//!         Coord::flat(30.0, -5.0),
//!         Coord::flat(30.0, 5.0),
//!         Coord::flat(10.0, 5.0),
//!     ],
//!     10.0,
//!     vec![],
//! ).unwrap();
//! let scene = builder.finish().unwrap();
//! assert_eq!(scene.buildings().len(), 1);
//! ```

use tracing::debug;

use crate::delaunay::TerrainMesh;
use crate::error::{SceneError, SceneResult};
use crate::geometry::{Coord, Envelope};
use crate::path::Orientation;
use crate::profile::CutKind;
use crate::rtree::StrTree;

/// Default maximum length of one profile sub-segment in metres. Long rays
/// are chopped at this length to bound the cost of each index query.
pub const DEFAULT_MAX_LINE_LENGTH: f64 = 60.0;

/// Raw input geometry.
#[derive(Debug, Clone)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    Polygon(Vec<Coord>),
}

/// Geometry kinds a sound source may carry.
#[derive(Debug, Clone)]
pub enum SourceGeometry {
    Point(Coord),
    Line(Vec<Coord>),
    MultiLine(Vec<Vec<Coord>>),
}

impl SourceGeometry {
    pub fn envelope(&self) -> Envelope {
        let mut coords = self.coords();
        let first = coords.next().unwrap_or(Coord::new(0.0, 0.0, 0.0));
        let mut env = Envelope::of_coord(&first);
        for c in coords {
            env.expand_to_include(&c);
        }
        env
    }

    fn coords(&self) -> Box<dyn Iterator<Item = Coord> + '_> {
        match self {
            SourceGeometry::Point(c) => Box::new(std::iter::once(*c)),
            SourceGeometry::Line(l) => Box::new(l.iter().copied()),
            SourceGeometry::MultiLine(m) => Box::new(m.iter().flatten().copied()),
        }
    }
}

/// Sound source: geometry, per-octave-band power and directivity.
#[derive(Debug, Clone)]
pub struct Source {
    pub geometry: SourceGeometry,
    /// Emitted power per band in dB.
    pub power_db: Vec<f64>,
    pub orientation: Option<Orientation>,
}

/// Receiver point.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub position: Coord,
}

/// Building: closed footprint ring, height and absorption.
#[derive(Debug, Clone)]
pub struct Building {
    ring: Vec<Coord>,
    height: f64,
    alphas: Vec<f64>,
    z_topo: f64,
    top_z: f64,
    walls: Vec<usize>,
}

impl Building {
    /// Closed footprint ring; vertex heights carry the roof elevation once
    /// the scene is finished.
    pub fn ring(&self) -> &[Coord] {
        &self.ring
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Averaged terrain elevation under the footprint.
    pub fn z_topo(&self) -> f64 {
        self.z_topo
    }

    /// Absolute roof elevation.
    pub fn top_z(&self) -> f64 {
        self.top_z
    }

    /// Facet indices of the exploded boundary.
    pub fn walls(&self) -> &[usize] {
        &self.walls
    }

    /// True when the plan position falls inside the footprint.
    pub fn contains(&self, c: &Coord) -> bool {
        point_in_ring(c, &self.ring)
    }
}

/// Free-standing wall segment.
#[derive(Debug, Clone)]
pub struct Wall {
    pub p0: Coord,
    pub p1: Coord,
    pub height: f64,
    pub alphas: Vec<f64>,
}

/// Ground effect region: footprint and absorption coefficient in [0, 1].
#[derive(Debug, Clone)]
pub struct GroundRegion {
    ring: Vec<Coord>,
    coefficient: f64,
}

impl GroundRegion {
    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    pub fn contains(&self, c: &Coord) -> bool {
        point_in_ring(c, &self.ring)
    }
}

/// One indexed obstacle edge: a building facade segment, a free-standing
/// wall or a ground region boundary.
#[derive(Debug, Clone)]
pub struct Facet {
    pub p0: Coord,
    pub p1: Coord,
    pub kind: CutKind,
    /// Index of the owning building, wall or ground region.
    pub origin: usize,
}

impl Facet {
    pub fn envelope(&self) -> Envelope {
        Envelope::of(&self.p0, &self.p1)
    }

    /// Absolute top elevation of the facet at a plan position, linearly
    /// interpolated between its endpoints.
    pub fn top_z_at(&self, c: &Coord) -> f64 {
        let t = crate::geometry::segment_fraction(&self.p0, &self.p1, c).clamp(0.0, 1.0);
        self.p0.z + (self.p1.z - self.p0.z) * t
    }
}

/// Accumulates scene geometry until `finish()`.
#[derive(Debug, Default)]
pub struct SceneBuilder {
    buildings: Vec<(Vec<Coord>, f64, Vec<f64>)>,
    walls: Vec<Wall>,
    grounds: Vec<GroundRegion>,
    topo_points: Vec<Coord>,
    sources: Vec<Source>,
    receivers: Vec<Receiver>,
    max_line_length: f64,
    envelope: Option<Envelope>,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            ..Default::default()
        }
    }

    /// Override the profile sub-segment length.
    pub fn max_line_length(&mut self, length: f64) -> &mut Self {
        self.max_line_length = length.max(1.0);
        self
    }

    /// Add a building footprint with its height in metres and per-band
    /// absorption. A NaN height derives the roof from the footprint Z.
    /// Returns the stable building index.
    pub fn add_building(
        &mut self,
        footprint: Vec<Coord>,
        height: f64,
        alphas: Vec<f64>,
    ) -> SceneResult<usize> {
        let ring = close_ring(footprint)?;
        for c in &ring {
            self.grow_envelope(c);
        }
        // The footprint itself reflects: register it as a hard ground patch
        self.grounds.push(GroundRegion {
            ring: ring.clone(),
            coefficient: 0.0,
        });
        self.buildings.push((ring, height, alphas));
        Ok(self.buildings.len() - 1)
    }

    /// Add a free-standing wall from a polyline; every polyline segment
    /// becomes one wall. Returns the index of the first wall added.
    pub fn add_wall(
        &mut self,
        line: Vec<Coord>,
        height: f64,
        alphas: Vec<f64>,
    ) -> SceneResult<usize> {
        if line.len() < 2 {
            return Err(SceneError::DegenerateFootprint);
        }
        let first = self.walls.len();
        for w in line.windows(2) {
            self.grow_envelope(&w[0]);
            self.grow_envelope(&w[1]);
            self.walls.push(Wall {
                p0: w[0],
                p1: w[1],
                height,
                alphas: alphas.clone(),
            });
        }
        Ok(first)
    }

    /// Add a ground effect region with its absorption coefficient.
    pub fn add_ground_effect(&mut self, footprint: Vec<Coord>, coefficient: f64) -> SceneResult<usize> {
        let ring = close_ring(footprint)?;
        for c in &ring {
            self.grow_envelope(c);
        }
        self.grounds.push(GroundRegion {
            ring,
            coefficient: coefficient.clamp(0.0, 1.0),
        });
        Ok(self.grounds.len() - 1)
    }

    /// Add one topographic elevation point.
    pub fn add_topographic_point(&mut self, point: Coord) {
        let p = if point.z.is_nan() {
            Coord::new(point.x, point.y, 0.0)
        } else {
            point
        };
        self.grow_envelope(&p);
        self.topo_points.push(p);
    }

    /// Add a topographic break line; its vertices feed the triangulation.
    pub fn add_topographic_line(&mut self, line: Vec<Coord>) {
        for p in line {
            self.add_topographic_point(p);
        }
    }

    /// Add a sound source. Polygon sources are not a supported emission
    /// shape and fail immediately.
    pub fn add_source(
        &mut self,
        geometry: Geometry,
        power_db: Vec<f64>,
        orientation: Option<Orientation>,
    ) -> SceneResult<usize> {
        let geometry = match geometry {
            Geometry::Point(c) => SourceGeometry::Point(c),
            Geometry::LineString(l) => {
                if l.len() < 2 {
                    return Err(SceneError::UnsupportedSourceGeometry(
                        "line source with fewer than 2 points",
                    ));
                }
                SourceGeometry::Line(l)
            }
            Geometry::MultiLineString(m) => {
                if m.iter().any(|l| l.len() < 2) {
                    return Err(SceneError::UnsupportedSourceGeometry(
                        "line source with fewer than 2 points",
                    ));
                }
                SourceGeometry::MultiLine(m)
            }
            Geometry::Polygon(_) => {
                return Err(SceneError::UnsupportedSourceGeometry("polygon"));
            }
        };
        self.sources.push(Source {
            geometry,
            power_db,
            orientation,
        });
        Ok(self.sources.len() - 1)
    }

    /// Add a receiver point.
    pub fn add_receiver(&mut self, position: Coord) -> usize {
        self.receivers.push(Receiver { position });
        self.receivers.len() - 1
    }

    fn grow_envelope(&mut self, c: &Coord) {
        match &mut self.envelope {
            Some(env) => env.expand_to_include(c),
            None => self.envelope = Some(Envelope::of_coord(c)),
        }
    }

    /// One-time transition to the immutable, indexed scene.
    pub fn finish(self) -> SceneResult<Scene> {
        // Terrain first: obstacle elevations depend on it
        let terrain = if self.topo_points.len() >= 3 {
            Some(TerrainMesh::build(&self.topo_points)?)
        } else {
            None
        };
        let terrain_tree = match &terrain {
            Some(mesh) => {
                let items: Vec<(Envelope, usize)> = (0..mesh.triangles().len())
                    .map(|i| (mesh.triangle_envelope(i), i))
                    .collect();
                StrTree::build(&items)
            }
            None => StrTree::default(),
        };

        let mut scene = Scene {
            buildings: Vec::with_capacity(self.buildings.len()),
            walls: self.walls,
            grounds: self.grounds,
            facets: Vec::new(),
            facet_tree: StrTree::default(),
            building_tree: StrTree::default(),
            terrain,
            terrain_tree,
            sources: self.sources,
            source_tree: StrTree::default(),
            receivers: self.receivers,
            max_line_length: self.max_line_length,
        };

        // Resolve building elevations, then explode boundaries into facets
        for (ring, height, alphas) in self.buildings {
            let z_topo = ring_mean_ground(&scene, &ring);
            let top_z = if height.is_nan() {
                let ring_max = ring
                    .iter()
                    .map(|c| c.z)
                    .filter(|z| !z.is_nan())
                    .fold(f64::NEG_INFINITY, f64::max);
                if ring_max.is_finite() {
                    ring_max
                } else {
                    z_topo
                }
            } else {
                z_topo + height
            };
            let ring: Vec<Coord> = ring
                .into_iter()
                .map(|c| Coord::new(c.x, c.y, top_z))
                .collect();
            scene.buildings.push(Building {
                ring,
                height,
                alphas,
                z_topo,
                top_z,
                walls: Vec::new(),
            });
        }

        for wall in &mut scene.walls {
            let z0 = ground_at(scene.terrain.as_ref(), &scene.terrain_tree, scene.max_line_length, &wall.p0);
            let z1 = ground_at(scene.terrain.as_ref(), &scene.terrain_tree, scene.max_line_length, &wall.p1);
            if wall.p0.z.is_nan() || wall.p0.z == 0.0 {
                wall.p0.z = wall.height + z0;
            }
            if wall.p1.z.is_nan() || wall.p1.z == 0.0 {
                wall.p1.z = wall.height + z1;
            }
        }

        let mut facet_items: Vec<(Envelope, usize)> = Vec::new();
        let mut building_items: Vec<(Envelope, usize)> = Vec::new();
        for b_idx in 0..scene.buildings.len() {
            let ring = scene.buildings[b_idx].ring.clone();
            let mut env = Envelope::of_coord(&ring[0]);
            let mut facet_ids = Vec::with_capacity(ring.len() - 1);
            for w in ring.windows(2) {
                env.expand_to_include(&w[1]);
                let facet = Facet {
                    p0: w[0],
                    p1: w[1],
                    kind: CutKind::Building,
                    origin: b_idx,
                };
                facet_items.push((facet.envelope(), scene.facets.len()));
                facet_ids.push(scene.facets.len());
                scene.facets.push(facet);
            }
            scene.buildings[b_idx].walls = facet_ids;
            building_items.push((env, b_idx));
        }
        for (w_idx, wall) in scene.walls.iter().enumerate() {
            let facet = Facet {
                p0: wall.p0,
                p1: wall.p1,
                kind: CutKind::Wall,
                origin: w_idx,
            };
            facet_items.push((facet.envelope(), scene.facets.len()));
            scene.facets.push(facet);
        }
        for (g_idx, ground) in scene.grounds.iter().enumerate() {
            for w in ground.ring.windows(2) {
                let facet = Facet {
                    p0: w[0],
                    p1: w[1],
                    kind: CutKind::GroundEffect,
                    origin: g_idx,
                };
                facet_items.push((facet.envelope(), scene.facets.len()));
                scene.facets.push(facet);
            }
        }
        scene.facet_tree = StrTree::build(&facet_items);
        scene.building_tree = StrTree::build(&building_items);

        let source_items: Vec<(Envelope, usize)> = scene
            .sources
            .iter()
            .enumerate()
            .map(|(i, s)| (s.geometry.envelope(), i))
            .collect();
        scene.source_tree = StrTree::build(&source_items);

        debug!(
            buildings = scene.buildings.len(),
            walls = scene.walls.len(),
            facets = scene.facets.len(),
            triangles = scene
                .terrain
                .as_ref()
                .map(|t| t.triangles().len())
                .unwrap_or(0),
            sources = scene.sources.len(),
            receivers = scene.receivers.len(),
            "scene finished"
        );
        Ok(scene)
    }
}

/// Immutable indexed scene shared by all workers.
#[derive(Debug)]
pub struct Scene {
    buildings: Vec<Building>,
    walls: Vec<Wall>,
    grounds: Vec<GroundRegion>,
    facets: Vec<Facet>,
    facet_tree: StrTree,
    building_tree: StrTree,
    terrain: Option<TerrainMesh>,
    terrain_tree: StrTree,
    sources: Vec<Source>,
    source_tree: StrTree,
    receivers: Vec<Receiver>,
    max_line_length: f64,
}

impl Scene {
    pub fn buildings(&self) -> &[Building] {
        &self.buildings
    }

    pub fn walls(&self) -> &[Wall] {
        &self.walls
    }

    pub fn grounds(&self) -> &[GroundRegion] {
        &self.grounds
    }

    pub fn facets(&self) -> &[Facet] {
        &self.facets
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn receivers(&self) -> &[Receiver] {
        &self.receivers
    }

    pub fn terrain(&self) -> Option<&TerrainMesh> {
        self.terrain.as_ref()
    }

    pub fn max_line_length(&self) -> f64 {
        self.max_line_length
    }

    /// Obstacle facet indices whose envelope intersects the query box.
    pub fn facets_in(&self, env: &Envelope) -> Vec<usize> {
        self.facet_tree.query(env)
    }

    /// Source indices whose envelope intersects the query box.
    pub fn sources_in(&self, env: &Envelope) -> Vec<usize> {
        self.source_tree.query(env)
    }

    /// Terrain triangle indices whose envelope intersects the query box.
    pub fn triangles_in(&self, env: &Envelope) -> Vec<usize> {
        self.terrain_tree.query(env)
    }

    /// Interpolated terrain elevation under a plan position, 0 without
    /// terrain. Starts from a tight envelope and widens the search window
    /// until candidate triangles appear.
    pub fn z_ground(&self, c: &Coord) -> f64 {
        ground_at(self.terrain.as_ref(), &self.terrain_tree, self.max_line_length, c)
    }

    /// Terrain triangle under a plan position by barycentric nearest
    /// match, tolerating points marginally outside any triangle.
    pub fn triangle_at(&self, c: &Coord) -> Option<usize> {
        let mesh = self.terrain.as_ref()?;
        let mut env = Envelope::of_coord(c);
        env.expand_by(1.0);
        let mut best = None;
        let mut best_err = f64::MAX;
        for idx in self.terrain_tree.query(&env) {
            let (_, err) = mesh.triangle_error(idx, c);
            if err < best_err {
                best_err = err;
                best = Some(idx);
            }
        }
        best
    }

    /// Absolute elevation of the highest thing at a plan position: a roof
    /// when a building covers it, the terrain otherwise.
    pub fn z_at(&self, c: &Coord) -> f64 {
        let env = Envelope::of_coord(c);
        for b_idx in self.building_tree.query(&env) {
            if self.buildings[b_idx].contains(c) {
                return self.buildings[b_idx].top_z();
            }
        }
        self.z_ground(c)
    }

    /// Terrain crossings of the plan segment `p0`-`p1`, heights
    /// interpolated along the crossed triangle edges.
    pub fn topographic_profile(&self, p0: &Coord, p1: &Coord) -> Vec<Coord> {
        let Some(mesh) = self.terrain.as_ref() else {
            return Vec::new();
        };
        match self.triangle_at(p0) {
            Some(start) => mesh.traverse(start, p0, p1),
            None => Vec::new(),
        }
    }

    /// Convert source and receiver heights from ground-relative to
    /// absolute elevations. Line sources gain intermediate vertices at
    /// every terrain triangle edge they cross so their profile follows
    /// the ground.
    pub fn make_relative_z_absolute(&mut self) {
        if self.terrain.is_none() {
            return;
        }
        let mut receivers = std::mem::take(&mut self.receivers);
        for r in &mut receivers {
            r.position.z += self.z_ground(&r.position);
        }
        self.receivers = receivers;

        let mut sources = std::mem::take(&mut self.sources);
        for s in &mut sources {
            s.geometry = match std::mem::replace(&mut s.geometry, SourceGeometry::Point(Coord::new(0.0, 0.0, 0.0))) {
                SourceGeometry::Point(mut c) => {
                    c.z += self.z_ground(&c);
                    SourceGeometry::Point(c)
                }
                SourceGeometry::Line(line) => SourceGeometry::Line(self.densify_to_ground(line)),
                SourceGeometry::MultiLine(lines) => SourceGeometry::MultiLine(
                    lines
                        .into_iter()
                        .map(|l| self.densify_to_ground(l))
                        .collect(),
                ),
            };
        }
        self.sources = sources;
    }

    fn densify_to_ground(&self, line: Vec<Coord>) -> Vec<Coord> {
        let mut out = Vec::with_capacity(line.len());
        for w in line.windows(2) {
            let (p0, p1) = (w[0], w[1]);
            let len = p0.distance_2d(&p1);
            out.push(Coord::new(p0.x, p0.y, p0.z + self.z_ground(&p0)));
            if len > f64::EPSILON {
                for crossing in self.topographic_profile(&p0, &p1) {
                    let t = p0.distance_2d(&crossing) / len;
                    let rel = p0.z + t * (p1.z - p0.z);
                    out.push(Coord::new(crossing.x, crossing.y, rel + crossing.z));
                }
            }
        }
        if let Some(last) = line.last() {
            out.push(Coord::new(last.x, last.y, last.z + self.z_ground(last)));
        }
        out
    }
}

/// Expanding-window terrain lookup shared by the builder and the scene.
fn ground_at(
    terrain: Option<&TerrainMesh>,
    tree: &StrTree,
    window: f64,
    c: &Coord,
) -> f64 {
    let Some(mesh) = terrain else {
        return 0.0;
    };
    let mut env = Envelope::of_coord(c);
    let mut found: Vec<usize> = Vec::new();
    for _ in 0..32 {
        env.expand_by(window);
        tree.query_into(&env, &mut found);
        if !found.is_empty() {
            break;
        }
    }
    for idx in found {
        let (inside, _) = mesh.triangle_error(idx, c);
        if inside {
            return mesh.interpolate_z(idx, c);
        }
    }
    0.0
}

fn ring_mean_ground(scene: &Scene, ring: &[Coord]) -> f64 {
    let n = ring.len().saturating_sub(1);
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = ring[..n]
        .iter()
        .map(|c| ground_at(scene.terrain.as_ref(), &scene.terrain_tree, scene.max_line_length, c))
        .sum();
    sum / n as f64
}

/// Close a ring in place, rejecting degenerate footprints.
fn close_ring(mut ring: Vec<Coord>) -> SceneResult<Vec<Coord>> {
    if ring.len() < 3 {
        return Err(SceneError::DegenerateFootprint);
    }
    let first = ring[0];
    let last = ring[ring.len() - 1];
    if !first.same_position_2d(&last, 1e-9) {
        ring.push(first);
    }
    if ring.len() < 4 {
        return Err(SceneError::DegenerateFootprint);
    }
    Ok(ring)
}

/// Ray-casting point in polygon test over a closed ring.
fn point_in_ring(c: &Coord, ring: &[Coord]) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (&w[0], &w[1]);
        if (a.y > c.y) != (b.y > c.y) {
            let x = a.x + (c.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if c.x < x {
                inside = !inside;
            }
        }
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Coord> {
        vec![
            Coord::flat(x0, y0),
            Coord::flat(x1, y0),
            Coord::flat(x1, y1),
            Coord::flat(x0, y1),
        ]
    }

    fn flat_terrain(builder: &mut SceneBuilder, extent: f64, z: f64) {
        for (x, y) in [
            (-extent, -extent),
            (extent, -extent),
            (extent, extent),
            (-extent, extent),
            (0.0, 0.0),
        ] {
            builder.add_topographic_point(Coord::new(x, y, z));
        }
    }

    #[test]
    fn test_building_elevation_from_terrain() {
        let mut builder = SceneBuilder::new();
        flat_terrain(&mut builder, 100.0, 2.0);
        builder
            .add_building(square(10.0, 10.0, 20.0, 20.0), 8.0, vec![])
            .unwrap();
        let scene = builder.finish().unwrap();
        let b = &scene.buildings()[0];
        assert!((b.z_topo() - 2.0).abs() < 1e-9);
        assert!((b.top_z() - 10.0).abs() < 1e-9);
        // Exploded facets carry the roof height
        for &f in b.walls() {
            assert!((scene.facets()[f].p0.z - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_z_ground_without_terrain() {
        let mut builder = SceneBuilder::new();
        builder
            .add_building(square(0.0, 0.0, 5.0, 5.0), 4.0, vec![])
            .unwrap();
        let scene = builder.finish().unwrap();
        assert_eq!(scene.z_ground(&Coord::flat(2.0, 2.0)), 0.0);
        // Without terrain the roof sits at the bare height
        assert!((scene.buildings()[0].top_z() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_z_at_prefers_roof() {
        let mut builder = SceneBuilder::new();
        flat_terrain(&mut builder, 50.0, 0.0);
        builder
            .add_building(square(0.0, 0.0, 10.0, 10.0), 12.0, vec![])
            .unwrap();
        let scene = builder.finish().unwrap();
        assert!((scene.z_at(&Coord::flat(5.0, 5.0)) - 12.0).abs() < 1e-9);
        assert!(scene.z_at(&Coord::flat(30.0, 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_polygon_source_rejected() {
        let mut builder = SceneBuilder::new();
        let err = builder
            .add_source(Geometry::Polygon(square(0.0, 0.0, 1.0, 1.0)), vec![90.0; 8], None)
            .unwrap_err();
        assert!(matches!(err, SceneError::UnsupportedSourceGeometry(_)));
    }

    #[test]
    fn test_degenerate_footprint_rejected() {
        let mut builder = SceneBuilder::new();
        let err = builder
            .add_building(vec![Coord::flat(0.0, 0.0), Coord::flat(1.0, 1.0)], 3.0, vec![])
            .unwrap_err();
        assert!(matches!(err, SceneError::DegenerateFootprint));
    }

    #[test]
    fn test_facets_in_envelope() {
        let mut builder = SceneBuilder::new();
        builder
            .add_building(square(0.0, 0.0, 10.0, 10.0), 5.0, vec![])
            .unwrap();
        builder
            .add_wall(
                vec![Coord::flat(50.0, 0.0), Coord::flat(50.0, 10.0)],
                3.0,
                vec![],
            )
            .unwrap();
        let scene = builder.finish().unwrap();
        let near_building = scene.facets_in(&Envelope::of(
            &Coord::flat(-1.0, -1.0),
            &Coord::flat(11.0, 11.0),
        ));
        // 4 building edges + 4 hard-ground boundary edges
        assert_eq!(near_building.len(), 8);
        let near_wall = scene.facets_in(&Envelope::of(
            &Coord::flat(49.0, 1.0),
            &Coord::flat(51.0, 2.0),
        ));
        assert_eq!(near_wall.len(), 1);
        assert_eq!(scene.facets()[near_wall[0]].kind, CutKind::Wall);
    }

    #[test]
    fn test_relative_heights_become_absolute() {
        let mut builder = SceneBuilder::new();
        flat_terrain(&mut builder, 100.0, 5.0);
        builder
            .add_source(
                Geometry::Point(Coord::new(0.0, 0.0, 0.5)),
                vec![90.0; 8],
                None,
            )
            .unwrap();
        builder.add_receiver(Coord::new(20.0, 0.0, 1.5));
        let mut scene = builder.finish().unwrap();
        scene.make_relative_z_absolute();
        match &scene.sources()[0].geometry {
            SourceGeometry::Point(c) => assert!((c.z - 5.5).abs() < 1e-9),
            _ => panic!("expected point source"),
        }
        assert!((scene.receivers()[0].position.z - 6.5).abs() < 1e-9);
    }
}
