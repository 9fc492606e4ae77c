//! Mirror receiver index
//!
//! Specular reflection candidates come from the image-source method: the
//! receiver is mirrored across every nearby wall, each image is mirrored
//! again across the other walls, and so on up to the configured reflection
//! order. The images form a tree stored as a flat arena of nodes holding
//! parent indices, so walking a chain back toward the real receiver never
//! touches an owning pointer and can never cycle: depth is bounded by the
//! reflection order at construction time.

use crate::geometry::{distance_point_segment_3d, mirror_2d, Coord};
use crate::scene::Scene;

/// One receiver image in the reflection tree.
#[derive(Debug, Clone)]
pub struct MirrorNode {
    /// Image position of the receiver after this chain of reflections.
    pub position: Coord,
    /// Facet index of the wall producing this image.
    pub facet: usize,
    /// Arena index of the previous reflection, None for first-order
    /// images.
    pub parent: Option<usize>,
}

/// Arena of mirror receiver nodes for one receiver.
#[derive(Debug, Clone, Default)]
pub struct MirrorIndex {
    nodes: Vec<MirrorNode>,
}

impl MirrorIndex {
    /// Mirror `receiver` across the candidate wall facets, recursing up to
    /// `order` reflections. A wall only mirrors an image when it lies
    /// within `max_ref_dist` of it; images drifting further than
    /// `max_total_dist` from the receiver are pruned outright.
    pub fn build(
        scene: &Scene,
        candidate_facets: &[usize],
        receiver: &Coord,
        order: usize,
        max_ref_dist: f64,
        max_total_dist: f64,
    ) -> Self {
        let mut index = MirrorIndex::default();
        if order == 0 {
            return index;
        }
        // (position to mirror, parent arena slot, depth)
        let mut frontier: Vec<(Coord, Option<usize>, usize)> = vec![(*receiver, None, 0)];
        while let Some((position, parent, depth)) = frontier.pop() {
            if depth >= order {
                continue;
            }
            for &facet_idx in candidate_facets {
                // Never bounce twice in a row on the same wall
                if let Some(p) = parent {
                    if index.nodes[p].facet == facet_idx {
                        continue;
                    }
                }
                let facet = &scene.facets()[facet_idx];
                if distance_point_segment_3d(&position, &facet.p0, &facet.p1) > max_ref_dist {
                    continue;
                }
                let image = mirror_2d(&position, &facet.p0, &facet.p1);
                if image.same_position_2d(&position, 1e-9) {
                    // Point on the wall plane mirrors onto itself
                    continue;
                }
                if image.distance_2d(receiver) > max_total_dist {
                    continue;
                }
                index.nodes.push(MirrorNode {
                    position: image,
                    facet: facet_idx,
                    parent,
                });
                frontier.push((image, Some(index.nodes.len() - 1), depth + 1));
            }
        }
        index
    }

    pub fn nodes(&self) -> &[MirrorNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Arena indices of images within `max_src_dist` of a source position,
    /// nearest first.
    pub fn close_to(&self, source: &Coord, max_src_dist: f64) -> Vec<usize> {
        let mut hits: Vec<(f64, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| {
                let d = n.position.distance_2d(source);
                (d < max_src_dist).then_some((d, i))
            })
            .collect();
        hits.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        hits.into_iter().map(|(_, i)| i).collect()
    }

    /// Depth of a node: number of reflections in its chain.
    pub fn depth(&self, mut idx: usize) -> usize {
        let mut depth = 1;
        while let Some(parent) = self.nodes[idx].parent {
            depth += 1;
            idx = parent;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneBuilder;

    fn scene_with_two_walls() -> Scene {
        let mut builder = SceneBuilder::new();
        builder
            .add_wall(
                vec![Coord::new(10.0, -20.0, 0.0), Coord::new(10.0, 20.0, 0.0)],
                5.0,
                vec![0.2; 8],
            )
            .unwrap();
        builder
            .add_wall(
                vec![Coord::new(-10.0, -20.0, 0.0), Coord::new(-10.0, 20.0, 0.0)],
                5.0,
                vec![0.2; 8],
            )
            .unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_first_order_images() {
        let scene = scene_with_two_walls();
        let all: Vec<usize> = (0..scene.facets().len()).collect();
        let rcv = Coord::new(0.0, 0.0, 1.5);
        let index = MirrorIndex::build(&scene, &all, &rcv, 1, 50.0, 500.0);
        assert_eq!(index.nodes().len(), 2);
        let xs: Vec<f64> = index.nodes().iter().map(|n| n.position.x).collect();
        assert!(xs.contains(&20.0));
        assert!(xs.contains(&-20.0));
        for n in index.nodes() {
            assert!(n.parent.is_none());
            assert!((n.position.z - 1.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_second_order_images_chain_back() {
        let scene = scene_with_two_walls();
        let all: Vec<usize> = (0..scene.facets().len()).collect();
        let rcv = Coord::new(0.0, 0.0, 1.5);
        let index = MirrorIndex::build(&scene, &all, &rcv, 2, 50.0, 500.0);
        // 2 first order + 2 second order (each image bounces on the other
        // wall once)
        assert_eq!(index.nodes().len(), 4);
        let deep: Vec<&MirrorNode> = index
            .nodes()
            .iter()
            .filter(|n| n.parent.is_some())
            .collect();
        assert_eq!(deep.len(), 2);
        for n in deep {
            // Image of the image: x = +/- 40
            assert!((n.position.x.abs() - 40.0).abs() < 1e-9);
        }
        for i in 0..index.nodes().len() {
            assert!(index.depth(i) <= 2);
        }
    }

    #[test]
    fn test_order_zero_is_empty() {
        let scene = scene_with_two_walls();
        let all: Vec<usize> = (0..scene.facets().len()).collect();
        let index = MirrorIndex::build(&scene, &all, &Coord::new(0.0, 0.0, 1.5), 0, 50.0, 500.0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_close_to_sorts_by_distance() {
        let scene = scene_with_two_walls();
        let all: Vec<usize> = (0..scene.facets().len()).collect();
        let rcv = Coord::new(0.0, 0.0, 1.5);
        let index = MirrorIndex::build(&scene, &all, &rcv, 1, 50.0, 500.0);
        let src = Coord::new(15.0, 0.0, 0.5);
        let close = index.close_to(&src, 1000.0);
        assert_eq!(close.len(), 2);
        // The +x image is closer to a source at +15
        assert!((index.nodes()[close[0]].position.x - 20.0).abs() < 1e-9);
    }
}
