//! Packed bounding-box tree for range queries
//!
//! Sort-tile-recursive bulk loading over plan envelopes: leaves are packed
//! in x-sorted vertical slices, each slice y-sorted, then parent levels are
//! packed the same way until a single root remains. The tree is built once
//! and only answers envelope intersection queries, which is all the scene
//! index needs for edge, triangle and source lookups.

use crate::geometry::Envelope;

/// Entries per node.
const NODE_CAPACITY: usize = 5;

#[derive(Debug, Clone)]
struct Node {
    envelope: Envelope,
    /// Child node indices for inner nodes, item payloads for leaves.
    children: Vec<usize>,
    leaf: bool,
}

/// Static spatial index over `(Envelope, payload)` pairs.
#[derive(Debug, Clone, Default)]
pub struct StrTree {
    nodes: Vec<Node>,
    root: Option<usize>,
    len: usize,
}

impl StrTree {
    /// Bulk load the tree from items. The payload is returned verbatim by
    /// queries; callers usually store indices into their own tables.
    pub fn build(items: &[(Envelope, usize)]) -> Self {
        let mut tree = StrTree {
            nodes: Vec::new(),
            root: None,
            len: items.len(),
        };
        if items.is_empty() {
            return tree;
        }
        // Pack the leaf level
        let mut level = tree.pack_level(items.to_vec(), true);
        // Pack upper levels until a single root remains
        while level.len() > 1 {
            let entries: Vec<(Envelope, usize)> = level
                .iter()
                .map(|&idx| (tree.nodes[idx].envelope, idx))
                .collect();
            level = tree.pack_level(entries, false);
        }
        tree.root = level.first().copied();
        tree
    }

    /// Number of indexed items.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All payloads whose envelope intersects `query`.
    pub fn query(&self, query: &Envelope) -> Vec<usize> {
        let mut out = Vec::new();
        self.query_into(query, &mut out);
        out
    }

    /// Append matching payloads to `out` without allocating a fresh vector.
    pub fn query_into(&self, query: &Envelope, out: &mut Vec<usize>) {
        let Some(root) = self.root else {
            return;
        };
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.envelope.intersects(query) {
                continue;
            }
            if node.leaf {
                out.extend_from_slice(&node.children);
            } else {
                stack.extend_from_slice(&node.children);
            }
        }
    }

    fn pack_level(&mut self, mut entries: Vec<(Envelope, usize)>, leaf: bool) -> Vec<usize> {
        entries.sort_by(|a, b| {
            let ca = (a.0.min_x + a.0.max_x) / 2.0;
            let cb = (b.0.min_x + b.0.max_x) / 2.0;
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });
        let node_count = (entries.len() + NODE_CAPACITY - 1) / NODE_CAPACITY;
        let slice_count = (node_count as f64).sqrt().ceil() as usize;
        let slice_size = slice_count * NODE_CAPACITY;

        let mut level = Vec::with_capacity(node_count);
        for slice in entries.chunks_mut(slice_size.max(1)) {
            slice.sort_by(|a, b| {
                let ca = (a.0.min_y + a.0.max_y) / 2.0;
                let cb = (b.0.min_y + b.0.max_y) / 2.0;
                ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
            });
            for group in slice.chunks(NODE_CAPACITY) {
                let mut envelope = group[0].0;
                for (env, _) in group.iter().skip(1) {
                    envelope.merge(env);
                }
                let children = group.iter().map(|(_, payload)| *payload).collect();
                self.nodes.push(Node {
                    envelope,
                    children,
                    leaf,
                });
                level.push(self.nodes.len() - 1);
            }
        }
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coord;

    fn env(x0: f64, y0: f64, x1: f64, y1: f64) -> Envelope {
        Envelope::of(&Coord::new(x0, y0, 0.0), &Coord::new(x1, y1, 0.0))
    }

    #[test]
    fn test_empty_tree() {
        let tree = StrTree::build(&[]);
        assert!(tree.is_empty());
        assert!(tree.query(&env(0.0, 0.0, 100.0, 100.0)).is_empty());
    }

    #[test]
    fn test_query_matches_brute_force() {
        // 20x20 grid of unit boxes
        let mut items = Vec::new();
        for i in 0..20 {
            for j in 0..20 {
                let e = env(i as f64, j as f64, i as f64 + 1.0, j as f64 + 1.0);
                items.push((e, items.len()));
            }
        }
        let tree = StrTree::build(&items);
        assert_eq!(tree.len(), 400);

        let queries = [
            env(2.5, 2.5, 4.5, 4.5),
            env(-10.0, -10.0, -1.0, -1.0),
            env(0.0, 0.0, 20.0, 20.0),
            env(19.5, 19.5, 25.0, 25.0),
        ];
        for q in &queries {
            let mut expected: Vec<usize> = items
                .iter()
                .filter(|(e, _)| e.intersects(q))
                .map(|(_, id)| *id)
                .collect();
            let mut got = tree.query(q);
            expected.sort_unstable();
            got.sort_unstable();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_single_item() {
        let tree = StrTree::build(&[(env(5.0, 5.0, 6.0, 6.0), 42)]);
        assert_eq!(tree.query(&env(5.5, 5.5, 5.6, 5.6)), vec![42]);
        assert!(tree.query(&env(8.0, 8.0, 9.0, 9.0)).is_empty());
    }
}
