//! 2D spatial index for nearest-neighbour matching.

use std::cmp::Ordering;

/// Narrow query interface so the matching code does not depend on one index.
pub trait SpatialIndex {
    /// Nearest indexed point as `(index, distance)`.
    fn nearest(&self, query: [f64; 2]) -> Option<(usize, f64)>;

    /// All indexed points within `radius` (inclusive), sorted by distance,
    /// ties by index.
    fn within_radius(&self, query: [f64; 2], radius: f64) -> Vec<(usize, f64)>;
}

/// A 2D k-d tree, built once with median splits and queried many times.
#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone)]
struct KdNode {
    /// Index into the points array
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    /// Split dimension (0 = x, 1 = y)
    split_dim: usize,
}

impl KdTree {
    /// Build a tree over `points`. An empty input gives an empty tree.
    pub fn build(points: &[[f64; 2]]) -> Self {
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        Self::build_recursive(points, &mut indices, 0, &mut nodes);
        Self {
            nodes,
            points: points.to_vec(),
        }
    }

    fn build_recursive(
        points: &[[f64; 2]],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let split_dim = depth % 2;
        indices.sort_by(|&a, &b| {
            points[a][split_dim]
                .partial_cmp(&points[b][split_dim])
                .unwrap_or(Ordering::Equal)
        });

        let median = indices.len() / 2;
        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, &mut right_part[1..], depth + 1, nodes);
        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn nearest_recursive(&self, node_idx: usize, query: [f64; 2], best: &mut Option<(usize, f64)>) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];
        let d2 = distance_squared(query, point);
        let better = match *best {
            None => true,
            Some((bi, bd)) => d2 < bd || (d2 == bd && node.point_idx < bi),
        };
        if better {
            *best = Some((node.point_idx, d2));
        }

        let diff = query[node.split_dim] - point[node.split_dim];
        let (first, second) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(i) = first {
            self.nearest_recursive(i, query, best);
        }
        if let Some(i) = second {
            if best.map_or(true, |(_, bd)| diff * diff <= bd) {
                self.nearest_recursive(i, query, best);
            }
        }
    }

    fn radius_recursive(
        &self,
        node_idx: usize,
        query: [f64; 2],
        radius_sq: f64,
        results: &mut Vec<(usize, f64)>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];
        let d2 = distance_squared(query, point);
        if d2 <= radius_sq {
            results.push((node.point_idx, d2));
        }
        let diff = query[node.split_dim] - point[node.split_dim];
        let diff_sq = diff * diff;
        if let Some(left) = node.left {
            if diff < 0.0 || diff_sq <= radius_sq {
                self.radius_recursive(left, query, radius_sq, results);
            }
        }
        if let Some(right) = node.right {
            if diff >= 0.0 || diff_sq <= radius_sq {
                self.radius_recursive(right, query, radius_sq, results);
            }
        }
    }
}

impl SpatialIndex for KdTree {
    fn nearest(&self, query: [f64; 2]) -> Option<(usize, f64)> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut best = None;
        self.nearest_recursive(0, query, &mut best);
        best.map(|(i, d2)| (i, d2.sqrt()))
    }

    fn within_radius(&self, query: [f64; 2], radius: f64) -> Vec<(usize, f64)> {
        if self.nodes.is_empty() || radius < 0.0 {
            return Vec::new();
        }
        let mut results = Vec::new();
        self.radius_recursive(0, query, radius * radius, &mut results);
        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results.into_iter().map(|(i, d2)| (i, d2.sqrt())).collect()
    }
}

#[inline]
fn distance_squared(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}
