// Generic 3-dimensional k-d tree backed by an object pool.
//
// The tree is unbalanced: shape follows insertion order, with the splitting
// axis cycling x -> y -> z by depth. It is flushed and rebuilt from scratch
// every tick, so skew never accumulates across ticks. There is no delete.
//
// Nodes are pool handles, not pointers. Traversals run on explicit stacks so
// a degenerate tree (sorted input, depth == node count) cannot overflow the
// thread stack; visiting order and pruning match the textbook recursion.

use glam::Vec3;

use super::math::safe_divide;
use super::object_pool::{ObjectPool, PoolHandle};

const DIMENSIONS: usize = 3;

/// Data carried by a tree node.
///
/// `PLACEHOLDER` marks the synthetic root installed by
/// [`KdTree::reset_with_average_location`]; such nodes are never returned by
/// a query and never counted in the flush average.
pub trait KdTreePayload: Copy + PartialEq + std::fmt::Debug {
    const PLACEHOLDER: Self;

    #[inline]
    fn is_placeholder(&self) -> bool {
        *self == Self::PLACEHOLDER
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KdTreeNode<P> {
    pub location: Vec3,
    pub payload: P,
    left: Option<PoolHandle>,
    right: Option<PoolHandle>,
}

impl<P: KdTreePayload> Default for KdTreeNode<P> {
    fn default() -> Self {
        Self {
            location: Vec3::ZERO,
            payload: P::PLACEHOLDER,
            left: None,
            right: None,
        }
    }
}

impl<P: KdTreePayload> KdTreeNode<P> {
    /// Overwrites every field; pooled nodes come back dirty.
    fn populate(&mut self, payload: P, location: Vec3) {
        self.location = location;
        self.payload = payload;
        self.left = None;
        self.right = None;
    }

    #[inline]
    pub fn value_for_dimension(&self, dimension: usize) -> f32 {
        axis(self.location, dimension)
    }

    #[inline]
    fn should_skip(&self, payload_to_exclude: P) -> bool {
        self.payload.is_placeholder() || self.payload == payload_to_exclude
    }
}

#[inline]
fn axis(location: Vec3, dimension: usize) -> f32 {
    match dimension {
        0 => location.x,
        1 => location.y,
        _ => location.z,
    }
}

/// Decides whether a node belongs in a range query's output.
///
/// Policies whose notion of "in range" extends past the node's own point (an
/// obstacle edge running from the node to its successor) report how far it
/// extends through `search_margin`; pruning then widens the range by that
/// much. `forces_full_search` disables pruning when no such bound is known.
pub trait RangeCheck<P> {
    fn passes(&self, node: &KdTreeNode<P>, target: Vec3, range_squared: f32) -> bool;

    fn search_margin(&self) -> f32 {
        0.0
    }

    fn forces_full_search(&self) -> bool {
        false
    }
}

/// Plain squared Euclidean distance from the node's point.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointDistance;

impl<P> RangeCheck<P> for PointDistance {
    #[inline]
    fn passes(&self, node: &KdTreeNode<P>, target: Vec3, range_squared: f32) -> bool {
        node.location.distance_squared(target) < range_squared
    }
}

pub struct KdTree<P: KdTreePayload> {
    root: Option<PoolHandle>,
    node_pool: ObjectPool<KdTreeNode<P>>,
}

impl<P: KdTreePayload> Default for KdTree<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: KdTreePayload> KdTree<P> {
    pub fn new() -> Self {
        Self {
            root: None,
            node_pool: ObjectPool::new(),
        }
    }

    /// Tree whose pool is pre-sized for `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            root: None,
            node_pool: ObjectPool::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<&KdTreeNode<P>> {
        self.root.and_then(|handle| self.node_pool.get(handle))
    }

    pub fn node_pool(&self) -> &ObjectPool<KdTreeNode<P>> {
        &self.node_pool
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    /// Inserts `payload` at `location`: left when strictly less than the
    /// current node on the splitting axis, right otherwise.
    pub fn insert_node(&mut self, payload: P, location: Vec3) {
        let handle = self.node_pool.take();
        match self.node_pool.get_mut(handle) {
            Some(node) => node.populate(payload, location),
            None => {
                log::error!(target: "spatial", "KdTree::insert_node: pool returned an unknown handle");
                return;
            }
        }

        let Some(mut current) = self.root else {
            self.root = Some(handle);
            return;
        };

        let mut depth = 0usize;
        loop {
            let Some(node) = self.node_pool.get_mut(current) else {
                log::error!(target: "spatial", "KdTree::insert_node: broken child link at depth {depth}");
                self.node_pool.release(Some(handle));
                return;
            };

            let dimension = depth % DIMENSIONS;
            let branch = if axis(location, dimension) < node.value_for_dimension(dimension) {
                &mut node.left
            } else {
                &mut node.right
            };

            match *branch {
                Some(child) => {
                    current = child;
                    depth += 1;
                }
                None => {
                    *branch = Some(handle);
                    return;
                }
            }
        }
    }

    /// Releases every node back to the pool and returns the mean location of
    /// the non-placeholder nodes (zero when there were none).
    ///
    /// Children are released before their parents and the root goes last.
    pub fn flush_all_nodes(&mut self) -> Vec3 {
        let Some(root) = self.root.take() else {
            return Vec3::ZERO;
        };

        let mut sum_location = Vec3::ZERO;
        let mut num_nodes = 0u32;

        // Pre-order walk; releasing in reverse pre-order is a valid post-order
        // for the purpose of "every child before its parent".
        let mut visited = Vec::with_capacity(self.node_pool.num_allocated());
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            let Some(node) = self.node_pool.get(handle) else {
                continue;
            };
            if !node.payload.is_placeholder() {
                sum_location += node.location;
                num_nodes += 1;
            }
            stack.extend(node.right);
            stack.extend(node.left);
            visited.push(handle);
        }

        for handle in visited.into_iter().rev() {
            self.node_pool.release(Some(handle));
        }

        safe_divide(sum_location, num_nodes as f32)
    }

    /// Flushes the tree and installs a placeholder root at the average
    /// location of the flushed nodes. After this call the tree always has a
    /// root.
    pub fn reset_with_average_location(&mut self) {
        let average_location = self.flush_all_nodes();

        let handle = self.node_pool.take();
        if let Some(node) = self.node_pool.get_mut(handle) {
            node.populate(P::PLACEHOLDER, average_location);
            self.root = Some(handle);
        }
    }

    /// Releases every node and then drops the pool's storage. Teardown only.
    pub fn clear(&mut self) {
        self.flush_all_nodes();
        self.node_pool.clear_pool();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Nearest non-placeholder node to `target` whose payload differs from
    /// `payload_to_exclude`.
    ///
    /// Ties keep the node found first (node before its near subtree, near
    /// subtree before far subtree).
    pub fn find_node_closest_to_location(
        &self,
        target: Vec3,
        payload_to_exclude: P,
    ) -> Option<&KdTreeNode<P>> {
        let Some(root) = self.root else {
            log::warn!(target: "spatial", "find_node_closest_to_location: tree has no root");
            return None;
        };

        let mut best: Option<(&KdTreeNode<P>, f32)> = None;

        // (node, depth, squared distance from target to the nearest splitting
        // plane separating this subtree from the target)
        let mut stack = vec![(root, 0usize, 0.0f32)];
        while let Some((handle, depth, plane_distance_squared)) = stack.pop() {
            if let Some((_, best_distance_squared)) = best {
                if best_distance_squared <= plane_distance_squared {
                    continue;
                }
            }

            let Some(node) = self.node_pool.get(handle) else {
                continue;
            };

            if !node.should_skip(payload_to_exclude) {
                let distance_squared = node.location.distance_squared(target);
                if best.is_none_or(|(_, best_distance_squared)| distance_squared < best_distance_squared) {
                    best = Some((node, distance_squared));
                }
            }

            let dimension = depth % DIMENSIONS;
            let difference = axis(target, dimension) - node.value_for_dimension(dimension);
            let (near, far) = if difference < 0.0 {
                (node.left, node.right)
            } else {
                (node.right, node.left)
            };

            // Far pushed first so the near branch is explored first.
            if let Some(far) = far {
                let far_bound = plane_distance_squared.max(difference * difference);
                stack.push((far, depth + 1, far_bound));
            }
            if let Some(near) = near {
                stack.push((near, depth + 1, plane_distance_squared));
            }
        }

        best.map(|(node, _)| node)
    }

    /// Appends to `out` the payload of every node that passes `check` and is
    /// neither a placeholder nor `payload_to_exclude`. Returns whether
    /// anything was appended.
    ///
    /// A subtree is skipped when the target is at least `sqrt(range_squared)`
    /// plus the check's margin away from its splitting plane, unless `check`
    /// forces a full search.
    pub fn find_nodes_within_range<C: RangeCheck<P>>(
        &self,
        out: &mut Vec<P>,
        target: Vec3,
        range_squared: f32,
        payload_to_exclude: P,
        check: &C,
    ) -> bool {
        if range_squared <= 0.0 {
            log::error!(target: "spatial", "find_nodes_within_range: searching range is less than or equal to 0");
            return false;
        }

        let Some(root) = self.root else {
            log::warn!(target: "spatial", "find_nodes_within_range: tree has no root");
            return false;
        };

        let force_full_search = check.forces_full_search();
        let margin = check.search_margin();
        let prune_range_squared = if margin > 0.0 {
            let prune_range = range_squared.sqrt() + margin;
            prune_range * prune_range
        } else {
            range_squared
        };
        let previous_len = out.len();

        let mut stack = vec![(root, 0usize)];
        while let Some((handle, depth)) = stack.pop() {
            let Some(node) = self.node_pool.get(handle) else {
                continue;
            };

            if !node.should_skip(payload_to_exclude) && check.passes(node, target, range_squared) {
                out.push(node.payload);
            }

            let dimension = depth % DIMENSIONS;
            let difference = axis(target, dimension) - node.value_for_dimension(dimension);
            if force_full_search || difference * difference < prune_range_squared {
                stack.extend(node.right.map(|child| (child, depth + 1)));
                stack.extend(node.left.map(|child| (child, depth + 1)));
            } else if difference < 0.0 {
                stack.extend(node.left.map(|child| (child, depth + 1)));
            } else {
                stack.extend(node.right.map(|child| (child, depth + 1)));
            }
        }

        out.len() > previous_len
    }

    /// Unpruned search for `payload`. Diagnostics and tests only.
    pub fn does_payload_exist(&self, payload: P) -> bool {
        if payload.is_placeholder() {
            return false;
        }
        self.iter_nodes().any(|node| node.payload == payload)
    }

    /// Number of non-placeholder nodes.
    pub fn node_count(&self) -> usize {
        self.iter_nodes().filter(|node| !node.payload.is_placeholder()).count()
    }

    /// Depth of the deepest node, counting the root as depth 1. Zero for an
    /// empty tree.
    pub fn max_depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack: Vec<(PoolHandle, usize)> = self.root.map(|root| (root, 1)).into_iter().collect();
        while let Some((handle, depth)) = stack.pop() {
            let Some(node) = self.node_pool.get(handle) else {
                continue;
            };
            deepest = deepest.max(depth);
            stack.extend(node.left.map(|child| (child, depth + 1)));
            stack.extend(node.right.map(|child| (child, depth + 1)));
        }
        deepest
    }

    fn iter_nodes(&self) -> impl Iterator<Item = &KdTreeNode<P>> + '_ {
        let mut stack: Vec<PoolHandle> = self.root.into_iter().collect();
        std::iter::from_fn(move || {
            let handle = stack.pop()?;
            let node = self.node_pool.get(handle)?;
            stack.extend(node.right);
            stack.extend(node.left);
            Some(node)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Marker(u32);

    impl KdTreePayload for Marker {
        const PLACEHOLDER: Self = Marker(u32::MAX);
    }

    fn tree_of(points: &[Vec3]) -> KdTree<Marker> {
        let mut tree = KdTree::new();
        for (i, point) in points.iter().enumerate() {
            tree.insert_node(Marker(i as u32), *point);
        }
        tree
    }

    #[test]
    fn empty_tree_queries_find_nothing() {
        let tree: KdTree<Marker> = KdTree::new();
        let mut out = Vec::new();
        assert!(tree.find_node_closest_to_location(Vec3::ZERO, Marker::PLACEHOLDER).is_none());
        assert!(!tree.find_nodes_within_range(&mut out, Vec3::ZERO, 100.0, Marker::PLACEHOLDER, &PointDistance));
        assert!(out.is_empty());
        assert_eq!(tree.max_depth(), 0);
    }

    #[test]
    fn insert_branches_on_cycling_axis() {
        // Root splits on x, its children on y.
        let tree = tree_of(&[
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(-1.0, 5.0, 0.0),
            Vec3::new(1.0, 5.0, 0.0),
            Vec3::new(-2.0, 1.0, 0.0),
        ]);
        let root = tree.root().expect("root");
        let left = tree.node_pool.get(root.left.expect("left")).expect("left node");
        let right = tree.node_pool.get(root.right.expect("right")).expect("right node");
        assert_eq!(left.payload, Marker(1));
        assert_eq!(right.payload, Marker(2));
        // y: 1.0 < 5.0 under the left child.
        let left_left = tree.node_pool.get(left.left.expect("left.left")).expect("node");
        assert_eq!(left_left.payload, Marker(3));
        assert_eq!(tree.max_depth(), 3);
    }

    #[test]
    fn equal_coordinate_goes_right() {
        let tree = tree_of(&[Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 9.0, 0.0)]);
        let root = tree.root().expect("root");
        assert!(root.left.is_none());
        assert!(root.right.is_some());
    }

    #[test]
    fn placeholder_root_is_never_returned() {
        let mut tree: KdTree<Marker> = KdTree::new();
        tree.reset_with_average_location();
        assert!(tree.root().is_some());
        assert!(tree.find_node_closest_to_location(Vec3::ZERO, Marker::PLACEHOLDER).is_none());

        let mut out = Vec::new();
        assert!(!tree.find_nodes_within_range(&mut out, Vec3::ZERO, 10.0, Marker::PLACEHOLDER, &PointDistance));

        tree.insert_node(Marker(4), Vec3::new(100.0, 0.0, 0.0));
        let found = tree.find_node_closest_to_location(Vec3::ZERO, Marker::PLACEHOLDER);
        assert_eq!(found.map(|node| node.payload), Some(Marker(4)));
    }

    #[test]
    fn excluded_payload_is_skipped_but_its_subtree_is_searched() {
        let tree = tree_of(&[Vec3::new(0.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0)]);
        let found = tree.find_node_closest_to_location(Vec3::ZERO, Marker(0));
        assert_eq!(found.map(|node| node.payload), Some(Marker(1)));

        let only_self = tree_of(&[Vec3::ZERO]);
        assert!(only_self.find_node_closest_to_location(Vec3::ZERO, Marker(0)).is_none());
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let tree = tree_of(&[Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)]);
        let found = tree.find_node_closest_to_location(Vec3::ZERO, Marker::PLACEHOLDER);
        assert_eq!(found.map(|node| node.payload), Some(Marker(0)));
    }

    #[test]
    fn flush_returns_average_and_recycles_nodes() {
        let mut tree = tree_of(&[
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 4.0, 6.0),
            Vec3::new(4.0, 8.0, 0.0),
        ]);
        let average = tree.flush_all_nodes();
        assert_eq!(average, Vec3::new(2.0, 4.0, 2.0));
        assert!(tree.is_empty());
        assert_eq!(tree.node_pool().num_available(), 3);

        tree.reset_with_average_location();
        tree.insert_node(Marker(9), Vec3::ONE);
        tree.insert_node(Marker(10), Vec3::ONE);
        // Placeholder plus two nodes, all served from recycled storage.
        assert_eq!(tree.node_pool().num_allocated(), 3);
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn flush_of_placeholder_only_tree_is_zero() {
        let mut tree: KdTree<Marker> = KdTree::new();
        tree.reset_with_average_location();
        assert_eq!(tree.flush_all_nodes(), Vec3::ZERO);
    }

    #[test]
    fn reset_seeds_placeholder_at_previous_average() {
        let mut tree = tree_of(&[Vec3::new(10.0, 0.0, 0.0), Vec3::new(20.0, 10.0, 0.0)]);
        tree.reset_with_average_location();
        let root = tree.root().expect("placeholder root");
        assert!(root.payload.is_placeholder());
        assert_eq!(root.location, Vec3::new(15.0, 5.0, 0.0));
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn non_positive_range_is_rejected() {
        let tree = tree_of(&[Vec3::ZERO]);
        let mut out = Vec::new();
        assert!(!tree.find_nodes_within_range(&mut out, Vec3::ZERO, 0.0, Marker::PLACEHOLDER, &PointDistance));
        assert!(!tree.find_nodes_within_range(&mut out, Vec3::ZERO, -4.0, Marker::PLACEHOLDER, &PointDistance));
        assert!(out.is_empty());
    }

    #[test]
    fn sorted_input_degenerates_but_stays_correct() {
        let points: Vec<Vec3> = (0..2000).map(|i| Vec3::splat(i as f32)).collect();
        let tree = tree_of(&points);
        assert_eq!(tree.max_depth(), points.len());

        let target = Vec3::new(1234.2, 1233.9, 1234.4);
        let found = tree.find_node_closest_to_location(target, Marker::PLACEHOLDER);
        assert_eq!(found.map(|node| node.payload), Some(Marker(1234)));

        let mut out = Vec::new();
        tree.find_nodes_within_range(&mut out, Vec3::splat(10.0), 3.5 * 3.5, Marker::PLACEHOLDER, &PointDistance);
        out.sort_by_key(|marker| marker.0);
        // Diagonal step is sqrt(3) ~= 1.73, so +-2 steps fit within 3.5.
        assert_eq!(out, vec![Marker(8), Marker(9), Marker(10), Marker(11), Marker(12)]);
    }

    struct Everything;

    impl RangeCheck<Marker> for Everything {
        fn passes(&self, _node: &KdTreeNode<Marker>, _target: Vec3, _range_squared: f32) -> bool {
            true
        }

        fn forces_full_search(&self) -> bool {
            true
        }
    }

    #[test]
    fn forced_full_search_visits_every_node() {
        let points: Vec<Vec3> = (0..50).map(|i| Vec3::new(i as f32 * 100.0, 0.0, 0.0)).collect();
        let tree = tree_of(&points);
        let mut out = Vec::new();
        tree.find_nodes_within_range(&mut out, Vec3::ZERO, 1.0, Marker::PLACEHOLDER, &Everything);
        assert_eq!(out.len(), 50);

        out.clear();
        tree.find_nodes_within_range(&mut out, Vec3::ZERO, 1.0, Marker::PLACEHOLDER, &PointDistance);
        assert_eq!(out, vec![Marker(0)]);
    }

    /// Passes when the point `offset` away from the node is in range, the way
    /// an edge check reaches past the node's own point.
    struct Offset {
        offset: Vec3,
        full_search: bool,
    }

    impl RangeCheck<Marker> for Offset {
        fn passes(&self, node: &KdTreeNode<Marker>, target: Vec3, range_squared: f32) -> bool {
            (node.location + self.offset).distance_squared(target) < range_squared
        }

        fn search_margin(&self) -> f32 {
            self.offset.length()
        }

        fn forces_full_search(&self) -> bool {
            self.full_search
        }
    }

    #[test]
    fn widened_pruning_matches_full_search() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(5);
        let points: Vec<Vec3> = (0..500)
            .map(|_| Vec3::new(rng.gen_range(-1000.0..1000.0), rng.gen_range(-1000.0..1000.0), 0.0))
            .collect();
        let tree = tree_of(&points);
        let offset = Vec3::new(120.0, -40.0, 0.0);
        let pruned = Offset {
            offset,
            full_search: false,
        };
        let full = Offset {
            offset,
            full_search: true,
        };

        let mut found_any = false;
        for _ in 0..200 {
            let target = Vec3::new(rng.gen_range(-1000.0..1000.0), rng.gen_range(-1000.0..1000.0), 0.0);
            let mut expected = Vec::new();
            let mut found = Vec::new();
            tree.find_nodes_within_range(&mut expected, target, 80.0 * 80.0, Marker::PLACEHOLDER, &full);
            tree.find_nodes_within_range(&mut found, target, 80.0 * 80.0, Marker::PLACEHOLDER, &pruned);
            expected.sort_by_key(|marker| marker.0);
            found.sort_by_key(|marker| marker.0);
            assert_eq!(found, expected, "target {target}");
            found_any |= !found.is_empty();
        }
        assert!(found_any);
    }

    #[test]
    fn clear_drops_all_pooled_storage() {
        let mut tree: KdTree<Marker> = KdTree::with_capacity(16);
        tree.reset_with_average_location();
        tree.insert_node(Marker(0), Vec3::ZERO);
        tree.insert_node(Marker(1), Vec3::ONE);
        tree.flush_all_nodes();
        tree.insert_node(Marker(2), Vec3::X);
        assert_eq!(tree.node_pool().num_allocated(), 3);

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.node_pool().num_allocated(), 0);
        assert_eq!(tree.node_pool().num_available(), 0);

        tree.insert_node(Marker(3), Vec3::Y);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn payload_existence() {
        let tree = tree_of(&[Vec3::ZERO, Vec3::ONE]);
        assert!(tree.does_payload_exist(Marker(1)));
        assert!(!tree.does_payload_exist(Marker(2)));
        assert!(!tree.does_payload_exist(Marker::PLACEHOLDER));
    }
}
