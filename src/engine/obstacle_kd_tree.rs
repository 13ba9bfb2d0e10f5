// Obstacle-point k-d tree. Nodes carry `(polygon, point)` indices into an
// `ObstaclesContainer`; range queries test distance to the edge leaving the
// node's point rather than to the point itself.

use bevy_ecs::prelude::*;
use glam::Vec3;

use super::kd_tree::{KdTree, KdTreeNode, KdTreePayload, RangeCheck};
use super::math::{amount_left_of_line, dist_sq_point_segment};
use super::obstacle::{ObstaclePoint, ObstaclesContainer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObstacleIndices {
    pub polygon: usize,
    pub point: usize,
}

impl KdTreePayload for ObstacleIndices {
    const PLACEHOLDER: Self = ObstacleIndices {
        polygon: usize::MAX,
        point: usize::MAX,
    };
}

impl ObstacleIndices {
    /// The point these indices name and its successor, i.e. the edge.
    pub fn resolve_edge(self, obstacles: &ObstaclesContainer) -> Option<(&ObstaclePoint, &ObstaclePoint)> {
        let polygon = obstacles.polygon(self.polygon)?;
        Some((polygon.get(self.point)?, polygon.next(self.point)?))
    }
}

/// Passes nodes whose outgoing edge is within range of the target and
/// faces it (target strictly on the right, outer side).
///
/// An edge reaches at most `longest_edge` past its start point, so pruning
/// widens the range by that much. An unknown (non-finite) bound falls back to
/// a full search.
pub struct ObstacleEdgeProximity<'a> {
    pub obstacles: &'a ObstaclesContainer,
    pub longest_edge: f32,
}

impl RangeCheck<ObstacleIndices> for ObstacleEdgeProximity<'_> {
    fn passes(&self, node: &KdTreeNode<ObstacleIndices>, target: Vec3, range_squared: f32) -> bool {
        let Some((start, end)) = node.payload.resolve_edge(self.obstacles) else {
            log::error!(
                target: "spatial",
                "ObstacleEdgeProximity: indices {:?} do not name an obstacle point",
                node.payload
            );
            return false;
        };

        let target = target.truncate();
        amount_left_of_line(start.point, end.point, target) < 0.0
            && dist_sq_point_segment(start.point, end.point, target) < range_squared
    }

    fn search_margin(&self) -> f32 {
        if self.longest_edge.is_finite() { self.longest_edge } else { 0.0 }
    }

    fn forces_full_search(&self) -> bool {
        !self.longest_edge.is_finite()
    }
}

#[derive(Resource, Default)]
pub struct ObstaclePointKdTree {
    tree: KdTree<ObstacleIndices>,
    /// Longest edge among the inserted polygons.
    longest_edge: f32,
}

impl ObstaclePointKdTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &KdTree<ObstacleIndices> {
        &self.tree
    }

    pub fn longest_edge(&self) -> f32 {
        self.longest_edge
    }

    /// One node per polygon point, placed on the ground plane (z = 0).
    pub fn insert_obstacle_polygons(&mut self, obstacles: &ObstaclesContainer) {
        for (polygon_index, polygon) in obstacles.polygons.iter().enumerate() {
            self.longest_edge = self.longest_edge.max(polygon.longest_edge());
            for (point_index, point) in polygon.points().iter().enumerate() {
                self.tree.insert_node(
                    ObstacleIndices {
                        polygon: polygon_index,
                        point: point_index,
                    },
                    point.point.extend(0.0),
                );
            }
        }
    }

    /// Drops the current contents and reinserts every polygon.
    pub fn rebuild(&mut self, obstacles: &ObstaclesContainer) {
        self.tree.reset_with_average_location();
        self.longest_edge = 0.0;
        self.insert_obstacle_polygons(obstacles);
        log::debug!(
            target: "spatial",
            "obstacle tree rebuilt: {} polygons, {} points, longest edge {:.1}",
            obstacles.polygons.len(),
            obstacles.num_points(),
            self.longest_edge
        );
    }

    /// Teardown: drops every node, pooled ones included.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.longest_edge = 0.0;
    }

    pub fn find_obstacles_within_range(
        &self,
        obstacles: &ObstaclesContainer,
        location: Vec3,
        radius: f32,
    ) -> Vec<ObstacleIndices> {
        let mut found = Vec::new();
        self.find_obstacles_within_range_into(&mut found, obstacles, location, radius);
        found
    }

    /// Appends matches to `out` without clearing it.
    pub fn find_obstacles_within_range_into(
        &self,
        out: &mut Vec<ObstacleIndices>,
        obstacles: &ObstaclesContainer,
        location: Vec3,
        radius: f32,
    ) -> bool {
        if radius <= 0.0 {
            log::error!(target: "spatial", "find_obstacles_within_range: radius {radius} is not positive");
            return false;
        }
        if self.tree.is_empty() {
            return false;
        }
        self.tree.find_nodes_within_range(
            out,
            location.truncate().extend(0.0),
            radius * radius,
            ObstacleIndices::PLACEHOLDER,
            &ObstacleEdgeProximity {
                obstacles,
                longest_edge: self.longest_edge,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;

    use super::*;
    use crate::engine::obstacle::ObstaclePolygon;

    fn box_obstacle() -> ObstaclesContainer {
        ObstaclesContainer::new(vec![ObstaclePolygon::from_points(&[
            Vec2::new(0.0, 0.0),
            Vec2::new(100.0, 0.0),
            Vec2::new(100.0, 100.0),
            Vec2::new(0.0, 100.0),
        ])])
    }

    fn built(obstacles: &ObstaclesContainer) -> ObstaclePointKdTree {
        let mut tree = ObstaclePointKdTree::new();
        tree.rebuild(obstacles);
        tree
    }

    #[test]
    fn finds_edge_whose_endpoints_are_out_of_range() {
        let obstacles = box_obstacle();
        let tree = built(&obstacles);
        // 20 below the middle of the bottom edge, 50+ from both endpoints.
        let found = tree.find_obstacles_within_range(&obstacles, Vec3::new(50.0, -20.0, 0.0), 30.0);
        assert_eq!(found, vec![ObstacleIndices { polygon: 0, point: 0 }]);
    }

    #[test]
    fn edges_facing_away_are_ignored() {
        let obstacles = box_obstacle();
        let tree = built(&obstacles);
        // Inside the box: on the left of every edge.
        let found = tree.find_obstacles_within_range(&obstacles, Vec3::new(50.0, 10.0, 0.0), 500.0);
        assert!(found.is_empty());
    }

    #[test]
    fn corner_query_returns_both_adjacent_edges() {
        let obstacles = box_obstacle();
        let tree = built(&obstacles);
        let mut found = tree.find_obstacles_within_range(&obstacles, Vec3::new(110.0, -10.0, 40.0), 20.0);
        found.sort();
        assert_eq!(
            found,
            vec![
                ObstacleIndices { polygon: 0, point: 0 },
                ObstacleIndices { polygon: 0, point: 1 },
            ]
        );
    }

    #[test]
    fn empty_tree_and_bad_radius_find_nothing() {
        let obstacles = ObstaclesContainer::default();
        let tree = ObstaclePointKdTree::new();
        assert!(tree.find_obstacles_within_range(&obstacles, Vec3::ZERO, 10.0).is_empty());

        let obstacles = box_obstacle();
        let tree = built(&obstacles);
        assert!(tree.find_obstacles_within_range(&obstacles, Vec3::new(50.0, -20.0, 0.0), 0.0).is_empty());
    }

    /// Every edge that faces `target` and lies within `radius`, by brute force.
    fn edges_in_range(obstacles: &ObstaclesContainer, target: Vec2, radius: f32) -> Vec<ObstacleIndices> {
        let mut found = Vec::new();
        for (polygon_index, polygon) in obstacles.polygons.iter().enumerate() {
            for point_index in 0..polygon.len() {
                let indices = ObstacleIndices {
                    polygon: polygon_index,
                    point: point_index,
                };
                let Some((start, end)) = indices.resolve_edge(obstacles) else {
                    continue;
                };
                if amount_left_of_line(start.point, end.point, target) < 0.0
                    && dist_sq_point_segment(start.point, end.point, target) < radius * radius
                {
                    found.push(indices);
                }
            }
        }
        found
    }

    #[test]
    fn pruned_query_matches_brute_force_over_long_walls() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(17);
        // Long thin walls and small blocks scattered over the map.
        let polygons: Vec<ObstaclePolygon> = (0..60)
            .map(|_| {
                let corner = Vec2::new(rng.gen_range(-3000.0..3000.0), rng.gen_range(-3000.0..3000.0));
                let size = if rng.gen_range(0.0..1.0) < 0.3 {
                    Vec2::new(rng.gen_range(400.0..1200.0), 20.0)
                } else {
                    Vec2::splat(rng.gen_range(20.0..120.0))
                };
                ObstaclePolygon::from_points(&[
                    corner,
                    corner + Vec2::new(size.x, 0.0),
                    corner + size,
                    corner + Vec2::new(0.0, size.y),
                ])
            })
            .collect();
        let obstacles = ObstaclesContainer::new(polygons);
        let tree = built(&obstacles);
        assert!(tree.longest_edge() >= 400.0);

        let mut found_any = false;
        for _ in 0..300 {
            let target = Vec2::new(rng.gen_range(-3200.0..3200.0), rng.gen_range(-3200.0..3200.0));
            let mut expected = edges_in_range(&obstacles, target, 300.0);
            let mut found = tree.find_obstacles_within_range(&obstacles, target.extend(0.0), 300.0);
            expected.sort();
            found.sort();
            assert_eq!(found, expected, "target {target}");
            found_any |= !found.is_empty();
        }
        assert!(found_any);
    }

    #[test]
    fn unknown_edge_bound_falls_back_to_full_search() {
        let obstacles = box_obstacle();
        let check = ObstacleEdgeProximity {
            obstacles: &obstacles,
            longest_edge: f32::INFINITY,
        };
        assert!(check.forces_full_search());
        assert_eq!(check.search_margin(), 0.0);

        let check = ObstacleEdgeProximity {
            obstacles: &obstacles,
            longest_edge: 100.0,
        };
        assert!(!check.forces_full_search());
        assert_eq!(check.search_margin(), 100.0);
    }

    #[test]
    fn clear_releases_nodes_and_edge_bound() {
        let obstacles = box_obstacle();
        let mut tree = built(&obstacles);
        assert_eq!(tree.longest_edge(), 100.0);
        tree.clear();
        assert_eq!(tree.tree().node_pool().num_allocated(), 0);
        assert_eq!(tree.longest_edge(), 0.0);
        assert!(tree.find_obstacles_within_range(&obstacles, Vec3::new(50.0, -20.0, 0.0), 30.0).is_empty());
    }

    #[test]
    fn rebuild_replaces_previous_polygons() {
        let obstacles = box_obstacle();
        let mut tree = built(&obstacles);
        assert_eq!(tree.tree().node_count(), 4);

        let empty = ObstaclesContainer::default();
        tree.rebuild(&empty);
        assert_eq!(tree.tree().node_count(), 0);
    }
}
