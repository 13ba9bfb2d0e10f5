// Static obstacle geometry extracted from nav-mesh walls.
//
// A polygon is a closed loop of points in counter-clockwise order: the
// obstacle's interior lies to the left of every edge `point[i] -> point[i+1]`
// and walkable space to the right.

use bevy_ecs::prelude::*;
use glam::Vec2;

use super::math::{amount_left_of_line, safe_normalize};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObstaclePoint {
    pub point: Vec2,
    /// Unit vector from this point toward the next one in the polygon.
    pub direction: Vec2,
    pub is_convex: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObstaclePolygon {
    points: Vec<ObstaclePoint>,
}

impl ObstaclePolygon {
    /// Builds the loop, deriving each point's edge direction and convexity.
    ///
    /// Two-point polygons describe a double-sided wall segment and are
    /// always convex at both ends.
    pub fn from_points(points: &[Vec2]) -> Self {
        let count = points.len();
        let points = (0..count)
            .map(|i| {
                let previous = points[(i + count - 1) % count];
                let current = points[i];
                let next = points[(i + 1) % count];
                ObstaclePoint {
                    point: current,
                    direction: safe_normalize(next - current),
                    is_convex: count <= 2 || amount_left_of_line(previous, current, next) >= 0.0,
                }
            })
            .collect();
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[ObstaclePoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&ObstaclePoint> {
        self.points.get(index)
    }

    pub fn head(&self) -> Option<&ObstaclePoint> {
        self.points.first()
    }

    pub fn tail(&self) -> Option<&ObstaclePoint> {
        self.points.last()
    }

    pub fn next_index(&self, index: usize) -> usize {
        if self.points.is_empty() {
            return 0;
        }
        (index + 1) % self.points.len()
    }

    pub fn previous_index(&self, index: usize) -> usize {
        if self.points.is_empty() {
            return 0;
        }
        (index + self.points.len() - 1) % self.points.len()
    }

    /// Length of the longest edge, closing edge included.
    pub fn longest_edge(&self) -> f32 {
        self.points
            .iter()
            .enumerate()
            .filter_map(|(index, point)| Some(point.point.distance(self.next(index)?.point)))
            .fold(0.0, f32::max)
    }

    /// Successor of `index`, wrapping from the tail back to the head.
    pub fn next(&self, index: usize) -> Option<&ObstaclePoint> {
        self.points.get(self.next_index(index))
    }

    /// Predecessor of `index`, wrapping from the head back to the tail.
    pub fn previous(&self, index: usize) -> Option<&ObstaclePoint> {
        self.points.get(self.previous_index(index))
    }
}

/// Snapshot of every obstacle polygon in the level.
///
/// Replaced wholesale when the nav mesh changes; the spatial partitioning
/// system uses bevy change detection to rebuild the obstacle tree only then.
#[derive(Resource, Debug, Clone, Default)]
pub struct ObstaclesContainer {
    pub polygons: Vec<ObstaclePolygon>,
}

impl ObstaclesContainer {
    pub fn new(polygons: Vec<ObstaclePolygon>) -> Self {
        Self { polygons }
    }

    pub fn polygon(&self, index: usize) -> Option<&ObstaclePolygon> {
        self.polygons.get(index)
    }

    pub fn num_points(&self) -> usize {
        self.polygons.iter().map(ObstaclePolygon::len).sum()
    }
}
