// Core ECS components read and written by the spatial/avoidance systems.
// Positions are Z-up; avoidance works on the XY ground plane.

use bevy_ecs::prelude::*;
use glam::{Vec2, Vec3};

/// Position of an entity in 3D space
#[derive(Component, Debug, Clone, Copy)]
pub struct Transform {
    pub position: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self { position }
    }

    #[inline]
    pub fn ground_position(&self) -> Vec2 {
        self.position.truncate()
    }
}

/// Ground-plane velocity (units per second).
///
/// `current` is what the movement system integrates. `proposed_avoidance`
/// is rewritten by ORCA every tick and only becomes `current` once the
/// movement system commits it.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Velocity {
    pub current: Vec2,
    pub proposed_avoidance: Vec2,
}

/// Movement limits of an avoidance agent. Read-only to the solver.
#[derive(Component, Debug, Clone, Copy)]
pub struct UnitAgent {
    pub desired_speed: f32,
    pub max_speed: f32,
}

/// Ordered waypoints an entity walks through.
///
/// The entity is executing a move task while `next_waypoint` still points
/// into `waypoints`.
#[derive(Component, Debug, Clone, Default)]
pub struct MoveTask {
    pub waypoints: Vec<Vec3>,
    pub next_waypoint: usize,
}

impl MoveTask {
    pub fn new(waypoints: Vec<Vec3>) -> Self {
        Self {
            waypoints,
            next_waypoint: 0,
        }
    }

    #[inline]
    pub fn is_executing(&self) -> bool {
        self.next_waypoint < self.waypoints.len()
    }

    pub fn current_waypoint(&self) -> Option<Vec3> {
        self.waypoints.get(self.next_waypoint).copied()
    }

    /// Desired ground velocity toward the current waypoint, zero when idle
    /// or already standing on it.
    pub fn desired_velocity(&self, position: Vec3, desired_speed: f32) -> Vec2 {
        let Some(waypoint) = self.current_waypoint() else {
            return Vec2::ZERO;
        };
        (waypoint - position).truncate().normalize_or_zero() * desired_speed
    }
}
