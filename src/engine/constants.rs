// Simulation-wide constants and the startup avoidance configuration.
//
// Distances are world units (one unit = one centimetre on the ground plane),
// times are seconds. Nothing here is hot-reloadable.

use bevy_ecs::prelude::*;

/// Capacity of the dense entity id space. `EntityId(MAX_ENTITIES)` is the
/// "no entity" sentinel.
pub const MAX_ENTITIES: u16 = 15000;

/// Collision radius of every avoidance agent.
pub const AVOIDANCE_AGENT_RADIUS: f32 = 45.0;
/// Radius used to gather neighbouring agents and obstacle edges.
pub const AVOIDANCE_AGENT_SEARCH_RADIUS: f32 = 500.0;
/// Look-ahead window for agent/agent velocity obstacles.
pub const COLLISION_PREDICTION_TIME: f32 = 2.0;
/// Look-ahead window for agent/obstacle velocity obstacles.
pub const OBSTACLE_PREDICTION_TIME: f32 = 1.0;
/// Threshold under which a length or denominator counts as zero. A numeric
/// tolerance of the geometry code, not a tuning knob, so it has no field in
/// `AvoidanceConfig`.
pub const AVOIDANCE_EPSILON: f32 = 1.0e-4;
/// Distance at which a waypoint counts as reached.
pub const WAYPOINT_TOLERANCE: f32 = 10.0;

/// Avoidance tuning, fixed when the simulation is created.
///
/// `Default` reads the module constants; tests and the demo override single
/// fields with struct update syntax.
#[derive(Resource, Debug, Clone, Copy, PartialEq)]
pub struct AvoidanceConfig {
    pub agent_radius: f32,
    pub search_radius: f32,
    pub collision_prediction_time: f32,
    pub obstacle_prediction_time: f32,
    pub waypoint_tolerance: f32,
}

impl Default for AvoidanceConfig {
    fn default() -> Self {
        Self {
            agent_radius: AVOIDANCE_AGENT_RADIUS,
            search_radius: AVOIDANCE_AGENT_SEARCH_RADIUS,
            collision_prediction_time: COLLISION_PREDICTION_TIME,
            obstacle_prediction_time: OBSTACLE_PREDICTION_TIME,
            waypoint_tolerance: WAYPOINT_TOLERANCE,
        }
    }
}

impl AvoidanceConfig {
    /// Two agents touch when their centres are this far apart.
    #[inline]
    pub fn combined_radius(&self) -> f32 {
        2.0 * self.agent_radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_reads_the_constants() {
        let config = AvoidanceConfig::default();
        assert_eq!(
            config,
            AvoidanceConfig {
                agent_radius: AVOIDANCE_AGENT_RADIUS,
                search_radius: AVOIDANCE_AGENT_SEARCH_RADIUS,
                collision_prediction_time: COLLISION_PREDICTION_TIME,
                obstacle_prediction_time: OBSTACLE_PREDICTION_TIME,
                waypoint_tolerance: WAYPOINT_TOLERANCE,
            }
        );
        assert_eq!(config.combined_radius(), 90.0);
    }
}
