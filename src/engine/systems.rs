// ECS systems for one simulation tick.
// Registered in this order: spatial partitioning -> avoidance -> movement ->
// navigation. Avoidance reads trees that partitioning rebuilt the same tick.

use bevy_ecs::prelude::*;
use glam::Vec2;

use super::components::*;
use super::constants::AvoidanceConfig;
use super::entity::{EntityRegistry, SimEntity};
use super::entity_kd_tree::EntityKdTree;
use super::math::safe_divide;
use super::obstacle::ObstaclesContainer;
use super::obstacle_kd_tree::ObstaclePointKdTree;
use super::orca::{AgentSnapshot, AgentSnapshots, AvoidanceContext, AvoidanceScratch, compute_avoidance_velocity};

/// Length of the tick being simulated.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SimulationClock {
    pub delta_seconds: f32,
    pub elapsed_seconds: f32,
    pub tick: u64,
}

/// Rebuild the entity tree from every live entity with a transform, and the
/// obstacle tree whenever the obstacle snapshot was replaced.
pub fn spatial_partitioning_system(
    registry: Res<EntityRegistry>,
    transforms: Query<&Transform>,
    obstacles: Res<ObstaclesContainer>,
    mut entity_tree: ResMut<EntityKdTree>,
    mut obstacle_tree: ResMut<ObstaclePointKdTree>,
) {
    entity_tree.rebuild_for_all_entities(registry.live_ids().filter_map(|id| {
        let entity = registry.entity(id)?;
        let transform = transforms.get(entity).ok()?;
        Some((id, transform.position))
    }));

    if obstacles.is_changed() {
        obstacle_tree.rebuild(&obstacles);
    }
}

/// Compute `Velocity::proposed_avoidance` for every agent executing a move
/// task. Idle agents are skipped and keep their previous proposal.
#[allow(clippy::too_many_arguments)]
pub fn avoidance_system(
    clock: Res<SimulationClock>,
    config: Res<AvoidanceConfig>,
    registry: Res<EntityRegistry>,
    entity_tree: Res<EntityKdTree>,
    obstacle_tree: Res<ObstaclePointKdTree>,
    obstacles: Res<ObstaclesContainer>,
    mut query: Query<(&SimEntity, &Transform, Option<&mut Velocity>, Option<&UnitAgent>, Option<&MoveTask>)>,
    mut snapshots: Local<AgentSnapshots>,
    mut scratch: Local<AvoidanceScratch>,
) {
    let delta_seconds = clock.delta_seconds;
    let inverse_delta_seconds = safe_divide(1.0, delta_seconds);

    snapshots.clear();
    for (sim_entity, transform, velocity, agent, task) in query.iter() {
        let mut snapshot = AgentSnapshot::stationary(transform.position);

        if let (Some(velocity), Some(agent), Some(task)) = (velocity, agent, task) {
            snapshot.velocity = velocity.current;
            if task.is_executing() {
                let desired = task.desired_velocity(transform.position, agent.desired_speed);
                // Do not plan to overshoot the waypoint within one tick.
                let remaining = task
                    .current_waypoint()
                    .map_or(0.0, |waypoint| waypoint.truncate().distance(transform.ground_position()));
                snapshot.desired_velocity = if inverse_delta_seconds > 0.0 {
                    desired.clamp_length_max(remaining * inverse_delta_seconds)
                } else {
                    desired
                };
                snapshot.max_speed = agent.max_speed;
                snapshot.is_moving = true;
            }
        }

        snapshots.insert(sim_entity.id, snapshot);
    }

    let context = AvoidanceContext {
        snapshots: &snapshots,
        entity_tree: &entity_tree,
        obstacle_tree: &obstacle_tree,
        obstacles: &obstacles,
        config: &config,
        delta_time: delta_seconds,
    };

    let mut num_solved = 0usize;
    for (id, snapshot) in context.snapshots.moving() {
        let proposed = compute_avoidance_velocity(id, snapshot, &context, &mut scratch);

        let Some(entity) = registry.entity(id) else {
            log::error!(target: "avoidance", "agent {id} is not registered");
            continue;
        };
        match query.get_mut(entity) {
            Ok((_, _, Some(mut velocity), _, _)) => {
                velocity.proposed_avoidance = proposed;
                num_solved += 1;
            }
            _ => log::error!(target: "avoidance", "agent {id} lost its Velocity during avoidance"),
        }
    }

    log::debug!(target: "avoidance", "tick {}: solved {num_solved} agents", clock.tick);
}

/// Commit the avoidance proposal and integrate position.
/// Agents that are not executing a move task stop.
pub fn movement_system(
    clock: Res<SimulationClock>,
    mut query: Query<(&mut Transform, &mut Velocity, Option<&MoveTask>)>,
) {
    let delta_seconds = clock.delta_seconds;
    for (mut transform, mut velocity, task) in query.iter_mut() {
        velocity.current = if task.is_some_and(MoveTask::is_executing) {
            velocity.proposed_avoidance
        } else {
            Vec2::ZERO
        };
        transform.position += velocity.current.extend(0.0) * delta_seconds;
    }
}

/// Advance move tasks whose current waypoint has been reached.
pub fn navigation_system(
    config: Res<AvoidanceConfig>,
    mut query: Query<(&SimEntity, &Transform, &mut MoveTask)>,
) {
    let tolerance_squared = config.waypoint_tolerance * config.waypoint_tolerance;
    for (sim_entity, transform, mut task) in query.iter_mut() {
        let Some(waypoint) = task.current_waypoint() else {
            continue;
        };
        if waypoint.truncate().distance_squared(transform.ground_position()) > tolerance_squared {
            continue;
        }

        task.next_waypoint += 1;
        if !task.is_executing() {
            log::debug!(target: "sim", "entity {} reached its final waypoint", sim_entity.id);
        }
    }
}
