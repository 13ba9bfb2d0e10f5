// Headless simulation driver: owns the ECS world and the per-tick schedule.

use std::time::Instant;

use bevy_ecs::prelude::*;
use bevy_ecs::schedule::ExecutorKind;
use glam::{Vec2, Vec3};

use super::components::{MoveTask, Transform, UnitAgent, Velocity};
use super::constants::AvoidanceConfig;
use super::entity::{EntityId, EntityRegistry, TransformLookup};
use super::entity_kd_tree::EntityKdTree;
use super::obstacle::{ObstaclePolygon, ObstaclesContainer};
use super::obstacle_kd_tree::ObstaclePointKdTree;
use super::systems::{
    SimulationClock, avoidance_system, movement_system, navigation_system, spatial_partitioning_system,
};

pub struct Simulation {
    world: World,
    schedule: Schedule,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(AvoidanceConfig::default())
    }
}

impl Simulation {
    pub fn new(config: AvoidanceConfig) -> Self {
        let mut world = World::new();
        world.insert_resource(config);
        world.insert_resource(SimulationClock::default());
        world.insert_resource(EntityRegistry::default());
        world.insert_resource(EntityKdTree::new());
        world.insert_resource(ObstaclePointKdTree::new());
        world.insert_resource(ObstaclesContainer::default());

        // Core runs single-threaded, in tick order.
        let mut schedule = Schedule::default();
        schedule.set_executor_kind(ExecutorKind::SingleThreaded);
        schedule.add_systems(
            (
                spatial_partitioning_system,
                avoidance_system,
                movement_system,
                navigation_system,
            )
                .chain(),
        );

        Self { world, schedule }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn config(&self) -> AvoidanceConfig {
        *self.world.resource::<AvoidanceConfig>()
    }

    pub fn entity_tree(&self) -> &EntityKdTree {
        self.world.resource::<EntityKdTree>()
    }

    pub fn obstacle_tree(&self) -> &ObstaclePointKdTree {
        self.world.resource::<ObstaclePointKdTree>()
    }

    pub fn clock(&self) -> SimulationClock {
        *self.world.resource::<SimulationClock>()
    }

    // ========================================================================
    // SPAWNING
    // ========================================================================

    /// Spawns an idle avoidance agent.
    pub fn spawn_agent(&mut self, location: Vec3, agent: UnitAgent) -> Option<EntityId> {
        self.spawn((
            Transform::from_position(location),
            Velocity::default(),
            agent,
            MoveTask::default(),
        ))
    }

    /// Spawns an entity that only occupies space. Agents avoid it as an idle
    /// neighbour.
    pub fn spawn_static(&mut self, location: Vec3) -> Option<EntityId> {
        self.spawn(Transform::from_position(location))
    }

    fn spawn(&mut self, bundle: impl Bundle) -> Option<EntityId> {
        self.world
            .resource_scope(|world, mut registry: Mut<EntityRegistry>| registry.create_entity(world, bundle))
    }

    pub fn despawn(&mut self, id: EntityId) -> bool {
        self.world
            .resource_scope(|world, mut registry: Mut<EntityRegistry>| registry.destroy_entity(world, id))
    }

    /// Replaces the obstacle snapshot; the obstacle tree is rebuilt on the
    /// next tick.
    pub fn set_obstacles(&mut self, polygons: Vec<ObstaclePolygon>) {
        self.world.insert_resource(ObstaclesContainer::new(polygons));
    }

    /// Starts (or replaces) a move task. Fails when the entity is unknown
    /// or has no `MoveTask`.
    pub fn issue_move(&mut self, id: EntityId, waypoints: Vec<Vec3>) -> bool {
        let Some(entity) = self.world.resource::<EntityRegistry>().entity(id) else {
            log::error!(target: "sim", "issue_move: entity {id} is not alive");
            return false;
        };
        let Some(mut task) = self.world.get_mut::<MoveTask>(entity) else {
            log::error!(target: "sim", "issue_move: entity {id} cannot move");
            return false;
        };
        *task = MoveTask::new(waypoints);
        true
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn location(&self, id: EntityId) -> Option<Vec3> {
        self.world.location_of(id)
    }

    pub fn velocity(&self, id: EntityId) -> Option<Velocity> {
        let entity = self.world.resource::<EntityRegistry>().entity(id)?;
        self.world.get::<Velocity>(entity).copied()
    }

    pub fn proposed_velocity(&self, id: EntityId) -> Option<Vec2> {
        self.velocity(id).map(|velocity| velocity.proposed_avoidance)
    }

    pub fn is_moving(&self, id: EntityId) -> bool {
        self.world
            .resource::<EntityRegistry>()
            .entity(id)
            .and_then(|entity| self.world.get::<MoveTask>(entity))
            .is_some_and(MoveTask::is_executing)
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// Releases every node the spatial trees hold, pooled storage included.
    /// The next tick rebuilds the entity tree from scratch; the obstacle
    /// tree is rebuilt on the next `set_obstacles`.
    pub fn shutdown(&mut self) {
        self.world.resource_mut::<EntityKdTree>().clear();
        self.world.resource_mut::<ObstaclePointKdTree>().clear();
        log::info!(target: "sim", "spatial trees released after {} ticks", self.clock().tick);
    }

    pub fn tick(&mut self, delta_seconds: f32) {
        {
            let mut clock = self.world.resource_mut::<SimulationClock>();
            clock.delta_seconds = delta_seconds;
            clock.elapsed_seconds += delta_seconds;
            clock.tick += 1;
        }

        let started = Instant::now();
        self.schedule.run(&mut self.world);

        log::trace!(
            target: "sim",
            "tick {} ran in {:?}",
            self.world.resource::<SimulationClock>().tick,
            started.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walker() -> UnitAgent {
        UnitAgent {
            desired_speed: 100.0,
            max_speed: 120.0,
        }
    }

    #[test]
    fn lone_agent_walks_to_its_waypoint() {
        let mut simulation = Simulation::default();
        let id = simulation.spawn_agent(Vec3::ZERO, walker()).expect("id");
        assert!(simulation.issue_move(id, vec![Vec3::new(300.0, 0.0, 0.0)]));

        simulation.tick(0.5);
        assert_eq!(simulation.proposed_velocity(id), Some(Vec2::new(100.0, 0.0)));
        assert_eq!(simulation.location(id), Some(Vec3::new(50.0, 0.0, 0.0)));

        for _ in 0..10 {
            simulation.tick(0.5);
        }
        assert!(!simulation.is_moving(id));
        let location = simulation.location(id).expect("location");
        assert!((location - Vec3::new(300.0, 0.0, 0.0)).length() <= simulation.config().waypoint_tolerance);
        assert_eq!(simulation.velocity(id).map(|velocity| velocity.current), Some(Vec2::ZERO));
    }

    #[test]
    fn idle_agent_does_not_move() {
        let mut simulation = Simulation::default();
        let id = simulation.spawn_agent(Vec3::new(5.0, 5.0, 0.0), walker()).expect("id");
        simulation.tick(1.0);
        assert_eq!(simulation.location(id), Some(Vec3::new(5.0, 5.0, 0.0)));
    }

    #[test]
    fn static_entities_cannot_take_move_orders() {
        let mut simulation = Simulation::default();
        let id = simulation.spawn_static(Vec3::ZERO).expect("id");
        assert!(!simulation.issue_move(id, vec![Vec3::ONE]));
        assert!(!simulation.issue_move(EntityId(999), vec![Vec3::ONE]));
    }

    #[test]
    fn obstacle_tree_is_rebuilt_after_set_obstacles() {
        let mut simulation = Simulation::default();
        simulation.tick(0.1);
        assert_eq!(simulation.obstacle_tree().tree().node_count(), 0);

        simulation.set_obstacles(vec![ObstaclePolygon::from_points(&[
            Vec2::new(0.0, 0.0),
            Vec2::new(10.0, 0.0),
            Vec2::new(10.0, 10.0),
        ])]);
        simulation.tick(0.1);
        assert_eq!(simulation.obstacle_tree().tree().node_count(), 3);
    }

    #[test]
    fn shutdown_returns_all_tree_storage() {
        let mut simulation = Simulation::default();
        for i in 0..5 {
            simulation.spawn_static(Vec3::new(i as f32 * 100.0, 0.0, 0.0)).expect("id");
        }
        simulation.set_obstacles(vec![ObstaclePolygon::from_points(&[
            Vec2::new(0.0, 200.0),
            Vec2::new(10.0, 200.0),
            Vec2::new(10.0, 210.0),
        ])]);
        simulation.tick(0.1);
        simulation.tick(0.1);
        assert!(simulation.entity_tree().tree().node_pool().num_allocated() > 0);
        assert!(simulation.obstacle_tree().tree().node_pool().num_allocated() > 0);

        simulation.shutdown();
        assert_eq!(simulation.entity_tree().tree().node_pool().num_allocated(), 0);
        assert_eq!(simulation.obstacle_tree().tree().node_pool().num_allocated(), 0);
        assert!(simulation.entity_tree().tree().is_empty());

        // Still usable afterwards.
        simulation.tick(0.1);
        assert_eq!(simulation.entity_tree().tree().node_count(), 5);
    }

    #[test]
    fn entity_tree_tracks_live_entities() {
        let mut simulation = Simulation::default();
        let a = simulation.spawn_static(Vec3::ZERO).expect("id");
        let b = simulation.spawn_static(Vec3::X).expect("id");
        simulation.tick(0.1);
        assert!(simulation.entity_tree().does_entity_exist(a));
        assert!(simulation.entity_tree().does_entity_exist(b));

        assert!(simulation.despawn(b));
        simulation.tick(0.1);
        assert!(!simulation.entity_tree().does_entity_exist(b));
    }
}
