// Engine module - spatial partitioning and local avoidance on bevy_ecs

pub mod components;
pub mod constants;
pub mod entity;
pub mod entity_kd_tree;
pub mod kd_tree;
pub mod math;
pub mod object_pool;
pub mod obstacle;
pub mod obstacle_kd_tree;
pub mod orca;
pub mod simulation;
pub mod systems;

// Re-export commonly used items
pub use components::*;
pub use constants::AvoidanceConfig;
pub use entity::{EntityId, EntityRegistry, SimEntity, TransformLookup};
pub use entity_kd_tree::EntityKdTree;
pub use obstacle::{ObstaclePoint, ObstaclePolygon, ObstaclesContainer};
pub use obstacle_kd_tree::{ObstacleIndices, ObstaclePointKdTree};
pub use simulation::Simulation;
