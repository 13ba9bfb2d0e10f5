//! Spatial indexing and ORCA local avoidance for RTS units on `bevy_ecs`.
//!
//! Per tick the entity k-d tree is rebuilt from every live transform, each
//! moving agent queries it (and the obstacle-edge tree) for neighbours, and
//! the ORCA solver proposes a collision-free velocity that the movement
//! system then commits.

pub mod engine;
pub mod logging;
