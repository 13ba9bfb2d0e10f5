// Dense 16-bit entity ids layered over bevy_ecs entities.
//
// The spatial core stores only `EntityId`s in its trees. `EntityRegistry`
// maps those ids back to bevy `Entity` handles so systems and tests can
// resolve components by id.

use std::collections::HashMap;

use bevy_ecs::prelude::*;
use glam::Vec3;

use super::components::Transform;
use super::constants::MAX_ENTITIES;

/// Simulation-wide entity id. `EntityId::EMPTY` means "no entity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u16);

impl EntityId {
    pub const EMPTY: EntityId = EntityId(MAX_ENTITIES);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 < MAX_ENTITIES
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            f.write_str("#empty")
        }
    }
}

/// Tags every bevy entity created through the registry with its dense id.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimEntity {
    pub id: EntityId,
}

#[derive(Resource)]
pub struct EntityRegistry {
    entities: Vec<Option<Entity>>,
    lowest_taken_id: EntityId,
    highest_taken_id: EntityId,
    num_taken: usize,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self {
            entities: vec![None; MAX_ENTITIES as usize],
            lowest_taken_id: EntityId::EMPTY,
            highest_taken_id: EntityId::EMPTY,
            num_taken: 0,
        }
    }
}

impl EntityRegistry {
    /// Spawns `bundle` under the lowest free id.
    pub fn create_entity(&mut self, world: &mut World, bundle: impl Bundle) -> Option<EntityId> {
        let Some(free_index) = self.entities.iter().position(Option::is_none) else {
            log::error!(target: "ecs", "create_entity: all {MAX_ENTITIES} entity ids are taken");
            return None;
        };
        let id = EntityId(free_index as u16);
        self.spawn_with_id(world, id, bundle);
        Some(id)
    }

    /// Spawns `bundle` under a caller-chosen id. Fails (logged) when the id
    /// is out of range or already taken.
    pub fn create_entity_with_id(
        &mut self,
        world: &mut World,
        id: EntityId,
        bundle: impl Bundle,
    ) -> Option<EntityId> {
        if !id.is_valid() {
            log::error!(target: "ecs", "create_entity_with_id: id {} is out of range", id.0);
            return None;
        }
        if self.entities[id.index()].is_some() {
            log::error!(target: "ecs", "create_entity_with_id: id {id} is already taken");
            return None;
        }
        self.spawn_with_id(world, id, bundle);
        Some(id)
    }

    fn spawn_with_id(&mut self, world: &mut World, id: EntityId, bundle: impl Bundle) {
        let entity = world.spawn((SimEntity { id }, bundle)).id();
        self.entities[id.index()] = Some(entity);
        self.num_taken += 1;

        if !self.lowest_taken_id.is_valid() || id < self.lowest_taken_id {
            self.lowest_taken_id = id;
        }
        if !self.highest_taken_id.is_valid() || id > self.highest_taken_id {
            self.highest_taken_id = id;
        }
    }

    /// Despawns the entity and frees its id.
    pub fn destroy_entity(&mut self, world: &mut World, id: EntityId) -> bool {
        let Some(entity) = self.entity(id) else {
            log::error!(target: "ecs", "destroy_entity: {id} is not alive");
            return false;
        };

        world.despawn(entity);
        self.entities[id.index()] = None;
        self.num_taken -= 1;

        if self.num_taken == 0 {
            self.lowest_taken_id = EntityId::EMPTY;
            self.highest_taken_id = EntityId::EMPTY;
            return true;
        }
        if id == self.lowest_taken_id {
            self.lowest_taken_id = self.scan_taken(id.index()..=self.highest_taken_id.index(), false);
        }
        if id == self.highest_taken_id {
            self.highest_taken_id = self.scan_taken(self.lowest_taken_id.index()..=id.index(), true);
        }
        true
    }

    fn scan_taken(&self, range: std::ops::RangeInclusive<usize>, from_top: bool) -> EntityId {
        let mut ids = range.filter(|&index| self.entities[index].is_some());
        let found = if from_top { ids.next_back() } else { ids.next() };
        found.map_or(EntityId::EMPTY, |index| EntityId(index as u16))
    }

    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        if !id.is_valid() {
            return None;
        }
        self.entities[id.index()]
    }

    pub fn lowest_taken_id(&self) -> EntityId {
        self.lowest_taken_id
    }

    pub fn highest_taken_id(&self) -> EntityId {
        self.highest_taken_id
    }

    pub fn num_taken(&self) -> usize {
        self.num_taken
    }

    /// Live ids in ascending order, walking `[lowest, highest]`.
    pub fn live_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        let range = if self.lowest_taken_id.is_valid() {
            self.lowest_taken_id.index()..self.highest_taken_id.index() + 1
        } else {
            0..0
        };
        range
            .filter(|&index| self.entities[index].is_some())
            .map(|index| EntityId(index as u16))
    }
}

/// Resolves an entity's world location.
pub trait TransformLookup {
    fn location_of(&self, id: EntityId) -> Option<Vec3>;
}

impl TransformLookup for World {
    fn location_of(&self, id: EntityId) -> Option<Vec3> {
        let Some(registry) = self.get_resource::<EntityRegistry>() else {
            log::error!(target: "ecs", "location_of: no EntityRegistry resource in world");
            return None;
        };
        let entity = registry.entity(id)?;
        self.get::<Transform>(entity).map(|transform| transform.position)
    }
}

impl TransformLookup for HashMap<EntityId, Vec3> {
    fn location_of(&self, id: EntityId) -> Option<Vec3> {
        self.get(&id).copied()
    }
}
