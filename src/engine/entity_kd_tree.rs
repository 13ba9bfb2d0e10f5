// Entity k-d tree: `KdTree<EntityId>` rebuilt once per tick from every live
// entity with a `Transform`.

use bevy_ecs::prelude::*;
use glam::Vec3;

use super::constants::MAX_ENTITIES;
use super::entity::{EntityId, EntityRegistry, TransformLookup};
use super::kd_tree::{KdTree, KdTreePayload, PointDistance};

impl KdTreePayload for EntityId {
    const PLACEHOLDER: Self = EntityId::EMPTY;
}

#[derive(Resource)]
pub struct EntityKdTree {
    tree: KdTree<EntityId>,
}

impl Default for EntityKdTree {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityKdTree {
    /// Pool sized for every entity id plus the placeholder root.
    pub fn new() -> Self {
        Self {
            tree: KdTree::with_capacity(MAX_ENTITIES as usize + 1),
        }
    }

    pub fn tree(&self) -> &KdTree<EntityId> {
        &self.tree
    }

    pub fn insert_entity(&mut self, id: EntityId, location: Vec3) {
        if !id.is_valid() {
            log::error!(target: "spatial", "insert_entity: invalid entity id {}", id.0);
            return;
        }
        self.tree.insert_node(id, location);
    }

    /// Resets the tree around the previous average location, then inserts
    /// every `(id, location)` pair.
    pub fn rebuild_for_all_entities(&mut self, entities: impl IntoIterator<Item = (EntityId, Vec3)>) {
        self.tree.reset_with_average_location();
        for (id, location) in entities {
            self.insert_entity(id, location);
        }
    }

    /// Rebuild from the registry's live id range, skipping entities without
    /// a `Transform`.
    pub fn rebuild_from_world(&mut self, world: &World) {
        let Some(registry) = world.get_resource::<EntityRegistry>() else {
            log::error!(target: "spatial", "rebuild_from_world: no EntityRegistry resource in world");
            return;
        };
        self.rebuild_for_all_entities(
            registry
                .live_ids()
                .filter_map(|id| world.location_of(id).map(|location| (id, location))),
        );
    }

    pub fn flush_all_nodes(&mut self) -> Vec3 {
        self.tree.flush_all_nodes()
    }

    /// Teardown: drops every node, pooled ones included.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    pub fn does_entity_exist(&self, id: EntityId) -> bool {
        if !id.is_valid() {
            log::error!(target: "spatial", "does_entity_exist: invalid entity id {}", id.0);
            return false;
        }
        self.tree.does_payload_exist(id)
    }

    /// Pass `EntityId::EMPTY` as `ignore` to consider every entity.
    pub fn find_entity_closest_to_location(&self, location: Vec3, ignore: EntityId) -> Option<EntityId> {
        self.tree
            .find_node_closest_to_location(location, ignore)
            .map(|node| node.payload)
    }

    /// Nearest entity other than `source` itself.
    pub fn find_entity_closest_to_entity(
        &self,
        lookup: &impl TransformLookup,
        source: EntityId,
    ) -> Option<EntityId> {
        let location = self.source_location(lookup, source, "find_entity_closest_to_entity")?;
        self.find_entity_closest_to_location(location, source)
    }

    pub fn find_entities_within_range(&self, location: Vec3, radius: f32, ignore: EntityId) -> Vec<EntityId> {
        let mut ids = Vec::new();
        self.find_entities_within_range_into(&mut ids, location, radius, ignore);
        ids
    }

    /// Appends matches to `out` without clearing it. Returns whether any
    /// entity was found.
    pub fn find_entities_within_range_into(
        &self,
        out: &mut Vec<EntityId>,
        location: Vec3,
        radius: f32,
        ignore: EntityId,
    ) -> bool {
        if radius <= 0.0 {
            log::error!(target: "spatial", "find_entities_within_range: radius {radius} is not positive");
            return false;
        }
        self.tree
            .find_nodes_within_range(out, location, radius * radius, ignore, &PointDistance)
    }

    pub fn find_entities_within_range_of_entity(
        &self,
        lookup: &impl TransformLookup,
        source: EntityId,
        radius: f32,
    ) -> Vec<EntityId> {
        let mut ids = Vec::new();
        if let Some(location) = self.source_location(lookup, source, "find_entities_within_range_of_entity") {
            self.find_entities_within_range_into(&mut ids, location, radius, source);
        }
        ids
    }

    fn source_location(&self, lookup: &impl TransformLookup, source: EntityId, caller: &str) -> Option<Vec3> {
        if !source.is_valid() {
            log::error!(target: "spatial", "{caller}: invalid entity id {}", source.0);
            return None;
        }
        let location = lookup.location_of(source);
        if location.is_none() {
            log::error!(target: "spatial", "{caller}: entity {source} has no Transform");
        }
        location
    }
}
