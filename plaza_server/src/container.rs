//! Change-tracking state container.
//!
//! Maps identity -> entity and remembers, per entity, which mutable fields
//! changed since the last `drain_changes`. Setters compare against the stored
//! value, so writing the same value is not a change while writing a default
//! over a non-default value is.
//!
//! The container has no interior locking; its owner (one session task)
//! serializes every call.

use std::collections::BTreeMap;

use plaza_shared::{
    entity::{ActivityState, Entity, PlayerId},
    error::SyncError,
    math::Vec3,
    patch::{ChangeRecord, EntityPatch, FieldMask},
};

struct Tracked {
    entity: Entity,
    dirty: FieldMask,
}

/// Mutable view handed to `StateContainer::mutate` callbacks.
pub struct EntityMut<'a> {
    entity: &'a mut Entity,
    dirty: FieldMask,
}

impl EntityMut<'_> {
    pub fn entity(&self) -> &Entity {
        &*self.entity
    }

    pub fn set_position(&mut self, position: Vec3) {
        if self.entity.position != position {
            self.entity.position = position;
            self.dirty |= FieldMask::POSITION;
        }
    }

    pub fn set_rotation_y(&mut self, rotation_y: f32) {
        if self.entity.rotation_y != rotation_y {
            self.entity.rotation_y = rotation_y;
            self.dirty |= FieldMask::ROTATION;
        }
    }

    pub fn set_activity(&mut self, activity: ActivityState) {
        if self.entity.activity != activity {
            self.entity.activity = activity;
            self.dirty |= FieldMask::ACTIVITY;
        }
    }
}

/// Server-side entity map with per-field change tracking.
#[derive(Default)]
pub struct StateContainer {
    entities: BTreeMap<PlayerId, Tracked>,
    added: Vec<PlayerId>,
    removed: Vec<PlayerId>,
}

impl StateContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &PlayerId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn get(&self, id: &PlayerId) -> Option<&Entity> {
        self.entities.get(id).map(|t| &t.entity)
    }

    /// Inserts a new entity. Returns false (and changes nothing) if the
    /// identity is already present.
    pub fn insert(&mut self, id: PlayerId, entity: Entity) -> bool {
        if self.entities.contains_key(&id) {
            return false;
        }
        self.added.push(id.clone());
        self.entities.insert(
            id,
            Tracked {
                entity,
                dirty: FieldMask::empty(),
            },
        );
        true
    }

    /// Removes an entity, discarding its pending field changes.
    pub fn remove(&mut self, id: &PlayerId) -> Option<Entity> {
        let tracked = self.entities.remove(id)?;
        self.added.retain(|a| a != id);
        self.removed.push(id.clone());
        Some(tracked.entity)
    }

    /// Runs `f` against the entity and records which fields it changed.
    pub fn mutate<F>(&mut self, id: &PlayerId, f: F) -> Result<FieldMask, SyncError>
    where
        F: FnOnce(&mut EntityMut<'_>),
    {
        let tracked = self
            .entities
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownIdentity(id.clone()))?;
        let mut view = EntityMut {
            entity: &mut tracked.entity,
            dirty: FieldMask::empty(),
        };
        f(&mut view);
        let changed = view.dirty;
        tracked.dirty |= changed;
        Ok(changed)
    }

    /// Full copy of every entity, ordered by identity.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities.values().map(|t| t.entity.clone()).collect()
    }

    /// Everything that changed since the previous drain. Never replays.
    pub fn drain_changes(&mut self) -> ChangeRecord {
        let changed = self
            .entities
            .values_mut()
            .filter(|t| !t.dirty.is_empty())
            .map(|t| {
                let patch = EntityPatch::from_entity(&t.entity, t.dirty);
                t.dirty = FieldMask::empty();
                patch
            })
            .collect();
        ChangeRecord {
            added: std::mem::take(&mut self.added),
            removed: std::mem::take(&mut self.removed),
            changed,
        }
    }
}
