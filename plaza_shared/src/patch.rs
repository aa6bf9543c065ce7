//! Change records and patches.
//!
//! A `ChangeRecord` is what the server container drains once per tick. Each
//! `EntityPatch` carries current values (not deltas) for the fields that
//! changed, so applying a patch twice or merging two patches newest-wins is
//! always safe.

use crate::{
    entity::{ActivityState, Entity, PlayerId},
    math::Vec3,
};

bitflags::bitflags! {
    /// Mutable entity fields tracked for change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldMask: u8 {
        const ACTIVITY = 1 << 0;
        const POSITION = 1 << 1;
        const ROTATION = 1 << 2;
    }
}

/// Changed fields of one entity. `None` means "unchanged".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityPatch {
    pub id: PlayerId,
    pub activity: Option<ActivityState>,
    pub position: Option<Vec3>,
    pub rotation_y: Option<f32>,
}

impl EntityPatch {
    pub fn new(id: PlayerId) -> Self {
        EntityPatch {
            id,
            ..Default::default()
        }
    }

    /// Captures the fields in `mask` from `entity`.
    pub fn from_entity(entity: &Entity, mask: FieldMask) -> Self {
        EntityPatch {
            id: entity.id.clone(),
            activity: mask
                .contains(FieldMask::ACTIVITY)
                .then_some(entity.activity),
            position: mask
                .contains(FieldMask::POSITION)
                .then_some(entity.position),
            rotation_y: mask
                .contains(FieldMask::ROTATION)
                .then_some(entity.rotation_y),
        }
    }

    pub fn mask(&self) -> FieldMask {
        let mut mask = FieldMask::empty();
        mask.set(FieldMask::ACTIVITY, self.activity.is_some());
        mask.set(FieldMask::POSITION, self.position.is_some());
        mask.set(FieldMask::ROTATION, self.rotation_y.is_some());
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.mask().is_empty()
    }

    /// Overlays `newer` on top of `self`; fields present in `newer` win.
    pub fn merge(&mut self, newer: &EntityPatch) {
        if newer.activity.is_some() {
            self.activity = newer.activity;
        }
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.rotation_y.is_some() {
            self.rotation_y = newer.rotation_y;
        }
    }

    /// Writes the present fields into `entity` and returns which ones differed.
    pub fn apply_to(&self, entity: &mut Entity) -> FieldMask {
        let mut changed = FieldMask::empty();
        if let Some(activity) = self.activity {
            changed.set(FieldMask::ACTIVITY, entity.activity != activity);
            entity.activity = activity;
        }
        if let Some(position) = self.position {
            changed.set(FieldMask::POSITION, entity.position != position);
            entity.position = position;
        }
        if let Some(rotation_y) = self.rotation_y {
            changed.set(FieldMask::ROTATION, entity.rotation_y != rotation_y);
            entity.rotation_y = rotation_y;
        }
        changed
    }
}

/// Everything that changed in a container since the previous drain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeRecord {
    pub added: Vec<PlayerId>,
    pub removed: Vec<PlayerId>,
    pub changed: Vec<EntityPatch>,
}

impl ChangeRecord {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Wire-level patch for one tick: field changes plus removals.
///
/// Additions travel separately as full `add` messages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    pub tick: u32,
    pub changed: Vec<EntityPatch>,
    pub removed: Vec<PlayerId>,
}

impl Patch {
    pub fn from_record(tick: u32, record: &ChangeRecord) -> Self {
        Patch {
            tick,
            changed: record.changed.clone(),
            removed: record.removed.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Folds a newer patch into this one, newest value per field.
    ///
    /// An entity removed in `newer` loses its pending changes.
    pub fn coalesce(&mut self, newer: Patch) {
        self.tick = newer.tick;
        for removed in &newer.removed {
            self.changed.retain(|p| &p.id != removed);
            if !self.removed.contains(removed) {
                self.removed.push(removed.clone());
            }
        }
        for patch in newer.changed {
            match self.changed.iter_mut().find(|p| p.id == patch.id) {
                Some(existing) => existing.merge(&patch),
                None => self.changed.push(patch),
            }
        }
    }
}
