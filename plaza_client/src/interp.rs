//! Interpolation.
//!
//! The server sends discrete patches at tick boundaries; the client renders
//! at its own rate. Each remote entity keeps a displayed pose that moves a
//! fixed fraction toward the last received pose every frame. No
//! extrapolation past known data.

use std::collections::BTreeMap;

use plaza_shared::{
    entity::PlayerId,
    math::{angle_delta, lerp_angle, Vec3},
};

use crate::store::{StoreEvent, SyncedStore};

/// Below this distance the displayed pose snaps to the target.
const SNAP_EPSILON: f32 = 1e-4;

/// Displayed and target pose of one remote entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothed {
    pub position: Vec3,
    pub rotation_y: f32,
    pub target_position: Vec3,
    pub target_rotation_y: f32,
}

impl Smoothed {
    fn at(position: Vec3, rotation_y: f32) -> Self {
        Self {
            position,
            rotation_y,
            target_position: position,
            target_rotation_y: rotation_y,
        }
    }

    fn advance(&mut self, fraction: f32) {
        self.position = if self.position.distance(self.target_position) <= SNAP_EPSILON {
            self.target_position
        } else {
            self.position.lerp(self.target_position, fraction)
        };
        self.rotation_y = if angle_delta(self.rotation_y, self.target_rotation_y).abs() <= SNAP_EPSILON {
            self.target_rotation_y
        } else {
            lerp_angle(self.rotation_y, self.target_rotation_y, fraction)
        };
    }
}

/// Smooths every entity except the local participant.
#[derive(Debug, Default)]
pub struct RemoteReconciler {
    fraction: f32,
    entities: BTreeMap<PlayerId, Smoothed>,
}

impl RemoteReconciler {
    pub fn new(fraction: f32) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            entities: BTreeMap::new(),
        }
    }

    /// Aligns the tracked set with the store and refreshes targets.
    /// New entities start at their target (no glide-in from the origin).
    pub fn sync(&mut self, store: &SyncedStore, local_id: Option<&PlayerId>) {
        self.entities
            .retain(|id, _| store.contains(id) && Some(id) != local_id);
        for entity in store.iter() {
            if Some(&entity.id) == local_id {
                continue;
            }
            self.entities
                .entry(entity.id.clone())
                .and_modify(|s| {
                    s.target_position = entity.position;
                    s.target_rotation_y = entity.rotation_y;
                })
                .or_insert_with(|| Smoothed::at(entity.position, entity.rotation_y));
        }
    }

    /// Incremental form of `sync`, driven by one frame's drained store events.
    pub fn apply_events(
        &mut self,
        store: &SyncedStore,
        events: &[StoreEvent],
        local_id: Option<&PlayerId>,
    ) {
        for event in events {
            match event {
                StoreEvent::Removed(id) => {
                    self.entities.remove(id);
                }
                StoreEvent::Added(id) | StoreEvent::Changed(id, _) => {
                    if Some(id) == local_id {
                        continue;
                    }
                    let Some(entity) = store.get(id) else {
                        self.entities.remove(id);
                        continue;
                    };
                    self.entities
                        .entry(id.clone())
                        .and_modify(|s| {
                            s.target_position = entity.position;
                            s.target_rotation_y = entity.rotation_y;
                        })
                        .or_insert_with(|| Smoothed::at(entity.position, entity.rotation_y));
                }
            }
        }
    }

    /// One render frame of smoothing.
    pub fn advance(&mut self) {
        for s in self.entities.values_mut() {
            s.advance(self.fraction);
        }
    }

    pub fn get(&self, id: &PlayerId) -> Option<&Smoothed> {
        self.entities.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlayerId, &Smoothed)> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
