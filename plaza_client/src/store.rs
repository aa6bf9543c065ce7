//! Client-side mirror of the session's entities.
//!
//! Applies snapshots, patches, adds and removes from the server and queues
//! `StoreEvent`s for consumers to drain once per frame.
//!
//! The local participant's activity is two-tier: the optimistic value set
//! when the command goes out wins until a server value arrives. Its pose is
//! owned by the local pipeline; server echoes of it only update the mirror.

use std::collections::{BTreeMap, HashSet};

use plaza_shared::{
    entity::{ActivityState, Entity, PlayerId},
    error::SyncError,
    patch::{FieldMask, Patch},
};
use tracing::{debug, warn};

/// Change notification for renderers and the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(PlayerId),
    Removed(PlayerId),
    Changed(PlayerId, FieldMask),
}

#[derive(Debug, Default)]
pub struct SyncedStore {
    entities: BTreeMap<PlayerId, Entity>,
    /// Identities removed since the last snapshot; late updates for them are stale.
    departed: HashSet<PlayerId>,
    events: Vec<StoreEvent>,
    local_id: Option<PlayerId>,
    /// Optimistic activity for the local participant.
    local_activity: Option<ActivityState>,
    last_tick: u32,
}

fn diff(old: &Entity, new: &Entity) -> FieldMask {
    let mut mask = FieldMask::empty();
    if old.activity != new.activity {
        mask |= FieldMask::ACTIVITY;
    }
    if old.position != new.position {
        mask |= FieldMask::POSITION;
    }
    if old.rotation_y != new.rotation_y {
        mask |= FieldMask::ROTATION;
    }
    mask
}

impl SyncedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_id(&mut self, id: PlayerId) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&PlayerId> {
        self.local_id.as_ref()
    }

    fn is_local(&self, id: &PlayerId) -> bool {
        self.local_id.as_ref() == Some(id)
    }

    pub fn get(&self, id: &PlayerId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &PlayerId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Tick of the last applied patch.
    pub fn last_tick(&self) -> u32 {
        self.last_tick
    }

    /// Replaces everything with an authoritative full state.
    pub fn apply_snapshot(&mut self, entities: Vec<Entity>) {
        let incoming: BTreeMap<PlayerId, Entity> =
            entities.into_iter().map(|e| (e.id.clone(), e)).collect();

        let gone: Vec<PlayerId> = self
            .entities
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            self.entities.remove(&id);
            self.events.push(StoreEvent::Removed(id));
        }

        for (id, entity) in incoming {
            match self.entities.get(&id) {
                Some(old) => {
                    let mask = diff(old, &entity);
                    if !mask.is_empty() {
                        self.events.push(StoreEvent::Changed(id.clone(), mask));
                    }
                }
                None => self.events.push(StoreEvent::Added(id.clone())),
            }
            if self.is_local(&id) {
                self.local_activity = None;
            }
            self.entities.insert(id, entity);
        }
        self.departed.clear();
        debug!(entities = self.entities.len(), "Snapshot applied");
    }

    /// Full entity for a newly joined participant.
    pub fn apply_add(&mut self, entity: Entity) {
        let id = entity.id.clone();
        self.departed.remove(&id);
        match self.entities.insert(id.clone(), entity) {
            Some(old) => {
                let mask = self.entities.get(&id).map(|new| diff(&old, new));
                if let Some(mask) = mask.filter(|m| !m.is_empty()) {
                    self.events.push(StoreEvent::Changed(id, mask));
                }
            }
            None => self.events.push(StoreEvent::Added(id)),
        }
    }

    pub fn apply_remove(&mut self, id: &PlayerId) {
        if self.entities.remove(id).is_some() {
            self.events.push(StoreEvent::Removed(id.clone()));
        }
        self.departed.insert(id.clone());
    }

    /// Applies one patch. Entries for identities never seen are skipped and
    /// reported as `StateDesync` after the rest has been applied.
    pub fn apply_patch(&mut self, patch: &Patch) -> Result<(), SyncError> {
        self.last_tick = patch.tick;
        for id in &patch.removed {
            self.apply_remove(id);
        }

        let mut desync = None;
        for entry in &patch.changed {
            let local = self.is_local(&entry.id);
            let Some(entity) = self.entities.get_mut(&entry.id) else {
                if self.departed.contains(&entry.id) {
                    debug!(player = %entry.id, "Stale update for departed entity");
                } else {
                    warn!(player = %entry.id, tick = patch.tick, "Update for unknown entity");
                    desync.get_or_insert_with(|| entry.id.clone());
                }
                continue;
            };
            let mask = entry.apply_to(entity);
            if local && entry.activity.is_some() {
                self.local_activity = None;
            }
            if !mask.is_empty() {
                self.events.push(StoreEvent::Changed(entry.id.clone(), mask));
            }
        }

        match desync {
            Some(id) => Err(SyncError::StateDesync(id)),
            None => Ok(()),
        }
    }

    /// Optimistic activity for the local participant, set when the command is sent.
    pub fn set_local_activity(&mut self, activity: ActivityState) {
        self.local_activity = Some(activity);
    }

    /// Activity to display: the local override if any, else the server's value.
    pub fn effective_activity(&self, id: &PlayerId) -> Option<ActivityState> {
        if self.is_local(id) {
            if let Some(a) = self.local_activity {
                return Some(a);
            }
        }
        self.entities.get(id).map(|e| e.activity)
    }

    /// Notifications queued since the previous drain.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Queued notifications since the previous drain.
    pub fn drain_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_shared::{entity::JoinOptions, math::Vec3, patch::EntityPatch};

    fn pid(s: &str) -> PlayerId {
        PlayerId::from(s)
    }

    fn entity(id: &str, x: f32) -> Entity {
        Entity::spawn(pid(id), &JoinOptions::new(id, "#ff0000", "female"), Vec3::new(x, 0.0, 0.0))
    }

    fn moved(id: &str, x: f32) -> EntityPatch {
        EntityPatch {
            position: Some(Vec3::new(x, 0.0, 0.0)),
            ..EntityPatch::new(pid(id))
        }
    }

    #[test]
    fn snapshot_then_patch_mirrors_server() {
        let mut store = SyncedStore::new();
        store.apply_snapshot(vec![entity("a", 0.0), entity("b", 1.0)]);
        assert_eq!(
            store.drain_events(),
            vec![StoreEvent::Added(pid("a")), StoreEvent::Added(pid("b"))]
        );

        let patch = Patch {
            tick: 3,
            changed: vec![EntityPatch {
                rotation_y: Some(0.5),
                ..moved("a", 2.0)
            }],
            removed: vec![],
        };
        store.apply_patch(&patch).unwrap();
        let a = store.get(&pid("a")).unwrap();
        assert_eq!(a.position, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(a.rotation_y, 0.5);
        assert_eq!(
            store.drain_events(),
            vec![StoreEvent::Changed(
                pid("a"),
                FieldMask::POSITION | FieldMask::ROTATION
            )]
        );
        assert_eq!(store.last_tick(), 3);
    }

    #[test]
    fn snapshot_reports_difference() {
        let mut store = SyncedStore::new();
        store.apply_snapshot(vec![entity("a", 0.0), entity("b", 0.0)]);
        store.drain_events();

        store.apply_snapshot(vec![entity("b", 4.0), entity("c", 0.0)]);
        assert_eq!(
            store.drain_events(),
            vec![
                StoreEvent::Removed(pid("a")),
                StoreEvent::Changed(pid("b"), FieldMask::POSITION),
                StoreEvent::Added(pid("c")),
            ]
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_identity_is_desync_but_rest_applies() {
        let mut store = SyncedStore::new();
        store.apply_snapshot(vec![entity("a", 0.0)]);
        let patch = Patch {
            tick: 1,
            changed: vec![moved("ghost", 1.0), moved("a", 3.0)],
            removed: vec![],
        };
        let err = store.apply_patch(&patch).unwrap_err();
        assert_eq!(err, SyncError::StateDesync(pid("ghost")));
        assert_eq!(store.get(&pid("a")).unwrap().position.x, 3.0);
        assert!(!store.contains(&pid("ghost")));
    }

    #[test]
    fn late_update_for_removed_entity_is_ignored() {
        let mut store = SyncedStore::new();
        store.apply_snapshot(vec![entity("a", 0.0), entity("b", 0.0)]);
        store.apply_remove(&pid("b"));
        let patch = Patch {
            tick: 2,
            changed: vec![moved("b", 9.0)],
            removed: vec![pid("b")],
        };
        assert!(store.apply_patch(&patch).is_ok());
        assert!(!store.contains(&pid("b")));
        let events = store.drain_events();
        assert_eq!(
            events.iter().filter(|e| **e == StoreEvent::Removed(pid("b"))).count(),
            1
        );
    }

    #[test]
    fn add_and_remove_notify() {
        let mut store = SyncedStore::new();
        store.apply_add(entity("a", 0.0));
        store.apply_add(entity("a", 0.0));
        store.apply_remove(&pid("a"));
        store.apply_remove(&pid("a"));
        assert_eq!(
            store.drain_events(),
            vec![StoreEvent::Added(pid("a")), StoreEvent::Removed(pid("a"))]
        );
    }

    #[test]
    fn local_activity_override_until_server_speaks() {
        let mut store = SyncedStore::new();
        store.set_local_id(pid("me"));
        store.apply_snapshot(vec![entity("me", 0.0)]);

        store.set_local_activity(ActivityState::Dancing);
        assert_eq!(store.effective_activity(&pid("me")), Some(ActivityState::Dancing));
        assert_eq!(store.get(&pid("me")).unwrap().activity, ActivityState::Idle);

        let patch = Patch {
            tick: 1,
            changed: vec![EntityPatch {
                activity: Some(ActivityState::Running),
                ..EntityPatch::new(pid("me"))
            }],
            removed: vec![],
        };
        store.apply_patch(&patch).unwrap();
        assert_eq!(store.effective_activity(&pid("me")), Some(ActivityState::Running));
    }

    #[test]
    fn override_never_applies_to_others() {
        let mut store = SyncedStore::new();
        store.set_local_id(pid("me"));
        store.apply_snapshot(vec![entity("me", 0.0), entity("other", 0.0)]);
        store.set_local_activity(ActivityState::Waving);
        assert_eq!(store.effective_activity(&pid("other")), Some(ActivityState::Idle));
    }

    #[test]
    fn events_are_drained_once() {
        let mut store = SyncedStore::new();
        store.apply_snapshot(vec![entity("a", 0.0)]);
        for tick in 1..=50 {
            let patch = Patch {
                tick,
                changed: vec![moved("a", tick as f32)],
                removed: vec![],
            };
            store.apply_patch(&patch).unwrap();
        }
        assert_eq!(store.pending_events(), 51);
        assert_eq!(store.drain_events().len(), 51);
        assert_eq!(store.pending_events(), 0);
    }
}
