//! Container mutations, drained per tick and carried through the codec, keep
//! the client store identical to the container.

use plaza_client::store::SyncedStore;
use plaza_server::container::StateContainer;
use plaza_shared::codec::{decode_server, encode_patch, encode_server, ServerMsg};
use plaza_shared::entity::{ActivityState, Entity, JoinOptions, PlayerId};
use plaza_shared::math::Vec3;

fn deliver(store: &mut SyncedStore, bytes: &[u8]) -> anyhow::Result<()> {
    match decode_server(bytes)? {
        ServerMsg::Snapshot(entities) => store.apply_snapshot(entities),
        ServerMsg::Patch(patch) => store.apply_patch(&patch)?,
        ServerMsg::Add(entity) => store.apply_add(entity),
        ServerMsg::Remove(id) => store.apply_remove(&id),
        other => anyhow::bail!("unexpected {}", other.kind()),
    }
    Ok(())
}

fn join(
    container: &mut StateContainer,
    store: &mut SyncedStore,
    name: &str,
    x: f32,
) -> anyhow::Result<()> {
    let id = PlayerId::from(name);
    let options = JoinOptions::new(name, "#00ff00", "spiderman");
    let entity = Entity::spawn(id.clone(), &options, Vec3::new(x, 0.0, 0.0));
    container.insert(id, entity.clone());
    deliver(store, &encode_server(&ServerMsg::Add(entity)))
}

fn leave(container: &mut StateContainer, store: &mut SyncedStore, name: &str) -> anyhow::Result<()> {
    let id = PlayerId::from(name);
    container.remove(&id);
    deliver(store, &encode_server(&ServerMsg::Remove(id)))
}

fn assert_mirrors(container: &StateContainer, store: &SyncedStore) {
    let mirrored: Vec<Entity> = store.iter().cloned().collect();
    assert_eq!(mirrored, container.snapshot());
}

#[test]
fn store_tracks_container_across_ticks() -> anyhow::Result<()> {
    let mut container = StateContainer::new();
    let mut store = SyncedStore::new();

    join(&mut container, &mut store, "ann", 0.0)?;
    join(&mut container, &mut store, "bob", 1.0)?;
    deliver(&mut store, &encode_server(&ServerMsg::Snapshot(container.snapshot())))?;
    container.drain_changes();

    let activities = [
        ActivityState::Running,
        ActivityState::Jump,
        ActivityState::Idle,
        ActivityState::Dancing,
        ActivityState::Waving,
    ];
    let ann = PlayerId::from("ann");
    let bob = PlayerId::from("bob");

    for tick in 1..=40u32 {
        let t = tick as f32;
        container.mutate(&ann, |e| {
            e.set_position(Vec3::new(t * 0.25, 0.0, -t));
            e.set_rotation_y(t * 0.1);
        })?;
        if container.contains(&bob) {
            if tick % 3 == 0 {
                let activity = activities[tick as usize % activities.len()];
                container.mutate(&bob, |e| e.set_activity(activity))?;
            }
            // Setting a value back to its default still counts as a change.
            let rotation = if tick % 4 == 0 { 0.0 } else { t };
            container.mutate(&bob, |e| e.set_rotation_y(rotation))?;
        }

        match tick {
            10 => join(&mut container, &mut store, "cid", 5.0)?,
            20 => leave(&mut container, &mut store, "bob")?,
            25 => {
                // Joins and leaves inside one cycle.
                join(&mut container, &mut store, "dee", 2.0)?;
                leave(&mut container, &mut store, "dee")?;
            }
            _ => {}
        }
        let cid = PlayerId::from("cid");
        if container.contains(&cid) {
            container.mutate(&cid, |e| e.set_position(Vec3::new(5.0, 0.0, t)))?;
        }

        let record = container.drain_changes();
        if !record.is_empty() {
            deliver(&mut store, &encode_patch(tick, &record))?;
        }
        assert_mirrors(&container, &store);
    }

    assert_eq!(store.len(), 2);
    assert!(!store.contains(&bob));
    assert!(container.drain_changes().is_empty());
    Ok(())
}
