//! Session coordinator.
//!
//! Owns one `StateContainer` and the set of connections in a session. Bridges
//! transport events (join, command, leave) to container mutations and turns
//! the container's change record into one patch per tick.
//!
//! Authority: a command only ever touches the entity bound to the connection
//! it arrived on. The wire format has no identity field to forge.
//!
//! Nothing here awaits. Outbound messages go into per-connection `Outbox`es.

use std::collections::BTreeMap;
use std::sync::Arc;

use plaza_shared::{
    chat::{sanitize_text, ChatMessage},
    codec::{ClientMsg, ServerMsg},
    config::PlazaConfig,
    entity::{ActivityState, Entity, JoinOptions, PlayerId},
    error::SyncError,
    math::Vec3,
    net::ConnectionId,
    patch::Patch,
};
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    container::StateContainer,
    outbox::{Outbox, PushOutcome},
};

/// Length of generated identities.
const ID_LEN: usize = 9;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No one has joined yet.
    Created,
    /// At least one participant.
    Active,
    /// Terminal.
    Disposed,
}

/// Limits a session enforces.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_participants: usize,
    pub spawn_half_extent: f32,
    pub malformed_threshold: u32,
}

impl SessionLimits {
    pub fn from_config(cfg: &PlazaConfig) -> Self {
        Self {
            max_participants: cfg.max_participants,
            spawn_half_extent: cfg.spawn_half_extent,
            malformed_threshold: cfg.malformed_threshold,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from_config(&PlazaConfig::default())
    }
}

struct Participant {
    id: PlayerId,
    outbox: Arc<Outbox>,
    malformed: u32,
}

pub struct SessionCoordinator {
    key: String,
    limits: SessionLimits,
    state: SessionState,
    container: StateContainer,
    connections: BTreeMap<ConnectionId, Participant>,
    tick: u32,
    rng: StdRng,
    /// Connections whose outbox overflowed during the current operation.
    evicted: Vec<ConnectionId>,
}

impl SessionCoordinator {
    pub fn new(key: impl Into<String>, limits: SessionLimits) -> Self {
        Self::with_rng(key, limits, StdRng::from_entropy())
    }

    /// Deterministic spawn positions and identities, for tests.
    pub fn with_seed(key: impl Into<String>, limits: SessionLimits, seed: u64) -> Self {
        Self::with_rng(key, limits, StdRng::seed_from_u64(seed))
    }

    fn with_rng(key: impl Into<String>, limits: SessionLimits, rng: StdRng) -> Self {
        let key = key.into();
        info!(session = %key, "Session created");
        Self {
            key,
            limits,
            state: SessionState::Created,
            container: StateContainer::new(),
            connections: BTreeMap::new(),
            tick: 0,
            rng,
            evicted: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn participant_count(&self) -> usize {
        self.connections.len()
    }

    pub fn container(&self) -> &StateContainer {
        &self.container
    }

    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<&PlayerId> {
        self.connections.get(&conn).map(|p| &p.id)
    }

    /// Admits a connection: creates its entity, sends it the full state and
    /// tells everyone else.
    pub fn on_join(
        &mut self,
        conn: ConnectionId,
        options: &JoinOptions,
        outbox: Arc<Outbox>,
    ) -> Result<PlayerId, SyncError> {
        if self.state == SessionState::Disposed {
            return Err(SyncError::Disposed);
        }
        if let Some(existing) = self.connections.get(&conn) {
            debug!(session = %self.key, %conn, player = %existing.id, "Duplicate join ignored");
            return Ok(existing.id.clone());
        }
        if self.connections.len() >= self.limits.max_participants {
            warn!(
                session = %self.key,
                %conn,
                max = self.limits.max_participants,
                "Join rejected: session full"
            );
            return Err(SyncError::CapacityExceeded);
        }

        let id = self.allocate_id();
        let entity = Entity::spawn(id.clone(), options, self.spawn_position());
        self.container.insert(id.clone(), entity.clone());
        self.connections.insert(
            conn,
            Participant {
                id: id.clone(),
                outbox,
                malformed: 0,
            },
        );
        self.state = SessionState::Active;

        info!(
            session = %self.key,
            %conn,
            player = %id,
            name = %entity.display_name,
            "Participant joined"
        );

        self.send_to(conn, ServerMsg::Welcome { id: id.clone() });
        self.send_to(conn, ServerMsg::Snapshot(self.container.snapshot()));
        self.broadcast_except(conn, ServerMsg::Add(entity));
        self.evict_overflowed();
        Ok(id)
    }

    /// Applies one inbound command on behalf of `conn`'s own entity.
    pub fn on_command(&mut self, conn: ConnectionId, cmd: ClientMsg) -> Result<(), SyncError> {
        let Some(participant) = self.connections.get_mut(&conn) else {
            debug!(session = %self.key, %conn, kind = cmd.kind(), "Command from unbound connection");
            return Err(SyncError::UnauthorizedMutation(conn));
        };
        let id = participant.id.clone();

        let result = match cmd {
            ClientMsg::Move {
                position,
                rotation_y,
            } => {
                if !position.is_finite() || !rotation_y.is_finite() {
                    Err(SyncError::malformed("non-finite move"))
                } else {
                    self.container
                        .mutate(&id, |e| {
                            e.set_position(position);
                            e.set_rotation_y(rotation_y);
                        })
                        .map(|_| ())
                }
            }
            ClientMsg::Rotate { rotation_y } => {
                if !rotation_y.is_finite() {
                    Err(SyncError::malformed("non-finite rotate"))
                } else {
                    self.container
                        .mutate(&id, |e| e.set_rotation_y(rotation_y))
                        .map(|_| ())
                }
            }
            ClientMsg::ChangeState { state } => match ActivityState::parse(&state) {
                Some(activity) => self
                    .container
                    .mutate(&id, |e| e.set_activity(activity))
                    .map(|_| ()),
                None => {
                    warn!(session = %self.key, player = %id, state = %state, "Ignoring unknown activity state");
                    Ok(())
                }
            },
            ClientMsg::Chat { text } => {
                self.chat(&id, &text);
                Ok(())
            }
            ClientMsg::RequestSnapshot => {
                debug!(session = %self.key, player = %id, "Resending snapshot");
                self.send_to(conn, ServerMsg::Snapshot(self.container.snapshot()));
                Ok(())
            }
            ClientMsg::Join { .. } => {
                debug!(session = %self.key, player = %id, "Join on bound connection ignored");
                Ok(())
            }
            ClientMsg::Leave => {
                self.on_leave(conn);
                Ok(())
            }
            ClientMsg::Ping => Ok(()),
        };

        match &result {
            Err(SyncError::UnknownIdentity(ghost)) => {
                warn!(session = %self.key, player = %ghost, "Command raced with removal; dropped");
            }
            Err(e @ SyncError::MalformedMessage(_)) => {
                if self.on_malformed(conn, e) {
                    warn!(session = %self.key, player = %id, "Too many malformed commands; closing");
                    self.on_leave(conn);
                }
            }
            Err(e) => {
                warn!(session = %self.key, player = %id, error = %e, "Command dropped");
            }
            Ok(()) => {
                if let Some(p) = self.connections.get_mut(&conn) {
                    p.malformed = 0;
                }
            }
        }
        self.evict_overflowed();
        result
    }

    fn chat(&mut self, id: &PlayerId, text: &str) {
        let Some(text) = sanitize_text(text) else {
            debug!(session = %self.key, player = %id, "Empty chat dropped");
            return;
        };
        let sender_name = self
            .container
            .get(id)
            .map(|e| e.display_name.clone())
            .unwrap_or_default();
        self.broadcast(ServerMsg::Chat(ChatMessage {
            sender: id.clone(),
            sender_name,
            text,
        }));
    }

    /// Counts a malformed frame from `conn`. Returns true once the connection
    /// has crossed the threshold and should be closed.
    pub fn on_malformed(&mut self, conn: ConnectionId, error: &SyncError) -> bool {
        let Some(p) = self.connections.get_mut(&conn) else {
            return false;
        };
        p.malformed += 1;
        warn!(
            session = %self.key,
            player = %p.id,
            count = p.malformed,
            error = %error,
            "Malformed message dropped"
        );
        p.malformed > self.limits.malformed_threshold
    }

    /// Removes `conn`'s entity. Safe to call any number of times.
    pub fn on_leave(&mut self, conn: ConnectionId) -> Option<PlayerId> {
        let participant = self.connections.remove(&conn)?;
        participant.outbox.close();
        self.container.remove(&participant.id);
        info!(session = %self.key, %conn, player = %participant.id, "Participant left");

        self.broadcast(ServerMsg::Remove(participant.id.clone()));
        if self.connections.is_empty() && self.state != SessionState::Disposed {
            self.dispose();
        }
        Some(participant.id)
    }

    /// Drains container changes and broadcasts them as one patch.
    pub fn tick(&mut self) -> Option<Patch> {
        if self.state != SessionState::Active {
            return None;
        }
        self.tick = self.tick.wrapping_add(1);
        let record = self.container.drain_changes();
        let patch = Patch::from_record(self.tick, &record);
        if patch.is_empty() {
            return None;
        }
        debug!(
            session = %self.key,
            tick = self.tick,
            changed = patch.changed.len(),
            removed = patch.removed.len(),
            "Broadcasting patch"
        );
        self.broadcast(ServerMsg::Patch(patch.clone()));
        self.evict_overflowed();
        Some(patch)
    }

    /// Terminal: drops every connection and entity.
    pub fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        for p in self.connections.values() {
            p.outbox.close();
        }
        self.connections.clear();
        self.container = StateContainer::new();
        self.state = SessionState::Disposed;
        info!(session = %self.key, "Session disposed");
    }

    fn allocate_id(&mut self) -> PlayerId {
        loop {
            let s: String = (&mut self.rng)
                .sample_iter(&Alphanumeric)
                .take(ID_LEN)
                .map(char::from)
                .collect();
            let id = PlayerId(s);
            if !self.container.contains(&id) {
                return id;
            }
        }
    }

    fn spawn_position(&mut self) -> Vec3 {
        let e = self.limits.spawn_half_extent.abs();
        Vec3::new(
            self.rng.gen_range(-e..=e),
            0.0,
            self.rng.gen_range(-e..=e),
        )
    }

    fn send_to(&mut self, conn: ConnectionId, msg: ServerMsg) {
        if let Some(p) = self.connections.get(&conn) {
            if p.outbox.push(msg) == PushOutcome::Overflow {
                self.evicted.push(conn);
            }
        }
    }

    fn broadcast(&mut self, msg: ServerMsg) {
        for (conn, p) in &self.connections {
            if p.outbox.push(msg.clone()) == PushOutcome::Overflow {
                self.evicted.push(*conn);
            }
        }
    }

    fn broadcast_except(&mut self, skip: ConnectionId, msg: ServerMsg) {
        for (conn, p) in &self.connections {
            if *conn != skip && p.outbox.push(msg.clone()) == PushOutcome::Overflow {
                self.evicted.push(*conn);
            }
        }
    }

    fn evict_overflowed(&mut self) {
        while let Some(conn) = self.evicted.pop() {
            warn!(session = %self.key, %conn, "Send queue overflow; dropping connection");
            self.on_leave(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_shared::patch::EntityPatch;

    fn limits(max: usize) -> SessionLimits {
        SessionLimits {
            max_participants: max,
            spawn_half_extent: 2.5,
            malformed_threshold: 3,
        }
    }

    fn join(
        s: &mut SessionCoordinator,
        n: u64,
        name: &str,
    ) -> (ConnectionId, PlayerId, Arc<Outbox>) {
        let conn = ConnectionId(n);
        let outbox = Arc::new(Outbox::new(64));
        let id = s
            .on_join(conn, &JoinOptions::new(name, "#ff0000", "female"), outbox.clone())
            .unwrap();
        (conn, id, outbox)
    }

    fn drain(outbox: &Outbox) -> Vec<ServerMsg> {
        std::iter::from_fn(|| outbox.try_pop()).collect()
    }

    #[test]
    fn join_creates_idle_entity_in_spawn_bounds() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 7);
        assert_eq!(s.state(), SessionState::Created);
        let (_, id, outbox) = join(&mut s, 1, "Ann");
        assert_eq!(s.state(), SessionState::Active);

        let e = s.container().get(&id).unwrap();
        assert_eq!(e.display_name, "Ann");
        assert_eq!(e.color, "#ff0000");
        assert_eq!(e.activity, ActivityState::Idle);
        assert_eq!(e.rotation_y, 0.0);
        assert!(e.position.x.abs() <= 2.5 && e.position.z.abs() <= 2.5);
        assert_eq!(e.position.y, 0.0);

        let msgs = drain(&outbox);
        assert_eq!(msgs[0], ServerMsg::Welcome { id: id.clone() });
        assert!(matches!(&msgs[1], ServerMsg::Snapshot(es) if es.len() == 1));
    }

    #[test]
    fn others_are_told_about_new_participant() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 1);
        let (_, _, first) = join(&mut s, 1, "Ann");
        drain(&first);
        let (_, bob, second) = join(&mut s, 2, "Bob");
        assert!(matches!(drain(&first).as_slice(), [ServerMsg::Add(e)] if e.id == bob));
        assert!(matches!(&drain(&second)[1], ServerMsg::Snapshot(es) if es.len() == 2));
    }

    #[test]
    fn join_at_capacity_fails_without_creating_entity() {
        let mut s = SessionCoordinator::with_seed("room", limits(1), 1);
        join(&mut s, 1, "Ann");
        let err = s
            .on_join(ConnectionId(2), &JoinOptions::default(), Arc::new(Outbox::new(8)))
            .unwrap_err();
        assert_eq!(err, SyncError::CapacityExceeded);
        assert_eq!(s.container().len(), 1);
        assert_eq!(s.participant_count(), 1);
    }

    #[test]
    fn move_then_tick_broadcasts_patch() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 3);
        let (conn, id, outbox) = join(&mut s, 1, "Ann");
        s.tick();
        drain(&outbox);

        s.on_command(
            conn,
            ClientMsg::Move {
                position: Vec3::new(1.0, 0.0, 2.0),
                rotation_y: 0.5,
            },
        )
        .unwrap();
        let patch = s.tick().expect("patch");
        assert_eq!(
            patch.changed,
            vec![EntityPatch {
                id: id.clone(),
                activity: None,
                position: Some(Vec3::new(1.0, 0.0, 2.0)),
                rotation_y: Some(0.5),
            }]
        );
        assert_eq!(drain(&outbox), vec![ServerMsg::Patch(patch)]);
    }

    #[test]
    fn commands_only_touch_senders_entity() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (a_conn, a, _) = join(&mut s, 1, "Ann");
        let (_, b, _) = join(&mut s, 2, "Bob");
        let before_b = s.container().get(&b).cloned().unwrap();

        for i in 0..20 {
            s.on_command(
                a_conn,
                ClientMsg::Move {
                    position: Vec3::new(i as f32, 0.0, 0.0),
                    rotation_y: i as f32 * 0.1,
                },
            )
            .unwrap();
        }
        assert_eq!(s.container().get(&b), Some(&before_b));
        assert_eq!(s.container().get(&a).unwrap().position.x, 19.0);

        let patch = s.tick().unwrap();
        assert!(patch.changed.iter().all(|p| p.id == a));
    }

    #[test]
    fn unbound_connection_has_no_authority() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        join(&mut s, 1, "Ann");
        let err = s
            .on_command(ConnectionId(99), ClientMsg::Rotate { rotation_y: 1.0 })
            .unwrap_err();
        assert_eq!(err, SyncError::UnauthorizedMutation(ConnectionId(99)));
        s.tick();
        assert!(s.tick().is_none());
    }

    #[test]
    fn invalid_state_is_ignored() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (conn, id, _) = join(&mut s, 1, "Ann");
        s.on_command(conn, ClientMsg::ChangeState { state: "Dancing".into() })
            .unwrap();
        s.on_command(conn, ClientMsg::ChangeState { state: "Flying".into() })
            .unwrap();
        assert_eq!(
            s.container().get(&id).unwrap().activity,
            ActivityState::Dancing
        );
    }

    #[test]
    fn non_finite_move_is_malformed() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (conn, id, _) = join(&mut s, 1, "Ann");
        let before = s.container().get(&id).unwrap().position;
        let err = s
            .on_command(
                conn,
                ClientMsg::Move {
                    position: Vec3::new(f32::NAN, 0.0, 0.0),
                    rotation_y: 0.0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));
        assert_eq!(s.container().get(&id).unwrap().position, before);
    }

    #[test]
    fn chat_is_trimmed_and_fanned_out() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (a_conn, a, a_box) = join(&mut s, 1, "Ann");
        let (_, _, b_box) = join(&mut s, 2, "Bob");
        drain(&a_box);
        drain(&b_box);

        s.on_command(a_conn, ClientMsg::Chat { text: "   ".into() }).unwrap();
        s.on_command(a_conn, ClientMsg::Chat { text: " hi all ".into() }).unwrap();

        let expected = ServerMsg::Chat(ChatMessage {
            sender: a,
            sender_name: "Ann".into(),
            text: "hi all".into(),
        });
        assert_eq!(drain(&a_box), vec![expected.clone()]);
        assert_eq!(drain(&b_box), vec![expected]);
        assert!(s.tick().is_none(), "chat never touches entity state");
    }

    #[test]
    fn leave_is_idempotent_and_notifies_others() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (a_conn, a, _) = join(&mut s, 1, "Ann");
        let (_, _, b_box) = join(&mut s, 2, "Bob");
        s.tick();
        drain(&b_box);

        assert_eq!(s.on_leave(a_conn), Some(a.clone()));
        assert_eq!(s.on_leave(a_conn), None);
        assert_eq!(drain(&b_box), vec![ServerMsg::Remove(a.clone())]);

        let patch = s.tick().unwrap();
        assert_eq!(patch.removed, vec![a.clone()]);
        assert!(s.tick().is_none());

        let err = s
            .on_command(a_conn, ClientMsg::Rotate { rotation_y: 2.0 })
            .unwrap_err();
        assert_eq!(err, SyncError::UnauthorizedMutation(a_conn));
        assert!(!s.container().contains(&a));
    }

    #[test]
    fn last_leave_disposes_session() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (conn, _, outbox) = join(&mut s, 1, "Ann");
        s.on_leave(conn);
        assert_eq!(s.state(), SessionState::Disposed);
        let err = s
            .on_join(ConnectionId(2), &JoinOptions::default(), outbox)
            .unwrap_err();
        assert_eq!(err, SyncError::Disposed);
    }

    #[test]
    fn malformed_threshold_closes_connection() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (conn, _, _) = join(&mut s, 1, "Ann");
        let err = SyncError::malformed("junk");
        assert!(!s.on_malformed(conn, &err));
        assert!(!s.on_malformed(conn, &err));
        assert!(!s.on_malformed(conn, &err));
        assert!(s.on_malformed(conn, &err));
    }

    #[test]
    fn emote_bursts_are_never_throttled() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (a_conn, _, a_box) = join(&mut s, 1, "Ann");
        let (_, _, b_box) = join(&mut s, 2, "Bob");
        drain(&a_box);
        drain(&b_box);

        for i in 0..8 {
            let text = if i % 2 == 0 { "*dances*" } else { "*waves*" };
            s.on_command(a_conn, ClientMsg::Chat { text: text.into() })
                .unwrap();
        }
        let chats = drain(&b_box)
            .into_iter()
            .filter(|m| matches!(m, ServerMsg::Chat(_)))
            .count();
        assert_eq!(chats, 8);
    }

    #[test]
    fn repeated_non_finite_moves_close_connection() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        let (a_conn, a, _) = join(&mut s, 1, "Ann");
        let (_, _, b_box) = join(&mut s, 2, "Bob");
        drain(&b_box);
        let nan = || ClientMsg::Rotate {
            rotation_y: f32::NAN,
        };

        // A valid command in between starts the count over.
        for _ in 0..3 {
            assert!(s.on_command(a_conn, nan()).is_err());
        }
        s.on_command(a_conn, ClientMsg::Ping).unwrap();
        for _ in 0..3 {
            assert!(s.on_command(a_conn, nan()).is_err());
        }
        assert_eq!(s.participant_count(), 2);

        assert!(s.on_command(a_conn, nan()).is_err());
        assert_eq!(s.participant_count(), 1);
        assert!(!s.container().contains(&a));
        assert_eq!(drain(&b_box), vec![ServerMsg::Remove(a)]);
    }

    #[test]
    fn overflowing_outbox_evicts_connection() {
        let mut s = SessionCoordinator::with_seed("room", limits(4), 5);
        // Welcome and snapshot fill this queue; nothing in it can be dropped.
        let slow = Arc::new(Outbox::new(2));
        let a = s
            .on_join(ConnectionId(1), &JoinOptions::default(), slow.clone())
            .unwrap();
        assert_eq!(slow.len(), 2);

        let (_, b, b_box) = join(&mut s, 2, "Bob");
        assert_eq!(s.participant_count(), 1);
        assert!(!s.container().contains(&a));
        assert!(s.container().contains(&b));
        assert_eq!(s.state(), SessionState::Active);

        let msgs = drain(&b_box);
        assert_eq!(msgs.last(), Some(&ServerMsg::Remove(a.clone())));
        assert!(!msgs.iter().any(|m| matches!(m, ServerMsg::Add(_))));
    }

    #[test]
    fn identities_are_unique() {
        let mut s = SessionCoordinator::with_seed("room", limits(16), 11);
        let ids: std::collections::HashSet<_> =
            (0..16).map(|n| join(&mut s, n, "P").1).collect();
        assert_eq!(ids.len(), 16);
    }
}
