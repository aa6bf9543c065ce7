//! Local input & command pipeline.
//!
//! Turns one `InputState` per frame into optimistic local motion, facing and
//! activity, and the outbound commands describing what changed. Never waits
//! for the server.

use plaza_shared::{
    codec::ClientMsg,
    config::PlazaConfig,
    entity::ActivityState,
    math::{angle_delta, wrap_angle, Vec3},
    physics::GroundProbe,
};
use tracing::debug;

use crate::{
    input::{facing_for_keys, movement_vector, pressed_edges, InputState, Keys},
    store::SyncedStore,
};

pub const DANCE_CHAT: &str = "*dances*";
pub const WAVE_CHAT: &str = "*waves*";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub move_speed: f32,
    pub pointer_sensitivity: f32,
    pub jump_cooldown_secs: f32,
    pub send_epsilon: f32,
}

impl PipelineSettings {
    pub fn from_config(cfg: &PlazaConfig) -> Self {
        Self {
            move_speed: cfg.move_speed,
            pointer_sensitivity: cfg.pointer_sensitivity,
            jump_cooldown_secs: cfg.jump_cooldown_secs,
            send_epsilon: cfg.send_epsilon,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&PlazaConfig::default())
    }
}

/// Last values put on the wire.
#[derive(Debug, Clone, Copy)]
struct Sent {
    position: Vec3,
    rotation_y: f32,
    activity: ActivityState,
}

pub struct LocalPipeline {
    settings: PipelineSettings,
    position: Vec3,
    /// Camera yaw, driven by the pointer.
    yaw: f32,
    /// Body facing, sent as `rotation_y`.
    facing: f32,
    activity: ActivityState,
    prev_keys: Keys,
    move_keys: Keys,
    since_jump: f32,
    sent: Sent,
}

impl LocalPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        let cooldown = settings.jump_cooldown_secs;
        Self {
            settings,
            position: Vec3::ZERO,
            yaw: 0.0,
            facing: 0.0,
            activity: ActivityState::Idle,
            prev_keys: Keys::empty(),
            move_keys: Keys::empty(),
            since_jump: cooldown,
            sent: Sent {
                position: Vec3::ZERO,
                rotation_y: 0.0,
                activity: ActivityState::Idle,
            },
        }
    }

    /// Adopts the server's spawn state as both local and last-sent state.
    pub fn reset(&mut self, position: Vec3, rotation_y: f32, activity: ActivityState) {
        self.position = position;
        self.facing = rotation_y;
        self.yaw = rotation_y;
        self.activity = activity;
        self.sent = Sent {
            position,
            rotation_y,
            activity,
        };
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn facing(&self) -> f32 {
        self.facing
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn activity(&self) -> ActivityState {
        self.activity
    }

    /// Runs one frame and returns the commands to send, in order.
    pub fn step(
        &mut self,
        input: &InputState,
        dt: f32,
        ground: &dyn GroundProbe,
        store: &mut SyncedStore,
    ) -> Vec<ClientMsg> {
        let keys = input.keys;
        let edges = pressed_edges(self.prev_keys, keys);
        self.prev_keys = keys;
        self.since_jump += dt;

        if input.pointer_captured && !self.activity.is_emote() {
            self.yaw = wrap_angle(self.yaw - input.pointer_dx * self.settings.pointer_sensitivity);
        }

        let local_dir = movement_vector(keys);
        let moving = local_dir.len_sq() > 0.0;
        if moving {
            let step = local_dir.normalized().rotate_y(self.yaw) * (self.settings.move_speed * dt);
            self.position = ground.correct(self.position + step);
        }

        let move_keys = keys & Keys::MOVEMENT;
        if move_keys != self.move_keys {
            if let Some(offset) = facing_for_keys(move_keys) {
                self.facing = wrap_angle(self.yaw + offset);
            }
            self.move_keys = move_keys;
        }

        let chat = self.update_activity(edges, moving, ground);
        let mut out = Vec::new();

        let eps = self.settings.send_epsilon;
        let rotated = angle_delta(self.sent.rotation_y, self.facing).abs() > eps;
        if self.position.distance(self.sent.position) > eps {
            out.push(ClientMsg::Move {
                position: self.position,
                rotation_y: self.facing,
            });
            self.sent.position = self.position;
            self.sent.rotation_y = self.facing;
        } else if rotated {
            out.push(ClientMsg::Rotate {
                rotation_y: self.facing,
            });
            self.sent.rotation_y = self.facing;
        }

        if self.activity != self.sent.activity {
            debug!(from = %self.sent.activity, to = %self.activity, "Local activity changed");
            out.push(ClientMsg::ChangeState {
                state: self.activity.as_str().to_string(),
            });
            store.set_local_activity(self.activity);
            self.sent.activity = self.activity;
        }

        if let Some(text) = chat {
            out.push(ClientMsg::Chat {
                text: text.to_string(),
            });
        }
        out
    }

    /// Returns the emote chat line to send, if an emote just started.
    fn update_activity(
        &mut self,
        edges: Keys,
        moving: bool,
        ground: &dyn GroundProbe,
    ) -> Option<&'static str> {
        let cooldown = self.settings.jump_cooldown_secs;

        if edges.contains(Keys::JUMP)
            && self.since_jump >= cooldown
            && ground.is_grounded(self.position)
        {
            self.activity = ActivityState::Jump;
            self.since_jump = 0.0;
            return None;
        }
        if self.activity == ActivityState::Jump && self.since_jump < cooldown {
            return None;
        }
        if moving {
            self.activity = ActivityState::Running;
            return None;
        }
        if edges.contains(Keys::DANCE) {
            self.activity = ActivityState::Dancing;
            return Some(DANCE_CHAT);
        }
        if edges.contains(Keys::WAVE) {
            self.activity = ActivityState::Waving;
            return Some(WAVE_CHAT);
        }
        if !self.activity.is_emote() {
            self.activity = ActivityState::Idle;
        }
        None
    }
}
