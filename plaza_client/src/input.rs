//! Input handling.
//!
//! Input arrives as an explicit per-frame `InputState` value sampled by the
//! host (window, terminal, bot). Everything here is pure: no globals, no
//! event callbacks.

use bitflags::bitflags;
use plaza_shared::math::Vec3;

bitflags! {
    /// Held keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Keys: u8 {
        const W = 1 << 0;
        const A = 1 << 1;
        const S = 1 << 2;
        const D = 1 << 3;
        const JUMP = 1 << 4;
        const DANCE = 1 << 5;
        const WAVE = 1 << 6;

        const MOVEMENT = Self::W.bits() | Self::A.bits() | Self::S.bits() | Self::D.bits();
    }
}

/// User input for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub keys: Keys,
    /// Horizontal pointer movement since last frame, in pixels.
    pub pointer_dx: f32,
    pub pointer_captured: bool,
}

impl InputState {
    pub fn with_keys(keys: Keys) -> Self {
        Self {
            keys,
            ..Default::default()
        }
    }
}

/// Keys down in `cur` that were up in `prev`.
pub fn pressed_edges(prev: Keys, cur: Keys) -> Keys {
    cur & !prev
}

/// Local-space movement direction: +z forward, +x left.
/// Opposing keys cancel. Not normalized.
pub fn movement_vector(keys: Keys) -> Vec3 {
    let axis = |pos: Keys, neg: Keys| keys.contains(pos) as i8 as f32 - keys.contains(neg) as i8 as f32;
    Vec3::new(axis(Keys::A, Keys::D), 0.0, axis(Keys::W, Keys::S))
}

/// Facing offset (radians, relative to camera yaw) for a movement key
/// combination, or `None` if the keys do not move.
///
/// W 0, S π, A π/2, D -π/2 and the diagonals between them.
pub fn facing_for_keys(keys: Keys) -> Option<f32> {
    let v = movement_vector(keys);
    if v.x == 0.0 && v.z == 0.0 {
        return None;
    }
    Some(v.x.atan2(v.z))
}
