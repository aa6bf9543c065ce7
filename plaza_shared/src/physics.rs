//! Physics abstraction.
//!
//! The plaza does not simulate collisions. The local pipeline asks a
//! `GroundProbe` whether the participant stands on something and lets it
//! correct the proposed position after movement.

use crate::math::Vec3;

/// Grounding/collision collaborator consumed by the local pipeline.
pub trait GroundProbe: Send + Sync {
    /// True if a body at `position` is standing on ground.
    fn is_grounded(&self, position: Vec3) -> bool;

    /// Collision-driven correction of a proposed position.
    fn correct(&self, proposed: Vec3) -> Vec3 {
        proposed
    }
}

/// Infinite flat floor at `height`.
#[derive(Debug, Clone, Copy)]
pub struct FlatGround {
    pub height: f32,
    pub tolerance: f32,
}

impl Default for FlatGround {
    fn default() -> Self {
        Self {
            height: 0.0,
            tolerance: 0.05,
        }
    }
}

impl GroundProbe for FlatGround {
    fn is_grounded(&self, position: Vec3) -> bool {
        position.y <= self.height + self.tolerance
    }

    fn correct(&self, proposed: Vec3) -> Vec3 {
        Vec3::new(proposed.x, proposed.y.max(self.height), proposed.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_ground_clamps_below_floor() {
        let ground = FlatGround::default();
        assert!(ground.is_grounded(Vec3::new(3.0, 0.0, 1.0)));
        assert!(!ground.is_grounded(Vec3::new(0.0, 1.0, 0.0)));
        assert_eq!(ground.correct(Vec3::new(1.0, -2.0, 1.0)), Vec3::new(1.0, 0.0, 1.0));
    }
}
