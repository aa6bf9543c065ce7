//! `plaza_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - One canonical entity shape and one wire format for both sides.
//! - Patches carry current values, never deltas, so they can be merged and
//!   re-applied safely.
//! - Collaborators (physics) behind traits.
//! - No `unsafe`.

pub mod chat;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod math;
pub mod net;
pub mod patch;
pub mod physics;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{ClientMsg, ServerMsg};
    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::error::SyncError;
    pub use crate::math::*;
    pub use crate::patch::*;
}
