//! `plaza_server`
//!
//! Authoritative side of the plaza:
//! - `container`: entity map with per-field change tracking
//! - `session`: join/command/leave handling and per-tick patch broadcast
//! - `outbox`: bounded, non-blocking per-connection send queue
//! - `server`: tokio runtime (accept loop, session actors, reader/writer tasks)
//!
//! Networking model:
//! - TCP, one ordered stream per participant
//! - Changes are batched per tick; chat, adds and removes go out immediately

pub mod container;
pub mod outbox;
pub mod server;
pub mod session;

pub use server::GameServer;
pub use session::SessionCoordinator;
