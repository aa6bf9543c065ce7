//! `plaza_client`
//!
//! Client-side systems:
//! - Connection and join handshake
//! - Synchronized store mirroring the server's entities
//! - Local input pipeline (optimistic own motion, outbound commands)
//! - Exponential smoothing of remote entities
//! - Chat log

pub mod client;
pub mod input;
pub mod interp;
pub mod pipeline;
pub mod store;

pub use client::GameClient;
