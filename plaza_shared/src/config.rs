//! Configuration system.
//!
//! Loads plaza configuration from JSON. Every field has a default, so a
//! partial file (or `{}`) is valid.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlazaConfig {
    /// Server listen address, e.g. `127.0.0.1:2567`.
    pub server_addr: String,
    /// Patch broadcast rate.
    pub tick_hz: u32,
    /// Participant cap per session.
    pub max_participants: usize,
    /// Spawn area is `[-e, e]` on x and z.
    pub spawn_half_extent: f32,
    /// Per-connection outbound queue bound.
    pub send_queue_capacity: usize,
    /// Consecutive malformed frames tolerated before the connection is closed.
    pub malformed_threshold: u32,
    /// Silence longer than this is treated as a leave.
    pub liveness_timeout_ms: u64,

    /// Session the client joins (client only).
    pub session_key: String,
    /// Join options (client only).
    pub display_name: String,
    pub color: String,
    pub appearance: String,

    /// Local movement speed, units per second.
    pub move_speed: f32,
    /// Yaw radians per pointer pixel.
    pub pointer_sensitivity: f32,
    /// Per-frame smoothing fraction for remote entities.
    pub interpolation_fraction: f32,
    pub jump_cooldown_secs: f32,
    /// Smallest position/rotation change worth sending.
    pub send_epsilon: f32,
}

impl Default for PlazaConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:2567".to_string(),
            tick_hz: 20,
            max_participants: 4,
            spawn_half_extent: 2.5,
            send_queue_capacity: 64,
            malformed_threshold: 8,
            liveness_timeout_ms: 10_000,
            session_key: "my_room".to_string(),
            display_name: "Player".to_string(),
            color: "#ffffff".to_string(),
            appearance: "female".to_string(),
            move_speed: 5.0,
            pointer_sensitivity: 0.002,
            interpolation_fraction: 0.1,
            jump_cooldown_secs: 1.0,
            send_epsilon: 1e-3,
        }
    }
}

impl PlazaConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        info!(path = %path.display(), "Loaded config");
        Ok(cfg)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(1.0 / self.tick_hz.max(1) as f32)
    }

    pub fn liveness_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.liveness_timeout_ms)
    }
}
