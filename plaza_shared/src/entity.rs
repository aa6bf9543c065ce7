//! Entity state model.
//!
//! One `Entity` per connected participant. Identity, name, color and
//! appearance are fixed at join; activity, position and yaw change at runtime
//! and are the only fields that travel in patches.

use std::fmt;

use crate::math::Vec3;

/// Maximum display name length in characters.
pub const MAX_NAME_LENGTH: usize = 32;

pub const DEFAULT_NAME: &str = "Player";
pub const DEFAULT_COLOR: &str = "#ffffff";

/// Opaque participant identity, assigned by the server at join.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(s: impl Into<String>) -> Self {
        PlayerId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        PlayerId(s.to_string())
    }
}

/// What the participant is currently doing; drives the animation choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActivityState {
    #[default]
    Idle,
    Running,
    Jump,
    Dancing,
    Waving,
}

impl ActivityState {
    pub const ALL: [ActivityState; 5] = [
        ActivityState::Idle,
        ActivityState::Running,
        ActivityState::Jump,
        ActivityState::Dancing,
        ActivityState::Waving,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityState::Idle => "Idle",
            ActivityState::Running => "Running",
            ActivityState::Jump => "Jump",
            ActivityState::Dancing => "Dancing",
            ActivityState::Waving => "Waving",
        }
    }

    /// Strict parse; anything outside the enumerated names is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    /// Emotes hold the pointer yaw still while active.
    pub fn is_emote(self) -> bool {
        matches!(self, ActivityState::Dancing | ActivityState::Waving)
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AppearanceVariant {
    #[default]
    Female,
    Spiderman,
}

impl AppearanceVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            AppearanceVariant::Female => "female",
            AppearanceVariant::Spiderman => "spiderman",
        }
    }

    /// Lenient parse used at join: unknown skins fall back to the default model.
    pub fn from_name(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "spiderman" => AppearanceVariant::Spiderman,
            _ => AppearanceVariant::Female,
        }
    }
}

/// Options a client supplies once when joining.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinOptions {
    pub display_name: String,
    pub color: String,
    pub appearance: String,
}

impl JoinOptions {
    pub fn new(display_name: &str, color: &str, appearance: &str) -> Self {
        JoinOptions {
            display_name: display_name.to_string(),
            color: color.to_string(),
            appearance: appearance.to_string(),
        }
    }
}

/// Synchronized record of one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: PlayerId,
    pub display_name: String,
    pub color: String,
    pub appearance: AppearanceVariant,
    pub activity: ActivityState,
    pub position: Vec3,
    pub rotation_y: f32,
}

impl Entity {
    /// Builds a freshly joined entity: idle, unrotated, at `position`.
    pub fn spawn(id: PlayerId, options: &JoinOptions, position: Vec3) -> Self {
        Entity {
            id,
            display_name: sanitize_name(&options.display_name),
            color: sanitize_color(&options.color),
            appearance: AppearanceVariant::from_name(&options.appearance),
            activity: ActivityState::Idle,
            position,
            rotation_y: 0.0,
        }
    }
}

fn sanitize_name(name: &str) -> String {
    let name: String = name.trim().chars().take(MAX_NAME_LENGTH).collect();
    if name.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        name
    }
}

/// Accepts `#rrggbb` (case-insensitive), normalized to lowercase.
fn sanitize_color(color: &str) -> String {
    let color = color.trim();
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        color.to_ascii_lowercase()
    } else {
        DEFAULT_COLOR.to_string()
    }
}
