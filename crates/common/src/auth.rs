//! Write permission derived from the room's power levels
//!
//! A mount may write when the local user's power level reaches the level
//! required to send a path record. Both sides fall back to the room-wide
//! defaults, and those fall back to the configured defaults when the room
//! does not carry them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Content of the room's power-levels state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_default: Option<i64>,
    #[serde(default)]
    pub events: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_default: Option<i64>,
}

/// Levels assumed when the room leaves them unspecified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDefaults {
    pub user_level: i64,
    pub state_level: i64,
}

impl Default for AuthDefaults {
    fn default() -> Self {
        Self {
            user_level: 0,
            state_level: 50,
        }
    }
}

impl PowerLevels {
    pub fn user_level(&self, user: &str, defaults: &AuthDefaults) -> i64 {
        self.users
            .get(user)
            .copied()
            .or(self.users_default)
            .unwrap_or(defaults.user_level)
    }

    pub fn required_level(&self, event_type: &str, defaults: &AuthDefaults) -> i64 {
        self.events
            .get(event_type)
            .copied()
            .or(self.state_default)
            .unwrap_or(defaults.state_level)
    }

    pub fn can_send(&self, user: &str, event_type: &str, defaults: &AuthDefaults) -> bool {
        self.user_level(user, defaults) >= self.required_level(event_type, defaults)
    }
}

/// The current answer to "may this mount write?"
///
/// Starts closed; opened or closed again whenever power levels arrive.
#[derive(Debug, Default)]
pub struct WriteGate {
    allowed: AtomicBool,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    /// Update the gate; returns the previous value
    pub fn set(&self, allowed: bool) -> bool {
        self.allowed.swap(allowed, Ordering::SeqCst)
    }
}
