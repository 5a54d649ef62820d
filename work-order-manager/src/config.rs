//! Engine tunables
//!
//! The rework/escalation bounds are deliberate configuration constants, not
//! inferred values; deployments override them through the environment.

use std::path::PathBuf;

/// Environment variable overriding the rework loopback bound.
pub const ENV_MAX_REWORK_LOOPBACKS: &str = "WO_MAX_REWORK_LOOPBACKS";
/// Environment variable overriding the per-story verification retry bound.
pub const ENV_MAX_STORY_RETRIES: &str = "WO_MAX_STORY_RETRIES";
/// Environment variable overriding the coordinator notification channel.
pub const ENV_COORDINATOR_CHANNEL: &str = "WO_COORDINATOR_CHANNEL";

/// Engine configuration with compiled defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many review-gate rejections a stage may loop back for before the
    /// work order escalates and blocks.
    pub max_rework_loopbacks: u32,
    /// How many times one story's build may be retried after a failed
    /// verification before the loop escalates.
    pub max_story_retries: u32,
    /// Channel the single "work order complete" notification goes to.
    pub coordinator_channel: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rework_loopbacks: 3,
            max_story_retries: 2,
            coordinator_channel: "coordinator".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied. Unparseable values fall
    /// back to the default rather than failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_u32(ENV_MAX_REWORK_LOOPBACKS) {
            config.max_rework_loopbacks = n;
        }
        if let Some(n) = env_u32(ENV_MAX_STORY_RETRIES) {
            config.max_story_retries = n;
        }
        if let Ok(channel) = std::env::var(ENV_COORDINATOR_CHANNEL) {
            if !channel.is_empty() {
                config.coordinator_channel = channel;
            }
        }
        config
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Default on-disk database location (`~/.work-order-manager/work-orders.db`).
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".work-order-manager")
        .join("work-orders.db")
}
