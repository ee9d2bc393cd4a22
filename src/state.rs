use anyhow::{bail, Context as _, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::answer::KeyScheme;
use crate::backend::BackendClient;
use crate::session::SessionStore;

/// Answer modes the backend understands.
pub const MODES: &[&str] = &["default", "concise", "rookie", "discord"];

/// Discord rate-limits message edits; faster than this gets throttled.
const MIN_EDIT_INTERVAL_MS: u64 = 250;

/// Chat parameters admins can modify at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub mode: String,
    pub key_scheme: KeyScheme,
    /// Minimum time between edits of a streaming answer message.
    pub edit_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            mode: "discord".to_string(),
            key_scheme: KeyScheme::Explicit,
            edit_interval_ms: 1200,
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(mode) = dotenv::var("ANSWER_MODE") {
            if MODES.contains(&mode.as_str()) {
                config.mode = mode;
            } else {
                warn!(mode = %mode, "Unknown ANSWER_MODE, keeping {}", config.mode);
            }
        }
        if let Ok(keys) = dotenv::var("CITATION_KEYS") {
            match keys.parse() {
                Ok(scheme) => config.key_scheme = scheme,
                Err(e) => warn!("Ignoring CITATION_KEYS: {}", e),
            }
        }
        config
    }

    /// Set one parameter from its command-line form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "mode" => {
                if !MODES.contains(&value) {
                    bail!("Unknown mode `{}`. Valid: {}", value, MODES.join(", "));
                }
                self.mode = value.to_string();
            }
            "key_scheme" => self.key_scheme = value.parse()?,
            "edit_interval_ms" => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("`{}` is not a number of milliseconds", value))?;
                if ms < MIN_EDIT_INTERVAL_MS {
                    bail!("`edit_interval_ms` must be at least {}", MIN_EDIT_INTERVAL_MS);
                }
                self.edit_interval_ms = ms;
            }
            _ => bail!(
                "Unknown param `{}`. Valid: `mode`, `key_scheme`, `edit_interval_ms`",
                key
            ),
        }
        Ok(())
    }
}

pub struct AppState {
    pub backend: Arc<BackendClient>,
    pub sessions: Arc<SessionStore>,
    pub admin_ids: HashSet<u64>,
    pub chat_config: Arc<RwLock<ChatConfig>>,
}

impl AppState {
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

pub type Context<'a> = poise::Context<'a, AppState, anyhow::Error>;
