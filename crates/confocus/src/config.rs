//! Focus configuration
//!
//! The rooted configuration tree read once at startup. Everything the core
//! consumes at runtime is plain data here; unknown keys are rejected so a
//! typo fails fast instead of silently using a default.

use confocus_conference_core::ConferenceConfig;
use serde::Deserialize;
use std::path::Path;

/// Chat-service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XmppConfig {
    /// Address of the local stanza stream the focus attaches to.
    pub server_addr: String,
    /// Full JID the focus identifies as.
    pub focus_jid: String,
    /// Nick the focus occupies conference rooms under.
    #[serde(default = "default_focus_nick")]
    pub focus_nick: String,
    /// Operator room where bridges advertise themselves.
    pub brewery_room: String,
    /// Operator rooms for gateway workers (recorders, transcribers), one
    /// detector each.
    #[serde(default)]
    pub worker_rooms: Vec<String>,
}

fn default_focus_nick() -> String {
    "focus".to_string()
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "confocus=debug,info".
    pub filter: Option<String>,
    pub json: bool,
}

/// Shutdown settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ShutdownConfig {
    /// Bounded grace period for draining conferences, in seconds.
    pub grace_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_seconds: 10 }
    }
}

/// The rooted configuration tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FocusConfig {
    pub xmpp: XmppConfig,
    #[serde(default)]
    pub conference: ConferenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl FocusConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        let config: FocusConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse {}: {}", path.display(), e))?;
        Ok(config)
    }
}
