//! Per-conference tunables
//!
//! Loaded once at startup as part of the focus configuration and consumed
//! read-only by every conference. Durations default to the values the rest
//! of the core is specified against.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Restart rate-limit parameters (sliding window).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartLimitConfig {
    /// Minimum spacing between two accepted restarts.
    #[serde(with = "duration_secs")]
    pub min_interval: Duration,
    /// Maximum accepted restarts inside one window.
    pub max_requests: usize,
    /// Window length.
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl Default for RestartLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            max_requests: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Inter-bridge relay (mesh) options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OctoConfig {
    /// Whether region diversity may grow the conference onto extra bridges.
    pub enabled: bool,
    /// Opaque mesh identifier carried in relay requests.
    pub mesh_id: String,
}

impl Default for OctoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mesh_id: "0".to_string(),
        }
    }
}

/// Tunables applied to every conference this focus runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    /// Stop if no participant becomes active within this window.
    #[serde(with = "duration_secs")]
    pub start_timeout: Duration,
    /// Stop once a single occupant has been alone this long.
    #[serde(with = "duration_secs")]
    pub single_participant_timeout: Duration,
    /// Stop this long after the last occupant leaves (zero = immediately).
    #[serde(with = "duration_secs")]
    pub empty_timeout: Duration,
    /// How long a pending session may wait for session-accept.
    #[serde(with = "duration_secs")]
    pub session_accept_timeout: Duration,
    /// How long to wait for a bridge to answer an allocation.
    #[serde(with = "duration_secs")]
    pub allocation_timeout: Duration,
    /// Base delay for coalescing source updates before flushing.
    #[serde(with = "duration_millis")]
    pub source_signaling_delay: Duration,
    /// Mute new joiners' audio once this many senders are present.
    pub audio_sender_limit: usize,
    /// Mute new joiners' video once this many senders are present.
    pub video_sender_limit: usize,
    /// Offer an SCTP channel to endpoints that support it.
    pub enable_sctp: bool,
    /// Per-owner source budget.
    pub max_sources_per_owner: usize,
    /// Per-owner group budget.
    pub max_groups_per_owner: usize,
    pub restart: RestartLimitConfig,
    pub octo: OctoConfig,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            single_participant_timeout: Duration::from_secs(120),
            empty_timeout: Duration::ZERO,
            session_accept_timeout: Duration::from_secs(30),
            allocation_timeout: Duration::from_secs(15),
            source_signaling_delay: Duration::from_millis(200),
            audio_sender_limit: 50,
            video_sender_limit: 30,
            enable_sctp: true,
            max_sources_per_owner: 20,
            max_groups_per_owner: 10,
            restart: RestartLimitConfig::default(),
            octo: OctoConfig::default(),
        }
    }
}

impl ConferenceConfig {
    /// Coalescing delay grows with conference size so large rooms batch
    /// more aggressively.
    pub fn flush_delay(&self, participant_count: usize) -> Duration {
        let factor = (participant_count / 50) as u32 + 1;
        self.source_signaling_delay * factor
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}
