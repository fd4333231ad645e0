//! Core conference types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a participant inside a conference: the resource
/// component of its occupant address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, stable identifier of a conference instance, independent of the
/// room address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeetingId(pub String);

impl MeetingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an occupant is to the conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Moderator,
    Participant,
    Visitor,
    Recorder,
    Transcriber,
    Gateway,
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "moderator" => Role::Moderator,
            "participant" => Role::Participant,
            "visitor" => Role::Visitor,
            "recorder" => Role::Recorder,
            "transcriber" => Role::Transcriber,
            "gateway" => Role::Gateway,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Moderator => "moderator",
            Role::Participant => "participant",
            Role::Visitor => "visitor",
            Role::Recorder => "recorder",
            Role::Transcriber => "transcriber",
            Role::Gateway => "gateway",
        }
    }

    /// Service roles receive every stream regardless of other filtering.
    pub fn receives_all_sources(&self) -> bool {
        matches!(self, Role::Recorder | Role::Transcriber | Role::Gateway)
    }

    /// Visitors consume but never contribute sources.
    pub fn may_send_sources(&self) -> bool {
        !matches!(self, Role::Visitor)
    }

    /// Whether this occupant counts towards the muted-on-join thresholds.
    pub fn counts_as_sender(&self) -> bool {
        matches!(self, Role::Moderator | Role::Participant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Negotiation state of one participant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Offer sent, waiting for session-accept.
    Pending,
    /// Accept received; source signaling flows.
    Active,
    /// Terminated. No further IO for this session.
    Ended,
}

/// Properties a conference is created with (from an admin request or the
/// first join).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConferenceProperties {
    /// Pin allocation to bridges of this version.
    pub pinned_bridge_version: Option<String>,
    /// Reuse an externally minted meeting id.
    pub meeting_id: Option<String>,
    /// Whether this conference contributes to aggregate statistics.
    pub include_in_stats: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for role in [
            Role::Moderator,
            Role::Participant,
            Role::Visitor,
            Role::Recorder,
            Role::Transcriber,
            Role::Gateway,
        ] {
            assert_eq!(Role::from_str(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_str("owner"), None);
    }

    #[test]
    fn visitors_do_not_send() {
        assert!(!Role::Visitor.may_send_sources());
        assert!(Role::Participant.may_send_sources());
        assert!(Role::Recorder.receives_all_sources());
    }
}
