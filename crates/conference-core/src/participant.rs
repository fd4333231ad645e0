//! Participants
//!
//! A participant is one occupant of the conference room, owned exclusively
//! by its conference: its role and region (from presence), its negotiation
//! session, its restart budget, and the bookkeeping for coalesced source
//! signaling.

use crate::config::ConferenceConfig;
use crate::negotiation::SessionMessage;
use crate::rate_limit::RestartRateLimiter;
use crate::source::SourceMap;
use crate::types::{EndpointId, Role, SessionState};
use confocus_xmpp_core::{
    Element, Jid, MediaType, OccupantJid, Presence, StanzaError, TransportDescription,
};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const CONFERENCE_NS: &str = "urn:confocus:conference:1";

/// Member information advertised in an occupant's room presence.
#[derive(Debug, Clone, Default)]
pub struct MemberInfo {
    pub role: Option<Role>,
    pub region: Option<String>,
    pub features: HashSet<String>,
}

impl MemberInfo {
    pub fn from_presence(presence: &Presence) -> Self {
        let Some(info) = presence.extension("member-info", CONFERENCE_NS) else {
            return Self::default();
        };
        let features = info
            .find_child("features")
            .map(|f| {
                f.children()
                    .filter(|c| c.name() == "feature")
                    .filter_map(|c| c.attribute("var"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            role: info.attribute("role").and_then(Role::from_str),
            region: info.attribute("region").map(str::to_string),
            features,
        }
    }

    /// Render as a presence payload. Used by tooling and tests that act as
    /// a participant.
    pub fn to_payload(&self) -> Element {
        let mut el = Element::new("member-info").with_namespace(CONFERENCE_NS);
        if let Some(role) = self.role {
            el = el.attr("role", role.as_str());
        }
        if let Some(region) = &self.region {
            el = el.attr("region", region.clone());
        }
        if !self.features.is_empty() {
            let mut features = Element::new("features");
            let mut vars: Vec<&String> = self.features.iter().collect();
            vars.sort();
            for var in vars {
                features = features.child(Element::new("feature").attr("var", var.clone()));
            }
            el = el.child(features);
        }
        el
    }
}

/// The negotiation dialogue with one participant. A re-invite replaces the
/// whole session; timers and late replies check `sid` before acting.
#[derive(Debug)]
pub struct ParticipantSession {
    pub state: SessionState,
    /// Dialogue id, fresh per (re-)invite.
    pub sid: String,
    /// The allocation this session rides on; control messages quoting a
    /// different id are stale.
    pub bridge_session_id: Option<String>,
    pub bridge: Option<Jid>,
    pub remote_transport: Option<TransportDescription>,
}

impl ParticipantSession {
    /// A fresh pending session.
    pub fn pending() -> Self {
        Self {
            state: SessionState::Pending,
            sid: format!("js-{}", Uuid::new_v4()),
            bridge_session_id: None,
            bridge: None,
            remote_transport: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == SessionState::Pending
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }

    /// Whether a message quoting this bridge session id addresses the
    /// current allocation. Messages without an id are taken at face value.
    pub fn matches_bridge_session(&self, quoted: Option<&str>) -> bool {
        match (quoted, self.bridge_session_id.as_deref()) {
            (Some(quoted), Some(current)) => quoted == current,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

/// One inbound session IQ queued for in-order processing.
pub struct QueuedSessionIq {
    pub message: SessionMessage,
    pub reply: oneshot::Sender<Result<(), StanzaError>>,
}

/// A conference occupant and everything the focus tracks about it.
pub struct Participant {
    pub occupant: OccupantJid,
    pub endpoint_id: EndpointId,
    pub role: Role,
    pub region: Option<String>,
    pub features: HashSet<String>,
    pub session: ParticipantSession,
    pub limiter: RestartRateLimiter,
    /// Remote sources this participant has been told about; flushes diff
    /// the live map against this snapshot.
    pub signaled_sources: SourceMap,
    /// A coalesced flush is already scheduled.
    pub flush_scheduled: bool,
    /// In-order inbound IQ queue feeding this participant's worker task.
    pub iq_tx: mpsc::UnboundedSender<QueuedSessionIq>,
    pub invite_task: Option<JoinHandle<()>>,
    pub accept_timer: Option<JoinHandle<()>>,
}

impl Participant {
    pub fn new(
        occupant: OccupantJid,
        info: &MemberInfo,
        config: &ConferenceConfig,
        iq_tx: mpsc::UnboundedSender<QueuedSessionIq>,
    ) -> Self {
        let endpoint_id = EndpointId::new(occupant.nick());
        Self {
            occupant,
            endpoint_id,
            role: info.role.unwrap_or(Role::Participant),
            region: info.region.clone(),
            features: info.features.clone(),
            session: ParticipantSession::pending(),
            limiter: RestartRateLimiter::new(&config.restart),
            signaled_sources: SourceMap::new(),
            flush_scheduled: false,
            iq_tx,
            invite_task: None,
            accept_timer: None,
        }
    }

    /// Media types this participant negotiates, from its feature set.
    /// Absent feature advertisement means both.
    pub fn media_types(&self) -> Vec<MediaType> {
        let mut media = Vec::new();
        if self.features.is_empty() || self.features.contains("audio") {
            media.push(MediaType::Audio);
        }
        if self.features.is_empty() || self.features.contains("video") {
            media.push(MediaType::Video);
        }
        media
    }

    pub fn supports_sctp(&self) -> bool {
        self.features.contains("sctp")
    }

    /// Update role/region from a presence refresh. Returns true if the role
    /// changed.
    pub fn apply_member_info(&mut self, info: &MemberInfo) -> bool {
        let mut role_changed = false;
        if let Some(role) = info.role {
            role_changed = role != self.role;
            self.role = role;
        }
        if info.region.is_some() {
            self.region = info.region.clone();
        }
        if !info.features.is_empty() {
            self.features = info.features.clone();
        }
        role_changed
    }

    /// Stop every task working on behalf of this participant.
    pub fn abort_tasks(&mut self) {
        if let Some(task) = self.invite_task.take() {
            task.abort();
        }
        if let Some(timer) = self.accept_timer.take() {
            timer.abort();
        }
    }
}

/// Whether sources owned by `owner_role` are signaled at all. Visitors
/// never contribute sources; service roles receive everything, which is
/// already the default for every receiver.
pub fn propagates_sources(owner_role: Role) -> bool {
    owner_role.may_send_sources()
}

#[cfg(test)]
mod tests {
    use super::*;
    use confocus_xmpp_core::Jid;

    fn occupant() -> OccupantJid {
        OccupantJid::new(Jid::parse("r@conf.example/alice").unwrap()).unwrap()
    }

    #[test]
    fn member_info_round_trip() {
        let info = MemberInfo {
            role: Some(Role::Moderator),
            region: Some("us-east".to_string()),
            features: ["audio", "video", "sctp"].iter().map(|s| s.to_string()).collect(),
        };
        let mut presence = Presence::available(occupant().jid().clone());
        presence = presence.with_payload(info.to_payload());
        let parsed = MemberInfo::from_presence(&presence);
        assert_eq!(parsed.role, Some(Role::Moderator));
        assert_eq!(parsed.region.as_deref(), Some("us-east"));
        assert!(parsed.features.contains("sctp"));
    }

    #[test]
    fn media_defaults_to_both_without_features() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let participant = Participant::new(
            occupant(),
            &MemberInfo::default(),
            &ConferenceConfig::default(),
            tx,
        );
        assert_eq!(participant.media_types().len(), 2);
        assert!(!participant.supports_sctp());
        assert_eq!(participant.endpoint_id.as_str(), "alice");
    }

    #[test]
    fn stale_bridge_session_ids_are_detected() {
        let mut session = ParticipantSession::pending();
        session.bridge_session_id = Some("cs-1".to_string());
        assert!(session.matches_bridge_session(Some("cs-1")));
        assert!(session.matches_bridge_session(None));
        assert!(!session.matches_bridge_session(Some("cs-0")));
    }
}
