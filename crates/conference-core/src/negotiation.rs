//! Session negotiation messages
//!
//! The offer/answer dialogue with participants rides on IQ stanzas whose
//! payload is a session element carrying an action, per-media contents,
//! and bookkeeping extensions (bundle grouping, the owning bridge session,
//! mute-on-join hints, termination reasons).

use crate::source::{EndpointSourceSet, SourceMap};
use confocus_xmpp_core::{Element, MediaType, TransportDescription};

pub const JINGLE_NS: &str = "urn:confocus:jingle:1";

/// Actions the negotiation dialogue understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JingleAction {
    SessionInitiate,
    SessionAccept,
    SessionInfo,
    SessionTerminate,
    TransportInfo,
    TransportReplace,
    TransportAccept,
    TransportReject,
    SourceAdd,
    SourceRemove,
}

impl JingleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JingleAction::SessionInitiate => "session-initiate",
            JingleAction::SessionAccept => "session-accept",
            JingleAction::SessionInfo => "session-info",
            JingleAction::SessionTerminate => "session-terminate",
            JingleAction::TransportInfo => "transport-info",
            JingleAction::TransportReplace => "transport-replace",
            JingleAction::TransportAccept => "transport-accept",
            JingleAction::TransportReject => "transport-reject",
            JingleAction::SourceAdd => "source-add",
            JingleAction::SourceRemove => "source-remove",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "session-initiate" => JingleAction::SessionInitiate,
            "session-accept" => JingleAction::SessionAccept,
            "session-info" => JingleAction::SessionInfo,
            "session-terminate" => JingleAction::SessionTerminate,
            "transport-info" => JingleAction::TransportInfo,
            "transport-replace" => JingleAction::TransportReplace,
            "transport-accept" => JingleAction::TransportAccept,
            "transport-reject" => JingleAction::TransportReject,
            "source-add" => JingleAction::SourceAdd,
            "source-remove" => JingleAction::SourceRemove,
            _ => return None,
        })
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    Success,
    Cancel,
    ConnectivityError,
    Expired,
    FailedApplication,
    Gone,
}

impl TerminateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminateReason::Success => "success",
            TerminateReason::Cancel => "cancel",
            TerminateReason::ConnectivityError => "connectivity-error",
            TerminateReason::Expired => "expired",
            TerminateReason::FailedApplication => "failed-application",
            TerminateReason::Gone => "gone",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "success" => TerminateReason::Success,
            "cancel" => TerminateReason::Cancel,
            "connectivity-error" => TerminateReason::ConnectivityError,
            "expired" => TerminateReason::Expired,
            "failed-application" => TerminateReason::FailedApplication,
            "gone" => TerminateReason::Gone,
            _ => return None,
        })
    }
}

/// One per-media-type slice of an offer or answer.
#[derive(Debug, Clone, Default)]
pub struct Content {
    pub media_type: Option<MediaType>,
    pub sources: EndpointSourceSet,
    pub transport: Option<TransportDescription>,
    pub sctp_port: Option<u16>,
}

/// A parsed session payload, independent of stanza plumbing.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub action: JingleAction,
    /// Negotiation dialogue id, chosen by the focus at invite time.
    pub sid: String,
    pub contents: Vec<Content>,
    /// Names the allocation this message refers to; mismatches mean the
    /// message is stale and must be ignored.
    pub bridge_session_id: Option<String>,
    /// Bundle grouping: all content names share one transport.
    pub bundle: bool,
    /// session-info: the participant's ICE connection failed.
    pub ice_failed: bool,
    /// session-terminate: the participant asks for a fresh session.
    pub restart: bool,
    pub reason: Option<TerminateReason>,
    /// Mute-on-join hints carried in offers.
    pub start_audio_muted: bool,
    pub start_video_muted: bool,
}

impl SessionMessage {
    pub fn new(action: JingleAction, sid: impl Into<String>) -> Self {
        Self {
            action,
            sid: sid.into(),
            contents: Vec::new(),
            bridge_session_id: None,
            bundle: false,
            ice_failed: false,
            restart: false,
            reason: None,
            start_audio_muted: false,
            start_video_muted: false,
        }
    }

    /// All sources across contents, merged.
    pub fn merged_sources(&self) -> EndpointSourceSet {
        let mut merged = EndpointSourceSet::new();
        for content in &self.contents {
            merged.extend(&content.sources);
        }
        merged
    }

    /// First transport found in any content (bundled sessions carry one).
    pub fn transport(&self) -> Option<&TransportDescription> {
        self.contents.iter().find_map(|c| c.transport.as_ref())
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("session")
            .with_namespace(JINGLE_NS)
            .attr("action", self.action.as_str())
            .attr("sid", self.sid.clone());
        if let Some(id) = &self.bridge_session_id {
            el = el.child(Element::new("bridge-session").attr("id", id.clone()));
        }
        for content in &self.contents {
            let name = content
                .media_type
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "data".to_string());
            let mut content_el = Element::new("content").attr("name", name);
            if let Some(media_type) = content.media_type {
                content_el = content_el.attr("media", media_type.as_str());
            }
            for source_el in content.sources.to_elements() {
                content_el = content_el.child(source_el);
            }
            if let Some(transport) = &content.transport {
                content_el = content_el.child(transport.to_element());
            }
            if let Some(port) = content.sctp_port {
                content_el = content_el.child(Element::new("sctp").attr("port", port.to_string()));
            }
            el = el.child(content_el);
        }
        if self.bundle {
            let mut group = Element::new("group").attr("semantics", "BUNDLE");
            for content in &self.contents {
                let name = content
                    .media_type
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "data".to_string());
                group = group.child(Element::new("content").attr("name", name));
            }
            el = el.child(group);
        }
        if self.ice_failed {
            el = el.child(Element::new("ice-state").text("failed"));
        }
        if self.restart {
            el = el.child(Element::new("restart"));
        }
        if let Some(reason) = self.reason {
            el = el.child(Element::new("reason").child(Element::new(reason.as_str())));
        }
        if self.start_audio_muted || self.start_video_muted {
            el = el.child(
                Element::new("start-muted")
                    .attr("audio", self.start_audio_muted.to_string())
                    .attr("video", self.start_video_muted.to_string()),
            );
        }
        el
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        if el.name() != "session" || el.namespace() != Some(JINGLE_NS) {
            return None;
        }
        let action = JingleAction::from_str(el.attribute("action")?)?;
        let mut message = SessionMessage::new(action, el.attribute("sid").unwrap_or_default());
        message.bridge_session_id = el
            .find_child("bridge-session")
            .and_then(|b| b.attribute("id"))
            .map(str::to_string);
        for content_el in el.children().filter(|c| c.name() == "content") {
            let media_type = content_el.attribute("media").and_then(MediaType::from_str);
            let sources = EndpointSourceSet::from_elements(content_el.children());
            let transport = content_el
                .find_child("transport")
                .map(TransportDescription::from_element);
            let sctp_port = content_el
                .find_child("sctp")
                .and_then(|s| s.attribute("port"))
                .and_then(|p| p.parse().ok());
            message.contents.push(Content {
                media_type,
                sources,
                transport,
                sctp_port,
            });
        }
        message.bundle = el
            .children()
            .any(|c| c.name() == "group" && c.attribute("semantics") == Some("BUNDLE"));
        message.ice_failed = el
            .find_child("ice-state")
            .map(|s| s.text_content() == "failed")
            .unwrap_or(false);
        message.restart = el.find_child("restart").is_some();
        message.reason = el
            .find_child("reason")
            .and_then(|r| r.children().next())
            .and_then(|c| TerminateReason::from_str(c.name()));
        if let Some(muted) = el.find_child("start-muted") {
            message.start_audio_muted = muted.attribute("audio") == Some("true");
            message.start_video_muted = muted.attribute("video") == Some("true");
        }
        Some(message)
    }
}

/// Render an owner-attributed source map as per-media contents, the shape
/// fan-out IQs carry.
pub fn source_map_contents(map: &SourceMap) -> Vec<Content> {
    let mut contents = Vec::new();
    for media_type in [MediaType::Audio, MediaType::Video] {
        let mut merged = EndpointSourceSet::new();
        for (owner, set) in map.iter() {
            let slice = set.strip_by_media_type(media_type);
            for source in slice.sources {
                merged.sources.insert(source.with_owner(owner.as_str()));
            }
            merged.groups.extend(slice.groups);
        }
        if !merged.is_empty() {
            contents.push(Content {
                media_type: Some(media_type),
                sources: merged,
                transport: None,
                sctp_port: None,
            });
        }
    }
    contents
}
