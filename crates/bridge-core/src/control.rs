//! Bridge control protocol
//!
//! The control dialogue with a bridge rides on IQ stanzas. Every request
//! names the control session shared by one (conference, bridge) pair;
//! endpoint operations additionally name the endpoint. Replies to endpoint
//! allocation carry the bridge-chosen transport, an optional SCTP port,
//! and any feedback sources the bridge synthesises for itself.

use crate::error::ControlError;
use confocus_xmpp_core::{
    Element, MediaType, Source, SourceGroup, TransportDescription,
};
use tracing::warn;

pub const BRIDGE_NS: &str = "urn:confocus:bridge:1";

/// Parameters for adding or re-adding an endpoint on a bridge.
#[derive(Debug, Clone, Default)]
pub struct EndpointParams {
    pub endpoint_id: String,
    pub media: Vec<MediaType>,
    pub use_sctp: bool,
    pub start_audio_muted: bool,
    pub start_video_muted: bool,
    pub sources: Vec<Source>,
    pub source_groups: Vec<SourceGroup>,
    pub last_n: Option<u32>,
}

/// An endpoint mirrored onto a peer bridge through a relay.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    pub endpoint_id: String,
    pub sources: Vec<Source>,
    pub source_groups: Vec<SourceGroup>,
}

pub fn create_session(session_id: &str, meeting_id: &str) -> Element {
    Element::new("create-session")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("meeting-id", meeting_id)
}

pub fn add_endpoint(session_id: &str, params: &EndpointParams) -> Element {
    let mut el = Element::new("add-endpoint")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("endpoint-id", params.endpoint_id.clone());
    for media in &params.media {
        el = el.child(Element::new("media").attr("type", media.as_str()));
    }
    if params.use_sctp {
        el = el.child(Element::new("sctp"));
    }
    if params.start_audio_muted || params.start_video_muted {
        el = el.child(
            Element::new("muted")
                .attr("audio", params.start_audio_muted.to_string())
                .attr("video", params.start_video_muted.to_string()),
        );
    }
    if let Some(last_n) = params.last_n {
        el = el.child(Element::new("last-n").attr("value", last_n.to_string()));
    }
    el.maybe_child(sources_element(&params.sources, &params.source_groups))
}

pub fn modify_endpoint(
    session_id: &str,
    endpoint_id: &str,
    transport: Option<&TransportDescription>,
    sources: Option<(&[Source], &[SourceGroup])>,
    last_n: Option<u32>,
) -> Element {
    let mut el = Element::new("modify-endpoint")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("endpoint-id", endpoint_id);
    if let Some(transport) = transport {
        el = el.child(transport.to_element());
    }
    if let Some((sources, groups)) = sources {
        // An explicit empty sources element clears the endpoint's sources.
        el = el.child(sources_element(sources, groups).unwrap_or_else(|| {
            Element::new("sources").with_namespace(BRIDGE_NS)
        }));
    }
    if let Some(last_n) = last_n {
        el = el.child(Element::new("last-n").attr("value", last_n.to_string()));
    }
    el
}

pub fn expire_endpoint(session_id: &str, endpoint_id: &str) -> Element {
    Element::new("expire-endpoint")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("endpoint-id", endpoint_id)
}

pub fn create_relay(
    session_id: &str,
    relay_id: &str,
    mesh_id: &str,
    endpoints: &[RelayEndpoint],
) -> Element {
    let mut el = Element::new("create-relay")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("relay-id", relay_id)
        .attr("mesh-id", mesh_id);
    for endpoint in endpoints {
        el = el.child(relay_endpoint_element(endpoint));
    }
    el
}

pub fn modify_relay(
    session_id: &str,
    relay_id: &str,
    add: &[RelayEndpoint],
    remove: &[String],
) -> Element {
    let mut el = Element::new("modify-relay")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("relay-id", relay_id);
    for endpoint in add {
        el = el.child(relay_endpoint_element(endpoint));
    }
    for endpoint_id in remove {
        el = el.child(Element::new("remove-endpoint").attr("id", endpoint_id.clone()));
    }
    el
}

pub fn expire_relay(session_id: &str, relay_id: &str) -> Element {
    Element::new("expire-relay")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
        .attr("relay-id", relay_id)
}

pub fn expire_session(session_id: &str) -> Element {
    Element::new("expire-session")
        .with_namespace(BRIDGE_NS)
        .attr("session-id", session_id)
}

fn relay_endpoint_element(endpoint: &RelayEndpoint) -> Element {
    Element::new("endpoint")
        .attr("id", endpoint.endpoint_id.clone())
        .maybe_child(sources_element(&endpoint.sources, &endpoint.source_groups))
}

fn sources_element(sources: &[Source], groups: &[SourceGroup]) -> Option<Element> {
    if sources.is_empty() && groups.is_empty() {
        return None;
    }
    let mut el = Element::new("sources").with_namespace(BRIDGE_NS);
    for source in sources {
        el = el.child(source.to_element());
    }
    for group in groups {
        el = el.child(group.to_element());
    }
    Some(el)
}

/// The bridge's answer to an add-endpoint request.
#[derive(Debug, Clone, Default)]
pub struct EndpointAllocation {
    pub endpoint_id: String,
    pub transport: TransportDescription,
    pub sctp_port: Option<u16>,
    /// Sources the bridge contributes on its own behalf (e.g. for audio
    /// level feedback). Entries without a media type are a bridge-side bug
    /// and are dropped with a warning at parse time.
    pub feedback_sources: Vec<Source>,
}

impl EndpointAllocation {
    pub fn to_element(&self) -> Element {
        let mut el = Element::new("allocation")
            .with_namespace(BRIDGE_NS)
            .attr("endpoint-id", self.endpoint_id.clone())
            .child(self.transport.to_element());
        if let Some(port) = self.sctp_port {
            el = el.child(Element::new("sctp").attr("port", port.to_string()));
        }
        if !self.feedback_sources.is_empty() {
            let mut feedback = Element::new("feedback-sources");
            for source in &self.feedback_sources {
                feedback = feedback.child(source.to_element());
            }
            el = el.child(feedback);
        }
        el
    }

    /// Parse an allocation reply payload.
    pub fn from_element(el: &Element) -> Result<Self, ControlError> {
        if el.name() != "allocation" {
            return Err(ControlError::MalformedResponse(format!(
                "expected allocation, got {}",
                el.name()
            )));
        }
        let endpoint_id = el
            .attribute("endpoint-id")
            .ok_or_else(|| ControlError::MalformedResponse("allocation without endpoint-id".into()))?
            .to_string();
        let transport = el
            .find_child("transport")
            .map(TransportDescription::from_element)
            .ok_or_else(|| ControlError::MalformedResponse("allocation without transport".into()))?;
        let sctp_port = el
            .find_child("sctp")
            .and_then(|sctp| sctp.attribute("port"))
            .and_then(|port| port.parse().ok());
        let mut feedback_sources = Vec::new();
        if let Some(feedback) = el.find_child("feedback-sources") {
            for child in feedback.children() {
                match Source::from_element(child) {
                    Some(source) => feedback_sources.push(source),
                    None => warn!(
                        "dropping bridge feedback source without a media type (endpoint {})",
                        endpoint_id
                    ),
                }
            }
        }
        Ok(Self {
            endpoint_id,
            transport,
            sctp_port,
            feedback_sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confocus_xmpp_core::{MediaType, Ssrc};

    #[test]
    fn add_endpoint_request_shape() {
        let params = EndpointParams {
            endpoint_id: "alice".to_string(),
            media: vec![MediaType::Audio, MediaType::Video],
            use_sctp: true,
            start_audio_muted: true,
            ..Default::default()
        };
        let el = add_endpoint("s1", &params);
        assert_eq!(el.name(), "add-endpoint");
        assert_eq!(el.attribute("session-id"), Some("s1"));
        assert_eq!(el.attribute("endpoint-id"), Some("alice"));
        assert_eq!(el.children().filter(|c| c.name() == "media").count(), 2);
        assert!(el.find_child("sctp").is_some());
        assert_eq!(el.find_child("muted").unwrap().attribute("audio"), Some("true"));
    }

    #[test]
    fn allocation_round_trip() {
        let allocation = EndpointAllocation {
            endpoint_id: "alice".to_string(),
            transport: TransportDescription {
                ufrag: Some("u1".to_string()),
                pwd: Some("p1".to_string()),
                ..Default::default()
            },
            sctp_port: Some(5000),
            feedback_sources: vec![Source::new(Ssrc(99), MediaType::Audio)],
        };
        let parsed = EndpointAllocation::from_element(&allocation.to_element()).unwrap();
        assert_eq!(parsed.endpoint_id, "alice");
        assert_eq!(parsed.sctp_port, Some(5000));
        assert_eq!(parsed.feedback_sources.len(), 1);
    }

    #[test]
    fn feedback_source_without_media_type_is_dropped() {
        let el = Element::new("allocation")
            .with_namespace(BRIDGE_NS)
            .attr("endpoint-id", "alice")
            .child(TransportDescription::default().to_element())
            .child(
                Element::new("feedback-sources")
                    .child(Element::new("source").attr("ssrc", "99")),
            );
        let parsed = EndpointAllocation::from_element(&el).unwrap();
        assert!(parsed.feedback_sources.is_empty());
    }

    #[test]
    fn malformed_allocation_is_rejected() {
        let el = Element::new("allocation").with_namespace(BRIDGE_NS);
        assert!(EndpointAllocation::from_element(&el).is_err());
    }
}
