//! Transport descriptions
//!
//! The ICE/DTLS parameters exchanged in signaling: the bridge chooses them
//! at allocation time, the focus copies them into the participant's offer,
//! and the participant answers with its own. The focus treats the contents
//! as opaque beyond addressing and identity.

use crate::element::Element;
use std::fmt;

pub const TRANSPORT_NS: &str = "urn:confocus:transport:1";

/// One ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: String,
    pub ip: String,
    pub port: u16,
    pub candidate_type: String,
    pub priority: u32,
}

impl IceCandidate {
    pub fn to_element(&self) -> Element {
        Element::new("candidate")
            .attr("foundation", self.foundation.clone())
            .attr("component", self.component.to_string())
            .attr("protocol", self.protocol.clone())
            .attr("ip", self.ip.clone())
            .attr("port", self.port.to_string())
            .attr("type", self.candidate_type.clone())
            .attr("priority", self.priority.to_string())
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            foundation: el.attribute("foundation")?.to_string(),
            component: el.attribute("component")?.parse().ok()?,
            protocol: el.attribute("protocol")?.to_string(),
            ip: el.attribute("ip")?.to_string(),
            port: el.attribute("port")?.parse().ok()?,
            candidate_type: el.attribute("type")?.to_string(),
            priority: el.attribute("priority")?.parse().ok()?,
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {}/{}",
            self.ip, self.port, self.protocol, self.candidate_type
        )
    }
}

/// ICE credentials, DTLS identity, and candidates for one media path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportDescription {
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    /// DTLS fingerprint, hash name in `fingerprint_hash`.
    pub fingerprint: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub candidates: Vec<IceCandidate>,
}

impl TransportDescription {
    pub fn to_element(&self) -> Element {
        let mut el = Element::new("transport").with_namespace(TRANSPORT_NS);
        if let Some(ufrag) = &self.ufrag {
            el = el.attr("ufrag", ufrag.clone());
        }
        if let Some(pwd) = &self.pwd {
            el = el.attr("pwd", pwd.clone());
        }
        if let Some(fingerprint) = &self.fingerprint {
            let mut fp = Element::new("fingerprint").text(fingerprint.clone());
            if let Some(hash) = &self.fingerprint_hash {
                fp = fp.attr("hash", hash.clone());
            }
            el = el.child(fp);
        }
        for candidate in &self.candidates {
            el = el.child(candidate.to_element());
        }
        el
    }

    pub fn from_element(el: &Element) -> Self {
        let fingerprint_el = el.find_child("fingerprint");
        Self {
            ufrag: el.attribute("ufrag").map(str::to_string),
            pwd: el.attribute("pwd").map(str::to_string),
            fingerprint: fingerprint_el.map(|fp| fp.text_content()),
            fingerprint_hash: fingerprint_el
                .and_then(|fp| fp.attribute("hash"))
                .map(str::to_string),
            candidates: el
                .children()
                .filter(|c| c.name() == "candidate")
                .filter_map(IceCandidate::from_element)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_round_trip() {
        let transport = TransportDescription {
            ufrag: Some("u1".to_string()),
            pwd: Some("p1".to_string()),
            fingerprint: Some("AA:BB:CC".to_string()),
            fingerprint_hash: Some("sha-256".to_string()),
            candidates: vec![IceCandidate {
                foundation: "1".to_string(),
                component: 1,
                protocol: "udp".to_string(),
                ip: "198.51.100.7".to_string(),
                port: 10000,
                candidate_type: "host".to_string(),
                priority: 2130706431,
            }],
        };
        let parsed = TransportDescription::from_element(&transport.to_element());
        assert_eq!(parsed, transport);
    }
}
