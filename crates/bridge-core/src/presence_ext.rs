//! Brewery presence extension
//!
//! Bridges advertise themselves by publishing presence in a dedicated
//! operator room. The payload carries a vendor element with the version,
//! region, stress, relay id, a graceful-shutdown marker, and a stats id.
//! Older bridges report stress only as a stat inside a `stats` element;
//! that fallback is honoured here.

use confocus_xmpp_core::{Element, Presence};

pub const BREWERY_NS: &str = "urn:confocus:brewery:1";

/// Parsed bridge status from one brewery presence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeStatusExt {
    pub version: Option<String>,
    pub region: Option<String>,
    pub stress: Option<f64>,
    pub relay_id: Option<String>,
    pub graceful_shutdown: bool,
    pub stats_id: Option<String>,
}

impl BridgeStatusExt {
    /// Extract bridge status from a presence stanza. Returns `None` when the
    /// presence carries no vendor element, i.e. the occupant is not a bridge.
    pub fn from_presence(presence: &Presence) -> Option<Self> {
        let vendor = presence.extension("media-bridge", BREWERY_NS)?;
        let mut status = Self {
            version: vendor.attribute("version").map(str::to_string),
            ..Default::default()
        };
        for payload in &presence.payloads {
            status.fold_payload(payload);
        }
        Some(status)
    }

    fn fold_payload(&mut self, el: &Element) {
        match el.name() {
            "region" if el.namespace() == Some(BREWERY_NS) => {
                let region = el.text_content();
                if !region.is_empty() {
                    self.region = Some(region);
                }
            }
            "stress-level" if el.namespace() == Some(BREWERY_NS) => {
                self.stress = parse_stress(&el.text_content());
            }
            "stats" if el.namespace() == Some(BREWERY_NS) => {
                // Fallback for bridges that only report stress as a stat.
                if self.stress.is_none() {
                    self.stress = el
                        .children()
                        .filter(|stat| stat.name() == "stat")
                        .find(|stat| stat.attribute("name") == Some("stress"))
                        .and_then(|stat| stat.attribute("value"))
                        .and_then(parse_stress_str);
                }
            }
            "relay" if el.namespace() == Some(BREWERY_NS) => {
                self.relay_id = el.attribute("id").map(str::to_string);
            }
            "graceful-shutdown" if el.namespace() == Some(BREWERY_NS) => {
                self.graceful_shutdown = true;
            }
            "stats-id" if el.namespace() == Some(BREWERY_NS) => {
                let id = el.text_content();
                if !id.is_empty() {
                    self.stats_id = Some(id);
                }
            }
            _ => {}
        }
    }

    /// Render the status as presence payloads. Used by tests and tooling
    /// that impersonate a bridge.
    pub fn to_payloads(&self) -> Vec<Element> {
        let mut vendor = Element::new("media-bridge").with_namespace(BREWERY_NS);
        if let Some(version) = &self.version {
            vendor = vendor.attr("version", version.clone());
        }
        let mut payloads = vec![vendor];
        if let Some(region) = &self.region {
            payloads.push(
                Element::new("region")
                    .with_namespace(BREWERY_NS)
                    .text(region.clone()),
            );
        }
        if let Some(stress) = self.stress {
            payloads.push(
                Element::new("stress-level")
                    .with_namespace(BREWERY_NS)
                    .text(format!("{}", stress)),
            );
        }
        if let Some(relay_id) = &self.relay_id {
            payloads.push(
                Element::new("relay")
                    .with_namespace(BREWERY_NS)
                    .attr("id", relay_id.clone()),
            );
        }
        if self.graceful_shutdown {
            payloads.push(Element::new("graceful-shutdown").with_namespace(BREWERY_NS));
        }
        if let Some(stats_id) = &self.stats_id {
            payloads.push(
                Element::new("stats-id")
                    .with_namespace(BREWERY_NS)
                    .text(stats_id.clone()),
            );
        }
        payloads
    }
}

fn parse_stress(text: &str) -> Option<f64> {
    parse_stress_str(text)
}

fn parse_stress_str(text: &str) -> Option<f64> {
    let value: f64 = text.trim().parse().ok()?;
    (0.0..=1.0).contains(&value).then_some(value)
}
