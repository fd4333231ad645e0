//! Stanza model
//!
//! The three stanza kinds the focus exchanges with the chat service, plus
//! the stanza-level error descriptor. Payloads are [`Element`] trees; the
//! concrete wire framing is the transport's concern.

use crate::element::Element;
use crate::error::XmppError;
use crate::jid::Jid;
use std::fmt;

/// IQ type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// Stanza error class, mirroring the `type` attribute of an error element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Cancel,
    Modify,
    Wait,
    Auth,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Cancel => "cancel",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
            ErrorType::Auth => "auth",
        }
    }
}

/// The defined error conditions. These are the only errors that cross the
/// signaling boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    BadRequest,
    FeatureNotImplemented,
    ItemNotFound,
    ServiceUnavailable,
    UnexpectedRequest,
    ResourceConstraint,
    Forbidden,
    InternalServerError,
}

impl ErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCondition::BadRequest => "bad-request",
            ErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            ErrorCondition::ItemNotFound => "item-not-found",
            ErrorCondition::ServiceUnavailable => "service-unavailable",
            ErrorCondition::UnexpectedRequest => "unexpected-request",
            ErrorCondition::ResourceConstraint => "resource-constraint",
            ErrorCondition::Forbidden => "forbidden",
            ErrorCondition::InternalServerError => "internal-server-error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "bad-request" => ErrorCondition::BadRequest,
            "feature-not-implemented" => ErrorCondition::FeatureNotImplemented,
            "item-not-found" => ErrorCondition::ItemNotFound,
            "service-unavailable" => ErrorCondition::ServiceUnavailable,
            "unexpected-request" => ErrorCondition::UnexpectedRequest,
            "resource-constraint" => ErrorCondition::ResourceConstraint,
            "forbidden" => ErrorCondition::Forbidden,
            "internal-server-error" => ErrorCondition::InternalServerError,
            _ => return None,
        })
    }

    /// The conventional error class for this condition.
    pub fn default_type(&self) -> ErrorType {
        match self {
            ErrorCondition::BadRequest | ErrorCondition::UnexpectedRequest => ErrorType::Modify,
            ErrorCondition::ResourceConstraint => ErrorType::Wait,
            ErrorCondition::Forbidden => ErrorType::Auth,
            _ => ErrorType::Cancel,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const STANZAS_NS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// A stanza-level error descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: ErrorCondition,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(condition: ErrorCondition) -> Self {
        Self {
            error_type: condition.default_type(),
            condition,
            text: None,
        }
    }

    pub fn with_text(condition: ErrorCondition, text: impl Into<String>) -> Self {
        Self {
            error_type: condition.default_type(),
            condition,
            text: Some(text.into()),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("error")
            .attr("type", self.error_type.as_str())
            .child(Element::new(self.condition.as_str()).with_namespace(STANZAS_NS));
        if let Some(text) = &self.text {
            el = el.child(
                Element::new("text")
                    .with_namespace(STANZAS_NS)
                    .text(text.clone()),
            );
        }
        el
    }

    pub fn from_element(el: &Element) -> Option<Self> {
        let condition = el
            .children()
            .filter(|c| c.name() != "text")
            .find_map(|c| ErrorCondition::from_str(c.name()))?;
        let text = el
            .find_child("text")
            .map(|t| t.text_content())
            .filter(|t| !t.is_empty());
        let error_type = match el.attribute("type") {
            Some("modify") => ErrorType::Modify,
            Some("wait") => ErrorType::Wait,
            Some("auth") => ErrorType::Auth,
            _ => ErrorType::Cancel,
        };
        Some(Self {
            error_type,
            condition,
            text,
        })
    }
}

/// An info/query stanza: the request/response workhorse.
#[derive(Debug, Clone)]
pub struct Iq {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub id: String,
    pub iq_type: IqType,
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
}

impl Iq {
    /// A request IQ of type `set` with the given payload.
    pub fn set(to: Jid, payload: Element) -> Self {
        Self {
            to: Some(to),
            from: None,
            id: String::new(),
            iq_type: IqType::Set,
            payload: Some(payload),
            error: None,
        }
    }

    /// A request IQ of type `get` with the given payload.
    pub fn get(to: Jid, payload: Element) -> Self {
        Self {
            to: Some(to),
            from: None,
            id: String::new(),
            iq_type: IqType::Get,
            payload: Some(payload),
            error: None,
        }
    }

    /// Empty `result` reply to this request.
    pub fn result_reply(&self) -> Iq {
        self.reply_with(None)
    }

    /// `result` reply carrying a payload.
    pub fn result_reply_with(&self, payload: Element) -> Iq {
        self.reply_with(Some(payload))
    }

    fn reply_with(&self, payload: Option<Element>) -> Iq {
        Iq {
            to: self.from.clone(),
            from: self.to.clone(),
            id: self.id.clone(),
            iq_type: IqType::Result,
            payload,
            error: None,
        }
    }

    /// `error` reply to this request. The original payload is echoed back.
    pub fn error_reply(&self, error: StanzaError) -> Iq {
        Iq {
            to: self.from.clone(),
            from: self.to.clone(),
            id: self.id.clone(),
            iq_type: IqType::Error,
            payload: self.payload.clone(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.iq_type == IqType::Error
    }

    /// The error condition carried by an error reply, if any.
    pub fn error_condition(&self) -> Option<ErrorCondition> {
        self.error.as_ref().map(|e| e.condition)
    }

    /// Payload key used for handler routing: (child name, namespace).
    pub fn payload_key(&self) -> Option<(&str, &str)> {
        let payload = self.payload.as_ref()?;
        Some((payload.name(), payload.namespace()?))
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("iq").attr("type", self.iq_type.as_str());
        if !self.id.is_empty() {
            el = el.attr("id", self.id.clone());
        }
        if let Some(to) = &self.to {
            el = el.attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            el = el.attr("from", from.to_string());
        }
        if let Some(payload) = &self.payload {
            el = el.child(payload.clone());
        }
        if let Some(error) = &self.error {
            el = el.child(error.to_element());
        }
        el
    }

    pub fn from_element(el: &Element) -> Result<Iq, XmppError> {
        if el.name() != "iq" {
            return Err(XmppError::MalformedStanza(format!(
                "expected iq, got {}",
                el.name()
            )));
        }
        let iq_type = match el.attribute("type") {
            Some("get") => IqType::Get,
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            other => {
                return Err(XmppError::MalformedStanza(format!(
                    "bad iq type {:?}",
                    other
                )))
            }
        };
        let to = el.attribute("to").map(Jid::parse).transpose()?;
        let from = el.attribute("from").map(Jid::parse).transpose()?;
        let error = el.find_child("error").and_then(StanzaError::from_element);
        let payload = el.children().find(|c| c.name() != "error").cloned();
        Ok(Iq {
            to,
            from,
            id: el.attribute("id").unwrap_or_default().to_string(),
            iq_type,
            payload,
            error,
        })
    }
}

/// Presence availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
}

/// A presence stanza with extension payloads.
#[derive(Debug, Clone)]
pub struct Presence {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub presence_type: PresenceType,
    pub payloads: Vec<Element>,
}

impl Presence {
    pub fn available(to: Jid) -> Self {
        Self {
            to: Some(to),
            from: None,
            presence_type: PresenceType::Available,
            payloads: Vec::new(),
        }
    }

    pub fn unavailable(to: Jid) -> Self {
        Self {
            to: Some(to),
            from: None,
            presence_type: PresenceType::Unavailable,
            payloads: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// First extension payload with the given name and namespace.
    pub fn extension(&self, name: &str, ns: &str) -> Option<&Element> {
        self.payloads
            .iter()
            .find(|el| el.name() == name && el.namespace() == Some(ns))
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("presence");
        if self.presence_type == PresenceType::Unavailable {
            el = el.attr("type", "unavailable");
        }
        if let Some(to) = &self.to {
            el = el.attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            el = el.attr("from", from.to_string());
        }
        for payload in &self.payloads {
            el = el.child(payload.clone());
        }
        el
    }

    pub fn from_element(el: &Element) -> Result<Presence, XmppError> {
        if el.name() != "presence" {
            return Err(XmppError::MalformedStanza(format!(
                "expected presence, got {}",
                el.name()
            )));
        }
        let presence_type = match el.attribute("type") {
            Some("unavailable") => PresenceType::Unavailable,
            _ => PresenceType::Available,
        };
        Ok(Presence {
            to: el.attribute("to").map(Jid::parse).transpose()?,
            from: el.attribute("from").map(Jid::parse).transpose()?,
            presence_type,
            payloads: el.children().cloned().collect(),
        })
    }
}

/// A directed message stanza.
#[derive(Debug, Clone)]
pub struct Message {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub body: Option<String>,
    pub payloads: Vec<Element>,
}

impl Message {
    pub fn from_element(el: &Element) -> Result<Message, XmppError> {
        if el.name() != "message" {
            return Err(XmppError::MalformedStanza(format!(
                "expected message, got {}",
                el.name()
            )));
        }
        Ok(Message {
            to: el.attribute("to").map(Jid::parse).transpose()?,
            from: el.attribute("from").map(Jid::parse).transpose()?,
            body: el.find_child("body").map(|b| b.text_content()),
            payloads: el
                .children()
                .filter(|c| c.name() != "body")
                .cloned()
                .collect(),
        })
    }
}

/// Any stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    Iq(Iq),
    Presence(Presence),
    Message(Message),
}

impl Stanza {
    /// Parse any stanza from its element form.
    pub fn from_element(el: &Element) -> Result<Stanza, XmppError> {
        match el.name() {
            "iq" => Ok(Stanza::Iq(Iq::from_element(el)?)),
            "presence" => Ok(Stanza::Presence(Presence::from_element(el)?)),
            "message" => Ok(Stanza::Message(Message::from_element(el)?)),
            other => Err(XmppError::MalformedStanza(format!(
                "unknown stanza {}",
                other
            ))),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Iq(iq) => iq.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
            Stanza::Message(message) => {
                let mut el = Element::new("message");
                if let Some(to) = &message.to {
                    el = el.attr("to", to.to_string());
                }
                if let Some(from) = &message.from {
                    el = el.attr("from", from.to_string());
                }
                if let Some(body) = &message.body {
                    el = el.child(Element::new("body").text(body.clone()));
                }
                for payload in &message.payloads {
                    el = el.child(payload.clone());
                }
                el
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_mirrors_addressing_and_id() {
        let mut iq = Iq::set(
            Jid::parse("focus@example").unwrap(),
            Element::new("query").with_namespace("urn:test:1"),
        );
        iq.id = "iq-42".to_string();
        iq.from = Some(Jid::parse("r@conf.example/alice").unwrap());

        let reply = iq.error_reply(StanzaError::new(ErrorCondition::ServiceUnavailable));
        assert_eq!(reply.id, "iq-42");
        assert_eq!(reply.to.as_ref().unwrap().to_string(), "r@conf.example/alice");
        assert_eq!(reply.error_condition(), Some(ErrorCondition::ServiceUnavailable));
    }

    #[test]
    fn iq_round_trips_through_element() {
        let mut iq = Iq::set(
            Jid::parse("jvbA@ops.example").unwrap(),
            Element::new("conference-modify")
                .with_namespace("urn:confocus:bridge:1")
                .attr("session-id", "s1"),
        );
        iq.id = "b-1".to_string();
        let parsed = Iq::from_element(&iq.to_element()).unwrap();
        assert_eq!(parsed.id, "b-1");
        assert_eq!(parsed.iq_type, IqType::Set);
        assert_eq!(
            parsed.payload_key(),
            Some(("conference-modify", "urn:confocus:bridge:1"))
        );
    }

    #[test]
    fn stanza_error_round_trips() {
        let err = StanzaError::with_text(ErrorCondition::ResourceConstraint, "restart limit");
        let parsed = StanzaError::from_element(&err.to_element()).unwrap();
        assert_eq!(parsed.condition, ErrorCondition::ResourceConstraint);
        assert_eq!(parsed.error_type, ErrorType::Wait);
        assert_eq!(parsed.text.as_deref(), Some("restart limit"));
    }
}
