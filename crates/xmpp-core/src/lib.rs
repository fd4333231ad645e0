//! XMPP signaling fabric for the confocus conference focus
//!
//! This crate is the transport-facing slice of the focus: JIDs, stanza and
//! element modelling, the request/response correlator, the inbound IQ
//! handler registry, and MUC occupant tracking. Everything above it (the
//! conference, bridge, and source machinery) consumes these primitives and
//! never touches the wire directly.

pub mod adapter;
pub mod element;
pub mod error;
pub mod jid;
pub mod loopback;
pub mod muc;
pub mod sources;
pub mod stanza;
pub mod transport;

pub use adapter::{IqRequestHandler, XmppAdapter, XmppTransport, DEFAULT_IQ_TIMEOUT};
pub use element::Element;
pub use error::{RequestError, Result, XmppError};
pub use jid::Jid;
pub use muc::{MucEvent, OccupantJid, RoomJid};
pub use sources::{GroupSemantics, MediaType, Source, SourceGroup, Ssrc, VideoType};
pub use transport::{IceCandidate, TransportDescription};
pub use stanza::{
    ErrorCondition, ErrorType, Iq, IqType, Message, Presence, PresenceType, Stanza, StanzaError,
};
