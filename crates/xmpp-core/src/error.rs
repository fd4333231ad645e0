//! Error types for the XMPP signaling fabric

use thiserror::Error;

/// Result type for XMPP operations
pub type Result<T> = std::result::Result<T, XmppError>;

/// Errors raised by the signaling fabric itself (not by remote peers).
#[derive(Debug, Error)]
pub enum XmppError {
    /// Malformed JID text
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    /// XML rendering or parsing failure
    #[error("XML error: {0}")]
    Xml(String),

    /// Malformed or incomplete stanza
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    /// The adapter is not connected; outbound stanzas cannot be delivered
    #[error("signaling adapter offline")]
    AdapterOffline,

    /// An IQ handler is already registered for this payload key
    #[error("IQ handler already registered for {child} in {namespace}")]
    HandlerAlreadyRegistered { child: String, namespace: String },

    /// Attempt to use a MUC the adapter has not joined
    #[error("not joined to room {0}")]
    NotInRoom(String),

    /// Attempt to join a MUC twice
    #[error("already joined to room {0}")]
    AlreadyInRoom(String),
}

/// Outcome of an IQ request that did not produce a reply stanza.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// No reply arrived within the wait window
    #[error("IQ request timed out")]
    Timeout,

    /// The adapter went offline before a reply arrived
    #[error("signaling adapter offline")]
    Offline,

    /// The caller cancelled the wait; no reply will be delivered
    #[error("IQ request cancelled")]
    Cancelled,
}
