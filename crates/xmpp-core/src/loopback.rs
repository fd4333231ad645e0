//! In-process transport
//!
//! Hands every outbound stanza to a channel the embedder (usually a test
//! harness) reads, instead of a network stream. Inbound traffic is injected
//! with [`crate::adapter::XmppAdapter::handle_inbound`].

use crate::adapter::XmppTransport;
use crate::error::XmppError;
use crate::stanza::Stanza;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Transport that forwards stanzas to an in-process receiver.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Stanza>,
}

impl LoopbackTransport {
    /// Create a transport and the receiving end of its stanza stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Stanza>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl XmppTransport for LoopbackTransport {
    async fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        self.tx.send(stanza).map_err(|_| XmppError::AdapterOffline)
    }
}
