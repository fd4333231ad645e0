//! Signaling adapter
//!
//! Process-wide fabric between the focus and the chat service. Owns the
//! outstanding-request table, the inbound IQ handler registry, and the set
//! of joined MUC rooms. Outbound stanzas go through a single writer task so
//! per-peer ordering is preserved.

use crate::element::Element;
use crate::error::{RequestError, XmppError};
use crate::jid::Jid;
use crate::muc::{MucEvent, OccupantJid, RoomJid, RoomState};
use crate::stanza::{ErrorCondition, Iq, Message, Presence, Stanza, StanzaError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Default wait for an IQ reply.
pub const DEFAULT_IQ_TIMEOUT: Duration = Duration::from_secs(15);

/// The wire the adapter writes stanzas to. Tests use the in-memory
/// [`crate::loopback::LoopbackTransport`]; a production connection owns the
/// TCP/TLS stream and stream management.
#[async_trait]
pub trait XmppTransport: Send + Sync {
    async fn send(&self, stanza: Stanza) -> Result<(), XmppError>;
}

/// Handler for inbound request IQs (type get/set) matching one payload key.
#[async_trait]
pub trait IqRequestHandler: Send + Sync {
    /// Produce the reply for one request. Returning an error descriptor
    /// yields a typed error reply to the sender.
    async fn handle_iq(&self, iq: Iq) -> Result<Iq, StanzaError>;
}

type HandlerKey = (String, String);

struct AdapterInner {
    jid: Jid,
    outbound_tx: mpsc::UnboundedSender<Stanza>,
    pending: DashMap<String, oneshot::Sender<Iq>>,
    handlers: DashMap<HandlerKey, Arc<dyn IqRequestHandler>>,
    rooms: Mutex<HashMap<RoomJid, RoomState>>,
    registration_tx: broadcast::Sender<bool>,
    online: AtomicBool,
    next_id: AtomicU64,
}

/// Process-wide signaling adapter. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct XmppAdapter {
    inner: Arc<AdapterInner>,
}

impl XmppAdapter {
    /// Construct an adapter writing to `transport` and identifying as `jid`.
    pub fn new(jid: Jid, transport: Arc<dyn XmppTransport>) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Stanza>();
        let (registration_tx, _) = broadcast::channel(16);
        let inner = Arc::new(AdapterInner {
            jid,
            outbound_tx,
            pending: DashMap::new(),
            handlers: DashMap::new(),
            rooms: Mutex::new(HashMap::new()),
            registration_tx,
            online: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        // Single writer task: outbound order is the enqueue order.
        tokio::spawn(async move {
            while let Some(stanza) = outbound_rx.recv().await {
                if let Ok(xml) = stanza.to_element().render() {
                    trace!("outbound stanza: {}", xml);
                }
                if let Err(e) = transport.send(stanza).await {
                    warn!("outbound stanza dropped: {}", e);
                }
            }
        });

        Self { inner }
    }

    /// Our own full JID on the chat service.
    pub fn jid(&self) -> &Jid {
        &self.inner.jid
    }

    /// Best-effort fire-and-forget delivery.
    pub fn send(&self, stanza: Stanza) {
        if self.inner.outbound_tx.send(stanza).is_err() {
            warn!("signaling adapter writer gone; stanza dropped");
        }
    }

    /// Send a request IQ and wait for its reply, with the default timeout.
    pub async fn request(&self, iq: Iq) -> Result<Iq, RequestError> {
        self.request_with_timeout(iq, DEFAULT_IQ_TIMEOUT).await
    }

    /// Send a request IQ and wait for the reply with a matching id.
    ///
    /// At most one reply is ever delivered. Dropping the returned future
    /// cancels the wait and removes the correlator entry; a late reply is
    /// then discarded.
    pub async fn request_with_timeout(
        &self,
        mut iq: Iq,
        wait: Duration,
    ) -> Result<Iq, RequestError> {
        if !self.inner.online.load(Ordering::Acquire) {
            return Err(RequestError::Offline);
        }
        let id = self.next_request_id();
        iq.id = id.clone();
        if iq.from.is_none() {
            iq.from = Some(self.inner.jid.clone());
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            inner: self.inner.clone(),
            id: id.clone(),
        };

        if self.inner.outbound_tx.send(Stanza::Iq(iq)).is_err() {
            return Err(RequestError::Offline);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped without a reply: the adapter purged the
            // request table on disconnect.
            Ok(Err(_)) => Err(RequestError::Offline),
            Err(_) => {
                debug!("IQ request {} timed out after {:?}", id, wait);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Route inbound request IQs whose first payload element matches
    /// `(child, namespace)` to `handler`. Exactly one handler per key.
    pub fn register_iq_handler(
        &self,
        child: &str,
        namespace: &str,
        handler: Arc<dyn IqRequestHandler>,
    ) -> Result<(), XmppError> {
        let key = (child.to_string(), namespace.to_string());
        match self.inner.handlers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(XmppError::HandlerAlreadyRegistered {
                    child: child.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Remove the handler for a payload key, if registered.
    pub fn unregister_iq_handler(&self, child: &str, namespace: &str) {
        self.inner
            .handlers
            .remove(&(child.to_string(), namespace.to_string()));
    }

    /// Join a MUC under `nick`. Returns the room's ordered event stream.
    pub fn join_muc(
        &self,
        room: &RoomJid,
        nick: &str,
    ) -> Result<mpsc::UnboundedReceiver<MucEvent>, XmppError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut rooms = self.inner.rooms.lock();
            if rooms.contains_key(room) {
                return Err(XmppError::AlreadyInRoom(room.to_string()));
            }
            rooms.insert(room.clone(), RoomState::new(tx));
        }
        self.send(Stanza::Presence(Presence::available(
            room.occupant(nick).jid().clone(),
        )));
        debug!("joined MUC {} as {}", room, nick);
        Ok(rx)
    }

    /// Leave a MUC, closing its event stream.
    pub fn leave_muc(&self, room: &RoomJid, nick: &str, reason: &str) {
        let removed = self.inner.rooms.lock().remove(room).is_some();
        if removed {
            let mut presence = Presence::unavailable(room.occupant(nick).jid().clone());
            if !reason.is_empty() {
                presence = presence.with_payload(Element::new("status").text(reason));
            }
            self.send(Stanza::Presence(presence));
            debug!("left MUC {} ({})", room, reason);
        }
    }

    /// Subscribe to connection/registration transitions. `true` means a
    /// fresh session: higher layers should re-establish subscriptions.
    pub fn subscribe_registration(&self) -> broadcast::Receiver<bool> {
        self.inner.registration_tx.subscribe()
    }

    /// Called by the connection driver on connect/disconnect.
    pub fn registration_changed(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
        if !online {
            // Outstanding requests can never complete on a dead stream.
            self.inner.pending.clear();
        }
        let _ = self.inner.registration_tx.send(online);
    }

    /// Feed one inbound stanza from the connection into the fabric.
    ///
    /// Must be called from a single reader task: per-room event order is
    /// the call order.
    pub fn handle_inbound(&self, stanza: Stanza) {
        match stanza {
            Stanza::Iq(iq) => self.handle_inbound_iq(iq),
            Stanza::Presence(presence) => self.handle_inbound_presence(presence),
            Stanza::Message(message) => self.handle_inbound_message(message),
        }
    }

    fn handle_inbound_iq(&self, iq: Iq) {
        if !iq.iq_type.is_request() {
            // Response: deliver to at most one waiter.
            match self.inner.pending.remove(&iq.id) {
                Some((_, tx)) => {
                    let _ = tx.send(iq);
                }
                None => debug!("unmatched IQ response {} dropped", iq.id),
            }
            return;
        }

        let handler = iq
            .payload_key()
            .and_then(|(child, ns)| {
                self.inner
                    .handlers
                    .get(&(child.to_string(), ns.to_string()))
                    .map(|entry| entry.value().clone())
            });

        let Some(handler) = handler else {
            self.send(Stanza::Iq(iq.error_reply(StanzaError::new(
                ErrorCondition::ServiceUnavailable,
            ))));
            return;
        };

        // Handlers run off the reader task so a slow handler cannot stall
        // unrelated traffic. The reply is produced exactly once.
        let adapter = self.clone();
        tokio::spawn(async move {
            let request = iq.clone();
            let outcome = AssertUnwindSafe(handler.handle_iq(iq)).catch_unwind().await;
            let reply = match outcome {
                Ok(Ok(reply)) => reply,
                Ok(Err(stanza_error)) => request.error_reply(stanza_error),
                Err(_) => {
                    warn!("IQ handler panicked handling {}", request.id);
                    request.error_reply(StanzaError::new(ErrorCondition::InternalServerError))
                }
            };
            adapter.send(Stanza::Iq(reply));
        });
    }

    fn handle_inbound_presence(&self, presence: Presence) {
        let Some(from) = presence.from.clone() else {
            return;
        };
        let Some(occupant) = OccupantJid::new(from) else {
            return;
        };
        let mut rooms = self.inner.rooms.lock();
        match rooms.get_mut(&occupant.room()) {
            Some(room) => room.on_presence(occupant, presence),
            None => trace!("presence from unjoined room {} ignored", occupant.room()),
        }
    }

    fn handle_inbound_message(&self, message: Message) {
        let Some(from) = message.from.clone() else {
            return;
        };
        let Some(occupant) = OccupantJid::new(from) else {
            return;
        };
        let rooms = self.inner.rooms.lock();
        if let Some(room) = rooms.get(&occupant.room()) {
            room.on_message(occupant, message);
        }
    }

    fn next_request_id(&self) -> String {
        format!("cf-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Removes the correlator entry when the request future is dropped, so a
/// cancelled caller can never observe a late reply.
struct PendingGuard {
    inner: Arc<AdapterInner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}
