//! Presence detectors
//!
//! Detectors join operator rooms and translate occupant presence into
//! state the rest of the focus consumes: the bridge detector feeds the
//! catalog, the worker detector maintains a pool of gateway workers
//! (recorders, transcribers, SIP gateways). They hold no other state.

use crate::catalog::BridgeCatalog;
use crate::presence_ext::BridgeStatusExt;
use confocus_xmpp_core::{Element, Jid, MucEvent, Presence, RoomJid, XmppAdapter, XmppError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Joins the brewery room and keeps the catalog current.
pub struct BridgeDetector {
    adapter: XmppAdapter,
    catalog: Arc<BridgeCatalog>,
    room: RoomJid,
    nick: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeDetector {
    pub fn new(
        adapter: XmppAdapter,
        catalog: Arc<BridgeCatalog>,
        room: RoomJid,
        nick: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            catalog,
            room,
            nick: nick.into(),
            handle: Mutex::new(None),
        }
    }

    /// Join the brewery room and start folding presence into the catalog.
    pub fn start(&self) -> Result<(), XmppError> {
        let mut events = self.adapter.join_muc(&self.room, &self.nick)?;
        let catalog = self.catalog.clone();
        let own_nick = self.nick.clone();
        let room = self.room.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MucEvent::MemberJoined { occupant, presence }
                    | MucEvent::PresenceUpdated { occupant, presence } => {
                        if occupant.nick() == own_nick {
                            continue;
                        }
                        match BridgeStatusExt::from_presence(&presence) {
                            Some(status) => catalog.on_bridge_status(occupant.jid(), &status),
                            None => debug!("non-bridge occupant {} in brewery", occupant),
                        }
                    }
                    MucEvent::MemberLeft { occupant } => {
                        if occupant.nick() != own_nick {
                            catalog.on_bridge_unavailable(occupant.jid());
                        }
                    }
                    MucEvent::Message { .. } => {}
                }
            }
            debug!("bridge detector for {} stopped", room);
        });
        *self.handle.lock() = Some(handle);
        info!("bridge detector watching {}", self.room);
        Ok(())
    }

    /// Leave the room and stop feeding the catalog.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.adapter.leave_muc(&self.room, &self.nick, "detector stopped");
    }
}

pub const WORKER_NS: &str = "urn:confocus:worker:1";

/// A gateway worker advertised in an operator room.
#[derive(Debug, Clone)]
pub struct Worker {
    pub jid: Jid,
    pub busy: bool,
    pub region: Option<String>,
}

/// Parsed worker status from one presence.
fn worker_status(presence: &Presence) -> Option<(bool, Option<String>)> {
    let status = presence.extension("worker-status", WORKER_NS)?;
    let busy = status.attribute("busy") == Some("true");
    let region = status.attribute("region").map(str::to_string);
    Some((busy, region))
}

/// Render a worker-status payload. Used by tooling that impersonates a
/// worker, and by tests.
pub fn worker_status_payload(busy: bool, region: Option<&str>) -> Element {
    let mut el = Element::new("worker-status")
        .with_namespace(WORKER_NS)
        .attr("busy", busy.to_string());
    if let Some(region) = region {
        el = el.attr("region", region);
    }
    el
}

/// Joins a worker operator room and tracks the advertised pool.
pub struct WorkerDetector {
    adapter: XmppAdapter,
    room: RoomJid,
    nick: String,
    workers: Arc<Mutex<BTreeMap<Jid, Worker>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerDetector {
    pub fn new(adapter: XmppAdapter, room: RoomJid, nick: impl Into<String>) -> Self {
        Self {
            adapter,
            room,
            nick: nick.into(),
            workers: Arc::new(Mutex::new(BTreeMap::new())),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), XmppError> {
        let mut events = self.adapter.join_muc(&self.room, &self.nick)?;
        let workers = self.workers.clone();
        let own_nick = self.nick.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MucEvent::MemberJoined { occupant, presence }
                    | MucEvent::PresenceUpdated { occupant, presence } => {
                        if occupant.nick() == own_nick {
                            continue;
                        }
                        if let Some((busy, region)) = worker_status(&presence) {
                            workers.lock().insert(
                                occupant.jid().clone(),
                                Worker {
                                    jid: occupant.jid().clone(),
                                    busy,
                                    region,
                                },
                            );
                        }
                    }
                    MucEvent::MemberLeft { occupant } => {
                        workers.lock().remove(occupant.jid());
                    }
                    MucEvent::Message { .. } => {}
                }
            }
        });
        *self.handle.lock() = Some(handle);
        info!("worker detector watching {}", self.room);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.adapter.leave_muc(&self.room, &self.nick, "detector stopped");
        self.workers.lock().clear();
    }

    /// Pick an idle worker. Deterministic: first idle worker by address.
    pub fn select_worker(&self) -> Option<Worker> {
        self.workers
            .lock()
            .values()
            .find(|w| !w.busy)
            .cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confocus_xmpp_core::loopback::LoopbackTransport;
    use confocus_xmpp_core::{Presence, Stanza};

    fn harness() -> (XmppAdapter, Arc<BridgeCatalog>) {
        let (transport, _sent) = LoopbackTransport::new();
        let adapter = XmppAdapter::new(
            Jid::parse("focus@auth.example/focus").unwrap(),
            Arc::new(transport),
        );
        (adapter, Arc::new(BridgeCatalog::new()))
    }

    fn bridge_presence(room: &RoomJid, nick: &str, status: &BridgeStatusExt) -> Stanza {
        let occupant = room.occupant(nick);
        let mut presence = Presence::available(room.jid().clone());
        presence.from = Some(occupant.jid().clone());
        for payload in status.to_payloads() {
            presence = presence.with_payload(payload);
        }
        Stanza::Presence(presence)
    }

    #[tokio::test]
    async fn brewery_presence_populates_catalog() {
        let (adapter, catalog) = harness();
        let room = RoomJid::parse("brewery@ops.example").unwrap();
        let detector = BridgeDetector::new(adapter.clone(), catalog.clone(), room.clone(), "focus");
        detector.start().unwrap();

        adapter.handle_inbound(bridge_presence(
            &room,
            "jvbA",
            &BridgeStatusExt {
                region: Some("us-east".to_string()),
                stress: Some(0.1),
                ..Default::default()
            },
        ));
        tokio::task::yield_now().await;

        let bridges = catalog.operational_bridges();
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].region.as_deref(), Some("us-east"));
        detector.stop();
    }

    #[tokio::test]
    async fn worker_pool_tracks_busy_flag() {
        let (adapter, _) = harness();
        let room = RoomJid::parse("recorders@ops.example").unwrap();
        let detector = WorkerDetector::new(adapter.clone(), room.clone(), "focus");
        detector.start().unwrap();

        let mut presence = Presence::available(room.jid().clone());
        presence.from = Some(room.occupant("rec1").jid().clone());
        let presence = presence.with_payload(worker_status_payload(true, Some("us-east")));
        adapter.handle_inbound(Stanza::Presence(presence));
        tokio::task::yield_now().await;

        assert_eq!(detector.worker_count(), 1);
        assert!(detector.select_worker().is_none(), "busy worker is not selectable");
        detector.stop();
    }
}
