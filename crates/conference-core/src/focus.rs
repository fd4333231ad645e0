//! Focus manager
//!
//! Process-wide directory of conferences: creation, lookup, destruction,
//! and the aggregate stats/health/debug surface the admin collaborator
//! consumes. It also owns the IQ handlers that route session negotiation
//! and conference requests into the right conference.

use crate::conference::{Conference, ConferenceEvent, ConferenceServices};
use crate::errors::{ConferenceError, Result};
use crate::negotiation::{SessionMessage, JINGLE_NS};
use crate::types::ConferenceProperties;
use async_trait::async_trait;
use confocus_xmpp_core::{
    Element, ErrorCondition, Iq, IqRequestHandler, OccupantJid, RoomJid, StanzaError,
};
use dashmap::DashMap;
use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub const FOCUS_NS: &str = "urn:confocus:focus:1";

/// Aggregate counters for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FocusStats {
    pub conferences: usize,
    pub started_conferences: usize,
    pub participants: usize,
    pub operational_bridges: usize,
    pub draining_bridges: usize,
}

/// Health outcome with the admin collaborator's status codes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub success: bool,
    pub sticky: bool,
    pub hard_failure: bool,
    pub code: u16,
    pub message: String,
}

#[derive(Default)]
struct HealthState {
    hard_failure: Option<String>,
    adapter_offline: bool,
    /// Set once any hard failure has been observed; never clears.
    sticky: bool,
}

/// Process-wide registry of conferences.
pub struct FocusManager {
    services: ConferenceServices,
    conferences: DashMap<RoomJid, Arc<Conference>>,
    events_tx: mpsc::UnboundedSender<ConferenceEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConferenceEvent>>>,
    health: parking_lot::Mutex<HealthState>,
}

impl FocusManager {
    pub fn new(services: ConferenceServices) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            services,
            conferences: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            health: parking_lot::Mutex::new(HealthState::default()),
        })
    }

    /// Register IQ handlers and start reaping ended conferences.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let adapter = &self.services.adapter;
        adapter.register_iq_handler(
            "session",
            JINGLE_NS,
            Arc::new(SessionIqHandler {
                manager: Arc::downgrade(self),
            }),
        )?;
        adapter.register_iq_handler(
            "conference-request",
            FOCUS_NS,
            Arc::new(ConferenceRequestHandler {
                manager: Arc::downgrade(self),
            }),
        )?;

        // Reaper: a conference reaching its terminal state removes itself.
        let manager = self.clone();
        let mut events = self
            .events_rx
            .lock()
            .await
            .take()
            .expect("start called once");
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConferenceEvent::Ended { room, reason } => {
                        manager.conferences.remove(&room);
                        debug!("conference {} reaped ({})", room, reason);
                    }
                }
            }
        });

        // Connection transitions feed health; a fresh session is the
        // adapter's signal that subscriptions must be re-established.
        let manager = self.clone();
        let mut registration = self.services.adapter.subscribe_registration();
        tokio::spawn(async move {
            while let Ok(online) = registration.recv().await {
                manager.health.lock().adapter_offline = !online;
                if !online {
                    warn!("signaling connection lost");
                }
            }
        });

        info!("focus manager started");
        Ok(())
    }

    /// Look up or create the conference for a room. Newly created
    /// conferences join their MUC immediately.
    pub fn get_or_create(
        &self,
        room: &RoomJid,
        props: ConferenceProperties,
    ) -> Result<Arc<Conference>> {
        match self.conferences.entry(room.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let conference = Conference::new(
                    room.clone(),
                    props,
                    self.services.clone(),
                    self.events_tx.clone(),
                );
                conference.start()?;
                entry.insert(conference.clone());
                Ok(conference)
            }
        }
    }

    pub fn get(&self, room: &RoomJid) -> Option<Arc<Conference>> {
        self.conferences.get(room).map(|c| c.value().clone())
    }

    /// Admin entry point: ensure the conference exists, report whether it
    /// has started.
    pub async fn conference_request(
        &self,
        room: &RoomJid,
        props: ConferenceProperties,
    ) -> Result<bool> {
        let conference = self.get_or_create(room, props)?;
        Ok(conference.is_started().await)
    }

    /// Stop one conference with a reason. Returns false when unknown.
    pub async fn end_conference(&self, room: &RoomJid, reason: &str) -> bool {
        match self.get(room) {
            Some(conference) => {
                conference.stop(reason).await;
                true
            }
            None => false,
        }
    }

    pub fn conference_count(&self) -> usize {
        self.conferences.len()
    }

    pub fn iterate(&self) -> Vec<Arc<Conference>> {
        self.conferences.iter().map(|c| c.value().clone()).collect()
    }

    pub async fn get_stats(&self) -> FocusStats {
        let mut participants = 0;
        let mut started = 0;
        for conference in self.iterate() {
            participants += conference.participant_count().await;
            if conference.is_started().await {
                started += 1;
            }
        }
        let catalog = &self.services.catalog;
        FocusStats {
            conferences: self.conferences.len(),
            started_conferences: started,
            participants,
            operational_bridges: catalog.operational_bridges().len(),
            draining_bridges: catalog.draining_count(),
        }
    }

    pub async fn get_debug_state(&self, full: bool, room: Option<&RoomJid>) -> serde_json::Value {
        match room {
            Some(room) => match self.get(room) {
                Some(conference) => conference.debug_state(full).await,
                None => json!({ "error": "conference not found" }),
            },
            None => {
                let mut conferences = Vec::new();
                for conference in self.iterate() {
                    conferences.push(conference.debug_state(full).await);
                }
                json!({
                    "conference_count": conferences.len(),
                    "conferences": conferences,
                })
            }
        }
    }

    /// The admin health probe. Hard failures are sticky; transient
    /// conditions (no bridges, signaling down) report 503.
    pub fn get_health(&self) -> HealthReport {
        let state = self.health.lock();
        if let Some(message) = &state.hard_failure {
            return HealthReport {
                success: false,
                sticky: state.sticky,
                hard_failure: true,
                code: 500,
                message: message.clone(),
            };
        }
        if state.adapter_offline {
            return HealthReport {
                success: false,
                sticky: state.sticky,
                hard_failure: false,
                code: 503,
                message: "signaling connection down".to_string(),
            };
        }
        if self.services.catalog.operational_bridges().is_empty() {
            return HealthReport {
                success: false,
                sticky: state.sticky,
                hard_failure: false,
                code: 503,
                message: "no operational bridges".to_string(),
            };
        }
        HealthReport {
            success: true,
            sticky: state.sticky,
            hard_failure: false,
            code: 200,
            message: "ok".to_string(),
        }
    }

    /// Record an unrecoverable failure; health reports 500 from now on.
    pub fn record_hard_failure(&self, message: impl Into<String>) {
        let mut state = self.health.lock();
        state.hard_failure = Some(message.into());
        state.sticky = true;
    }

    /// Drain every conference, e.g. on shutdown.
    pub async fn shutdown(&self, reason: &str) {
        let conferences = self.iterate();
        info!("draining {} conferences: {}", conferences.len(), reason);
        for conference in conferences {
            conference.stop(reason).await;
        }
    }
}

/// Routes session negotiation IQs to the participant's conference.
struct SessionIqHandler {
    manager: Weak<FocusManager>,
}

#[async_trait]
impl IqRequestHandler for SessionIqHandler {
    async fn handle_iq(&self, iq: Iq) -> std::result::Result<Iq, StanzaError> {
        let Some(manager) = self.manager.upgrade() else {
            return Err(StanzaError::new(ErrorCondition::ServiceUnavailable));
        };
        let occupant = iq
            .from
            .clone()
            .and_then(OccupantJid::new)
            .ok_or_else(|| StanzaError::new(ErrorCondition::BadRequest))?;
        let message = iq
            .payload
            .as_ref()
            .and_then(SessionMessage::from_element)
            .ok_or_else(|| StanzaError::new(ErrorCondition::BadRequest))?;
        let conference = manager
            .get(&occupant.room())
            .ok_or_else(|| StanzaError::new(ErrorCondition::ItemNotFound))?;
        conference.handle_session_iq(occupant, iq, message).await
    }
}

/// Creates conferences on explicit request.
struct ConferenceRequestHandler {
    manager: Weak<FocusManager>,
}

#[async_trait]
impl IqRequestHandler for ConferenceRequestHandler {
    async fn handle_iq(&self, iq: Iq) -> std::result::Result<Iq, StanzaError> {
        let Some(manager) = self.manager.upgrade() else {
            return Err(StanzaError::new(ErrorCondition::ServiceUnavailable));
        };
        let payload = iq
            .payload
            .as_ref()
            .ok_or_else(|| StanzaError::new(ErrorCondition::BadRequest))?;
        let room = payload
            .attribute("room")
            .and_then(|r| RoomJid::parse(r).ok())
            .ok_or_else(|| {
                StanzaError::with_text(ErrorCondition::BadRequest, "missing room")
            })?;
        let props = ConferenceProperties {
            pinned_bridge_version: payload.attribute("bridge-version").map(str::to_string),
            meeting_id: payload.attribute("meeting-id").map(str::to_string),
            include_in_stats: true,
        };
        let started = manager
            .conference_request(&room, props)
            .await
            .map_err(|err| {
                warn!("conference request for {} failed: {}", room, err);
                match err {
                    ConferenceError::Signaling(_) => {
                        StanzaError::new(ErrorCondition::ServiceUnavailable)
                    }
                    _ => StanzaError::new(ErrorCondition::InternalServerError),
                }
            })?;
        let conference = manager.get(&room);
        let mut reply = Element::new("conference-request")
            .with_namespace(FOCUS_NS)
            .attr("room", room.to_string())
            .attr("ready", "true")
            .attr("started", started.to_string())
            .attr("focus", manager.services.adapter.jid().to_string());
        if let Some(conference) = conference {
            reply = reply.attr("meeting-id", conference.meeting_id().to_string());
        }
        Ok(iq.result_reply_with(reply))
    }
}
