//! Bridge session management
//!
//! One manager per conference. It owns the control session with every
//! bridge the conference uses: endpoint allocation with candidate retry,
//! incremental endpoint updates, expiry, and the inter-bridge relay mesh
//! once more than one bridge hosts the conference.
//!
//! Lock discipline: the manager's state lock is never held across a
//! request to a bridge. Requests are computed under the lock, sent after
//! releasing it, and their outcomes folded back in under a fresh lock.

use crate::config::ConferenceConfig;
use crate::errors::AllocationError;
use crate::source::EndpointSourceSet;
use crate::types::{EndpointId, MeetingId};
use confocus_bridge_core::control::{self, EndpointAllocation, EndpointParams, RelayEndpoint};
use confocus_bridge_core::{BridgeCatalog, BridgeSelector, SelectionConstraints};
use confocus_xmpp_core::{
    Iq, Jid, MediaType, RequestError, RoomJid, TransportDescription, XmppAdapter,
};
use indexmap::IndexMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the coordinator needs to allocate one endpoint.
#[derive(Debug, Clone)]
pub struct AllocationParams {
    pub endpoint_id: EndpointId,
    pub region: Option<String>,
    pub media: Vec<MediaType>,
    pub use_sctp: bool,
    pub start_audio_muted: bool,
    pub start_video_muted: bool,
    /// Sources the endpoint already owns (re-invites carry them forward).
    pub sources: EndpointSourceSet,
}

/// A successful allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub bridge: Jid,
    /// Control-session id; session messages quoting another id are stale.
    pub bridge_session_id: String,
    pub endpoint: EndpointAllocation,
}

#[derive(Debug, Default, Clone)]
struct EndpointRecord {
    sources: EndpointSourceSet,
    audio_muted: bool,
    video_muted: bool,
}

struct BridgeSession {
    bridge: Jid,
    session_id: String,
    /// Relay id of this bridge, from the catalog at session-open time.
    relay_id: Option<String>,
    endpoints: HashMap<EndpointId, EndpointRecord>,
    /// Peer relay ids already mirrored onto this bridge.
    relays: HashSet<String>,
}

#[derive(Default)]
struct ManagerState {
    sessions: IndexMap<Jid, BridgeSession>,
    /// Bridges that failed for this conference; never retried here.
    failed: HashSet<Jid>,
}

/// Per-conference owner of all bridge control sessions.
pub struct BridgeSessionManager {
    room: RoomJid,
    meeting_id: MeetingId,
    adapter: XmppAdapter,
    selector: Arc<BridgeSelector>,
    catalog: Arc<BridgeCatalog>,
    config: Arc<ConferenceConfig>,
    pinned_version: Option<String>,
    state: Mutex<ManagerState>,
    /// Serialises whole allocation calls: two concurrent invites must not
    /// open duplicate control sessions on one bridge.
    alloc_gate: Mutex<()>,
}

impl BridgeSessionManager {
    pub fn new(
        room: RoomJid,
        meeting_id: MeetingId,
        adapter: XmppAdapter,
        selector: Arc<BridgeSelector>,
        catalog: Arc<BridgeCatalog>,
        config: Arc<ConferenceConfig>,
        pinned_version: Option<String>,
    ) -> Self {
        Self {
            room,
            meeting_id,
            adapter,
            selector,
            catalog,
            config,
            pinned_version,
            state: Mutex::new(ManagerState::default()),
            alloc_gate: Mutex::new(()),
        }
    }

    /// Allocate an endpoint, selecting a bridge if needed. Each candidate
    /// bridge is tried at most once; a failing bridge is excluded from this
    /// conference until the conference ends.
    pub async fn allocate(&self, params: &AllocationParams) -> Result<Allocation, AllocationError> {
        let _gate = self.alloc_gate.lock().await;
        let mut tried: HashSet<Jid> = HashSet::new();
        loop {
            let (bridge, needs_create, session_id) = {
                let state = self.state.lock().await;
                let mut excluded: Vec<Jid> = state.failed.iter().cloned().collect();
                excluded.extend(tried.iter().cloned());
                let constraints = SelectionConstraints {
                    pinned_version: self.pinned_version.clone(),
                    participant_region: params.region.clone(),
                    in_conference: state.sessions.keys().cloned().collect(),
                    excluded,
                    additional_bridge: false,
                };
                let Some(mut bridge) = self.selector.select(&constraints) else {
                    return Err(AllocationError::NoBridgeAvailable);
                };
                // Region diversity may grow the mesh: when enabled and the
                // affinity pick is off-region, prefer a fresh bridge in the
                // participant's region.
                if self.config.octo.enabled
                    && params.region.is_some()
                    && bridge.region != params.region
                    && !state.sessions.is_empty()
                {
                    let extra = self.selector.select(&SelectionConstraints {
                        additional_bridge: true,
                        ..constraints
                    });
                    if let Some(extra) = extra {
                        if extra.region == params.region {
                            bridge = extra;
                        }
                    }
                }
                match state.sessions.get(&bridge.jid) {
                    Some(session) => (bridge, false, session.session_id.clone()),
                    None => (bridge, true, format!("cs-{}", Uuid::new_v4())),
                }
            };

            if needs_create {
                let create = Iq::set(
                    bridge.jid.clone(),
                    control::create_session(&session_id, &self.meeting_id.0),
                );
                match self.bridge_request(create).await {
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            "create-session on {} failed for {}: {}",
                            bridge.jid, self.room, err
                        );
                        self.fail_bridge(&bridge.jid, &mut tried).await;
                        continue;
                    }
                }
            }

            let endpoint_params = EndpointParams {
                endpoint_id: params.endpoint_id.to_string(),
                media: params.media.clone(),
                use_sctp: params.use_sctp,
                start_audio_muted: params.start_audio_muted,
                start_video_muted: params.start_video_muted,
                sources: params.sources.sources.iter().cloned().collect(),
                source_groups: params.sources.groups.iter().cloned().collect(),
                last_n: None,
            };
            let add = Iq::set(
                bridge.jid.clone(),
                control::add_endpoint(&session_id, &endpoint_params),
            );
            let allocation = match self.bridge_request(add).await {
                Ok(reply) => {
                    let payload = reply.payload.as_ref().ok_or_else(|| {
                        AllocationError::BridgeRejected(
                            confocus_xmpp_core::ErrorCondition::BadRequest,
                        )
                    });
                    match payload.and_then(|p| {
                        EndpointAllocation::from_element(p).map_err(|e| {
                            warn!("unusable allocation reply from {}: {}", bridge.jid, e);
                            AllocationError::BridgeRejected(
                                confocus_xmpp_core::ErrorCondition::BadRequest,
                            )
                        })
                    }) {
                        Ok(allocation) => allocation,
                        Err(_) => {
                            self.fail_bridge(&bridge.jid, &mut tried).await;
                            continue;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "add-endpoint on {} failed for {}/{}: {}",
                        bridge.jid, self.room, params.endpoint_id, err
                    );
                    self.fail_bridge(&bridge.jid, &mut tried).await;
                    continue;
                }
            };

            // Commit the endpoint and work out the relay fan-out.
            let relay_requests = {
                let mut state = self.state.lock().await;
                let relay_id = self.catalog.get(&bridge.jid).and_then(|b| b.relay_id);
                let is_new_session = !state.sessions.contains_key(&bridge.jid);
                if is_new_session {
                    state.sessions.insert(
                        bridge.jid.clone(),
                        BridgeSession {
                            bridge: bridge.jid.clone(),
                            session_id: session_id.clone(),
                            relay_id,
                            endpoints: HashMap::new(),
                            relays: HashSet::new(),
                        },
                    );
                }
                let record = EndpointRecord {
                    sources: params.sources.clone(),
                    audio_muted: params.start_audio_muted,
                    video_muted: params.start_video_muted,
                };
                let session = state
                    .sessions
                    .get_mut(&bridge.jid)
                    .expect("session inserted above");
                session.endpoints.insert(params.endpoint_id.clone(), record);

                if is_new_session {
                    match self.mesh_requests_for_new_session(&mut state, &bridge.jid) {
                        Ok(requests) => requests,
                        Err(err) => {
                            warn!("relay mesh setup skipped for {}: {}", self.room, err);
                            Vec::new()
                        }
                    }
                } else {
                    self.relay_delta_add(&state, &bridge.jid, &params.endpoint_id)
                }
            };
            self.send_control_requests(relay_requests);

            info!(
                "allocated {}/{} on {} (session {})",
                self.room, params.endpoint_id, bridge.jid, session_id
            );
            return Ok(Allocation {
                bridge: bridge.jid,
                bridge_session_id: session_id,
                endpoint: allocation,
            });
        }
    }

    /// Push an incremental change for one endpoint to its owning bridge,
    /// and mirror source changes through the relay mesh.
    pub async fn update_participant(
        &self,
        endpoint_id: &EndpointId,
        transport: Option<&TransportDescription>,
        sources: Option<&EndpointSourceSet>,
        last_n: Option<u32>,
    ) -> Result<(), AllocationError> {
        let (bridge, iq, relay_requests) = {
            let mut state = self.state.lock().await;
            let Some(session) = state
                .sessions
                .values_mut()
                .find(|s| s.endpoints.contains_key(endpoint_id))
            else {
                return Err(AllocationError::InvalidBridgeSession(
                    endpoint_id.to_string(),
                ));
            };
            let bridge = session.bridge.clone();
            let source_parts = sources.map(|s| {
                (
                    s.sources.iter().cloned().collect::<Vec<_>>(),
                    s.groups.iter().cloned().collect::<Vec<_>>(),
                )
            });
            let payload = control::modify_endpoint(
                &session.session_id,
                endpoint_id.as_str(),
                transport,
                source_parts
                    .as_ref()
                    .map(|(s, g)| (s.as_slice(), g.as_slice())),
                last_n,
            );
            let iq = Iq::set(bridge.clone(), payload);
            let mut relay_requests = Vec::new();
            if let Some(sources) = sources {
                let record = session
                    .endpoints
                    .get_mut(endpoint_id)
                    .expect("owning session found by endpoint");
                record.sources = sources.clone();
                relay_requests = self.relay_delta_add(&state, &bridge, endpoint_id);
            }
            (bridge, iq, relay_requests)
        };

        self.send_control_requests(relay_requests);
        match self.bridge_request(iq).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(
                    "modify-endpoint for {}/{} on {} failed: {}",
                    self.room, endpoint_id, bridge, err
                );
                Err(err)
            }
        }
    }

    /// Expire the endpoint on its owning bridge; expire the whole bridge
    /// session (and its relays on peers) once no endpoints remain.
    pub async fn remove_participant(&self, endpoint_id: &EndpointId) {
        let requests = {
            let mut state = self.state.lock().await;
            let Some((bridge, session_id)) = state
                .sessions
                .values_mut()
                .find(|s| s.endpoints.contains_key(endpoint_id))
                .map(|s| {
                    s.endpoints.remove(endpoint_id);
                    (s.bridge.clone(), s.session_id.clone())
                })
            else {
                return;
            };
            let mut requests = vec![Iq::set(
                bridge.clone(),
                control::expire_endpoint(&session_id, endpoint_id.as_str()),
            )];
            requests.extend(self.relay_delta_remove(&state, &bridge, endpoint_id));

            let session_empty = state
                .sessions
                .get(&bridge)
                .map(|s| s.endpoints.is_empty())
                .unwrap_or(false);
            if session_empty {
                let removed = state.sessions.shift_remove(&bridge).expect("checked above");
                requests.push(Iq::set(bridge.clone(), control::expire_session(&session_id)));
                // Peers drop their relay towards the departed bridge.
                if let Some(relay_id) = &removed.relay_id {
                    for peer in state.sessions.values_mut() {
                        if peer.relays.remove(relay_id) {
                            requests.push(Iq::set(
                                peer.bridge.clone(),
                                control::expire_relay(&peer.session_id, relay_id),
                            ));
                        }
                    }
                }
                debug!("bridge session on {} expired for {}", bridge, self.room);
            }
            requests
        };
        self.send_control_requests(requests);
    }

    /// Terminal teardown: expire every bridge session.
    pub async fn expire_all(&self) {
        let requests = {
            let mut state = self.state.lock().await;
            let requests: Vec<Iq> = state
                .sessions
                .values()
                .map(|s| Iq::set(s.bridge.clone(), control::expire_session(&s.session_id)))
                .collect();
            state.sessions.clear();
            requests
        };
        self.send_control_requests(requests);
    }

    /// A bridge stopped serving this conference (lost connection, error
    /// response after allocation). Drops its session and returns the
    /// endpoints that need a new home.
    pub async fn on_bridge_failed(&self, bridge: &Jid) -> Vec<EndpointId> {
        let (orphans, requests) = {
            let mut state = self.state.lock().await;
            state.failed.insert(bridge.clone());
            let Some(removed) = state.sessions.shift_remove(bridge) else {
                return Vec::new();
            };
            let mut requests = Vec::new();
            if let Some(relay_id) = &removed.relay_id {
                for peer in state.sessions.values_mut() {
                    if peer.relays.remove(relay_id) {
                        requests.push(Iq::set(
                            peer.bridge.clone(),
                            control::expire_relay(&peer.session_id, relay_id),
                        ));
                    }
                }
            }
            (removed.endpoints.keys().cloned().collect(), requests)
        };
        self.send_control_requests(requests);
        warn!("bridge {} failed for {}", bridge, self.room);
        orphans
    }

    pub async fn bridges_in_use(&self) -> Vec<Jid> {
        self.state.lock().await.sessions.keys().cloned().collect()
    }

    pub async fn bridge_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Whether this session id names a current allocation.
    pub async fn is_current_session(&self, bridge_session_id: &str) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .any(|s| s.session_id == bridge_session_id)
    }

    pub async fn debug_state(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        json!({
            "sessions": state.sessions.values().map(|s| json!({
                "bridge": s.bridge.to_string(),
                "session_id": s.session_id,
                "endpoints": s.endpoints.iter().map(|(id, record)| json!({
                    "id": id.to_string(),
                    "sources": record.sources.source_count(),
                    "audio_muted": record.audio_muted,
                    "video_muted": record.video_muted,
                })).collect::<Vec<_>>(),
                "relays": s.relays.iter().cloned().collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "failed": state.failed.iter().map(|j| j.to_string()).collect::<Vec<_>>(),
        })
    }

    /// Build the full-mesh relay requests needed after `new_bridge` joined
    /// the conference: every existing bridge is mirrored onto the new one,
    /// and the new one onto every existing bridge.
    fn mesh_requests_for_new_session(
        &self,
        state: &mut ManagerState,
        new_bridge: &Jid,
    ) -> Result<Vec<Iq>, AllocationError> {
        if state.sessions.len() < 2 {
            return Ok(Vec::new());
        }
        let mesh_id = self.config.octo.mesh_id.clone();
        let mut requests = Vec::new();

        let new_session_id;
        let new_relay_id;
        let new_endpoints;
        {
            let new = state
                .sessions
                .get(new_bridge)
                .expect("new session inserted by caller");
            new_session_id = new.session_id.clone();
            new_relay_id = new.relay_id.clone();
            new_endpoints = relay_endpoints(&new.endpoints);
        }

        let peers: Vec<Jid> = state
            .sessions
            .keys()
            .filter(|jid| *jid != new_bridge)
            .cloned()
            .collect();
        for peer_jid in peers {
            let (peer_session_id, peer_relay_id, peer_endpoints) = {
                let peer = state.sessions.get(&peer_jid).expect("key from sessions");
                (
                    peer.session_id.clone(),
                    peer.relay_id.clone(),
                    relay_endpoints(&peer.endpoints),
                )
            };

            // Mirror the peer onto the new bridge.
            if let Some(peer_relay_id) = &peer_relay_id {
                let new = state
                    .sessions
                    .get_mut(new_bridge)
                    .expect("new session inserted by caller");
                if !new.relays.insert(peer_relay_id.clone()) {
                    return Err(AllocationError::RelayAlreadyExists(peer_relay_id.clone()));
                }
                requests.push(Iq::set(
                    new_bridge.clone(),
                    control::create_relay(&new_session_id, peer_relay_id, &mesh_id, &peer_endpoints),
                ));
            }

            // Mirror the new bridge onto the peer.
            if let Some(new_relay_id) = &new_relay_id {
                let peer = state.sessions.get_mut(&peer_jid).expect("key from sessions");
                if !peer.relays.insert(new_relay_id.clone()) {
                    return Err(AllocationError::RelayAlreadyExists(new_relay_id.clone()));
                }
                requests.push(Iq::set(
                    peer_jid.clone(),
                    control::create_relay(&peer_session_id, new_relay_id, &mesh_id, &new_endpoints),
                ));
            }
        }
        Ok(requests)
    }

    /// Delta: `endpoint_id` (on `bridge`) appeared or changed; refresh it on
    /// every peer bridge carrying `bridge`'s relay.
    fn relay_delta_add(
        &self,
        state: &ManagerState,
        bridge: &Jid,
        endpoint_id: &EndpointId,
    ) -> Vec<Iq> {
        let Some(session) = state.sessions.get(bridge) else {
            return Vec::new();
        };
        let Some(relay_id) = &session.relay_id else {
            return Vec::new();
        };
        let Some(record) = session.endpoints.get(endpoint_id) else {
            return Vec::new();
        };
        let endpoint = RelayEndpoint {
            endpoint_id: endpoint_id.to_string(),
            sources: record.sources.sources.iter().cloned().collect(),
            source_groups: record.sources.groups.iter().cloned().collect(),
        };
        state
            .sessions
            .values()
            .filter(|peer| peer.bridge != *bridge && peer.relays.contains(relay_id))
            .map(|peer| {
                Iq::set(
                    peer.bridge.clone(),
                    control::modify_relay(
                        &peer.session_id,
                        relay_id,
                        std::slice::from_ref(&endpoint),
                        &[],
                    ),
                )
            })
            .collect()
    }

    /// Delta: `endpoint_id` (on `bridge`) left; drop it from every peer.
    fn relay_delta_remove(
        &self,
        state: &ManagerState,
        bridge: &Jid,
        endpoint_id: &EndpointId,
    ) -> Vec<Iq> {
        let Some(session) = state.sessions.get(bridge) else {
            return Vec::new();
        };
        let Some(relay_id) = &session.relay_id else {
            return Vec::new();
        };
        state
            .sessions
            .values()
            .filter(|peer| peer.bridge != *bridge && peer.relays.contains(relay_id))
            .map(|peer| {
                Iq::set(
                    peer.bridge.clone(),
                    control::modify_relay(
                        &peer.session_id,
                        relay_id,
                        &[],
                        &[endpoint_id.to_string()],
                    ),
                )
            })
            .collect()
    }

    /// Fire relay/expiry requests without blocking the caller. Failures are
    /// logged; relay state converges on the next delta.
    fn send_control_requests(&self, requests: Vec<Iq>) {
        for iq in requests {
            let adapter = self.adapter.clone();
            let timeout = self.config.allocation_timeout;
            let room = self.room.clone();
            tokio::spawn(async move {
                let to = iq.to.clone();
                match adapter.request_with_timeout(iq, timeout).await {
                    Ok(reply) if reply.is_error() => {
                        warn!(
                            "bridge control request to {:?} for {} answered {:?}",
                            to,
                            room,
                            reply.error_condition()
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("bridge control request to {:?} for {} failed: {}", to, room, err);
                    }
                }
            });
        }
    }

    async fn fail_bridge(&self, bridge: &Jid, tried: &mut HashSet<Jid>) {
        tried.insert(bridge.clone());
        self.state.lock().await.failed.insert(bridge.clone());
    }

    /// Await one control request and translate the outcome.
    async fn bridge_request(&self, iq: Iq) -> Result<Iq, AllocationError> {
        match self
            .adapter
            .request_with_timeout(iq, self.config.allocation_timeout)
            .await
        {
            Ok(reply) if reply.is_error() => Err(AllocationError::BridgeRejected(
                reply
                    .error_condition()
                    .unwrap_or(confocus_xmpp_core::ErrorCondition::InternalServerError),
            )),
            Ok(reply) => Ok(reply),
            Err(RequestError::Timeout) => Err(AllocationError::AllocationTimeout),
            Err(RequestError::Offline) | Err(RequestError::Cancelled) => {
                Err(AllocationError::Cancelled)
            }
        }
    }
}

fn relay_endpoints(endpoints: &HashMap<EndpointId, EndpointRecord>) -> Vec<RelayEndpoint> {
    endpoints
        .iter()
        .map(|(id, record)| RelayEndpoint {
            endpoint_id: id.to_string(),
            sources: record.sources.sources.iter().cloned().collect(),
            source_groups: record.sources.groups.iter().cloned().collect(),
        })
        .collect()
}
