//! Conference coordination
//!
//! One `Conference` per room: it joins the MUC, turns occupant presence
//! into participant lifecycle, drives the invite pipeline against the
//! bridge session manager, owns the validated source map, and fans source
//! changes out to every participant through coalesced per-participant
//! flushes.
//!
//! All conference state lives behind one async mutex — the conference's
//! serialization domain. The lock is never held across a network round
//! trip: bridge and participant IO happens in follow-up tasks that
//! re-enter the domain when their outcome is known.

use crate::bridge_session::{Allocation, AllocationParams, BridgeSessionManager};
use crate::config::ConferenceConfig;
use crate::errors::AllocationError;
use crate::negotiation::{
    source_map_contents, Content, JingleAction, SessionMessage, TerminateReason,
};
use crate::participant::{
    propagates_sources, MemberInfo, Participant, ParticipantSession, QueuedSessionIq,
    CONFERENCE_NS,
};
use crate::source::{SourceMap, ValidatingSourceMap};
use crate::types::{ConferenceProperties, EndpointId, MeetingId, SessionState};
use confocus_bridge_core::{BridgeCatalog, BridgeSelector};
use confocus_xmpp_core::{
    Element, ErrorCondition, Iq, Jid, MucEvent, OccupantJid, Presence, RoomJid, Stanza,
    StanzaError, XmppAdapter, XmppError,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Process-wide services a conference is constructed over.
#[derive(Clone)]
pub struct ConferenceServices {
    pub adapter: XmppAdapter,
    pub selector: Arc<BridgeSelector>,
    pub catalog: Arc<BridgeCatalog>,
    pub config: Arc<ConferenceConfig>,
    pub focus_nick: String,
}

/// Lifecycle notifications towards the focus manager.
#[derive(Debug, Clone)]
pub enum ConferenceEvent {
    Ended { room: RoomJid, reason: String },
}

struct ConferenceInner {
    participants: HashMap<OccupantJid, Participant>,
    sources: ValidatingSourceMap,
    started: bool,
    ended: bool,
    /// Cleared when the focus loses its privileged role in the room.
    can_manage: bool,
    lifecycle_epoch: u64,
    lifecycle_task: Option<JoinHandle<()>>,
}

/// Work computed under the conference lock and performed outside it.
enum FollowUp {
    /// Push transport/sources for an endpoint to its bridge.
    BridgeUpdate {
        occupant: OccupantJid,
        transport: bool,
        sources: bool,
    },
    /// Expire an endpoint on its bridge.
    BridgeRemove { endpoint: EndpointId },
    /// Schedule a coalesced source flush towards one participant.
    Flush { occupant: OccupantJid, delay: Duration },
    /// Tear down and re-run the invite pipeline for one participant.
    ReInvite { occupant: OccupantJid },
    /// Fire-and-forget stanza.
    Send(Stanza),
}

/// Per-room coordinator.
pub struct Conference {
    room: RoomJid,
    meeting_id: MeetingId,
    props: ConferenceProperties,
    services: ConferenceServices,
    bridges: BridgeSessionManager,
    inner: Mutex<ConferenceInner>,
    events: mpsc::UnboundedSender<ConferenceEvent>,
    created_at: Instant,
    muc_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Conference {
    pub fn new(
        room: RoomJid,
        props: ConferenceProperties,
        services: ConferenceServices,
        events: mpsc::UnboundedSender<ConferenceEvent>,
    ) -> Arc<Self> {
        let meeting_id = props
            .meeting_id
            .clone()
            .map(MeetingId)
            .unwrap_or_else(MeetingId::new);
        let bridges = BridgeSessionManager::new(
            room.clone(),
            meeting_id.clone(),
            services.adapter.clone(),
            services.selector.clone(),
            services.catalog.clone(),
            services.config.clone(),
            props.pinned_bridge_version.clone(),
        );
        let config = &services.config;
        Arc::new(Self {
            room,
            meeting_id,
            bridges,
            inner: Mutex::new(ConferenceInner {
                participants: HashMap::new(),
                sources: ValidatingSourceMap::new(
                    config.max_sources_per_owner,
                    config.max_groups_per_owner,
                ),
                started: false,
                ended: false,
                can_manage: true,
                lifecycle_epoch: 0,
                lifecycle_task: None,
            }),
            props,
            services,
            events,
            created_at: Instant::now(),
            muc_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn room(&self) -> &RoomJid {
        &self.room
    }

    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Join the room and start coordinating.
    pub fn start(self: &Arc<Self>) -> Result<(), XmppError> {
        let events = self
            .services
            .adapter
            .join_muc(&self.room, &self.services.focus_nick)?;
        // Announce conference properties alongside our occupancy.
        let mut presence = Presence::available(
            self.room.occupant(&self.services.focus_nick).jid().clone(),
        );
        presence = presence.with_payload(
            Element::new("conference-properties")
                .with_namespace(CONFERENCE_NS)
                .attr("meeting-id", self.meeting_id.to_string()),
        );
        self.services.adapter.send(Stanza::Presence(presence));

        let conference = self.clone();
        *self.muc_task.lock() = Some(tokio::spawn(async move {
            conference.run_muc_pump(events).await;
        }));

        // Start timeout: the conference must produce an active participant
        // or go away.
        let conference = self.clone();
        let start_timeout = self.services.config.start_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(start_timeout).await;
            let timed_out = {
                let inner = conference.inner.lock().await;
                !inner.started && !inner.ended
            };
            if timed_out {
                info!("conference {} never started", conference.room);
                conference.stop("start timeout").await;
            }
        });

        info!("conference {} created (meeting {})", self.room, self.meeting_id);
        Ok(())
    }

    async fn run_muc_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MucEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                MucEvent::MemberJoined { occupant, presence } => {
                    if occupant.nick() == self.services.focus_nick {
                        continue;
                    }
                    self.on_member_joined(occupant, &presence).await;
                }
                MucEvent::PresenceUpdated { occupant, presence } => {
                    if occupant.nick() == self.services.focus_nick {
                        continue;
                    }
                    self.on_presence_updated(occupant, &presence).await;
                }
                MucEvent::MemberLeft { occupant } => {
                    if occupant.nick() == self.services.focus_nick {
                        // Our own occupancy ended underneath us.
                        self.stop("removed from room").await;
                        continue;
                    }
                    self.on_member_left(occupant).await;
                }
                MucEvent::Message { .. } => {}
            }
        }
        debug!("presence pump for {} finished", self.room);
    }

    async fn on_member_joined(self: &Arc<Self>, occupant: OccupantJid, presence: &Presence) {
        let info = MemberInfo::from_presence(presence);
        {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ended || inner.participants.contains_key(&occupant) {
                return;
            }
            let (iq_tx, iq_rx) = mpsc::unbounded_channel::<QueuedSessionIq>();
            let mut participant =
                Participant::new(occupant.clone(), &info, &self.services.config, iq_tx);
            info!(
                "member {} joined {} (role {}, region {:?})",
                occupant, self.room, participant.role, participant.region
            );

            let conference = self.clone();
            let worker_occupant = occupant.clone();
            tokio::spawn(async move {
                conference.run_iq_worker(worker_occupant, iq_rx).await;
            });
            let conference = self.clone();
            let invite_occupant = occupant.clone();
            participant.invite_task = Some(tokio::spawn(async move {
                conference.invite_flow(invite_occupant).await;
            }));

            inner.participants.insert(occupant, participant);
            self.evaluate_lifecycle(inner);
        }
    }

    async fn on_presence_updated(self: &Arc<Self>, occupant: OccupantJid, presence: &Presence) {
        let info = MemberInfo::from_presence(presence);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(participant) = inner.participants.get_mut(&occupant) {
            if participant.apply_member_info(&info) {
                debug!("{} role is now {}", occupant, participant.role);
            }
        }
    }

    async fn on_member_left(self: &Arc<Self>, occupant: OccupantJid) {
        let removed = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let Some(mut participant) = inner.participants.remove(&occupant) else {
                return;
            };
            // The invite task, if any, is left to finish: it rolls its
            // allocation back when it finds the participant gone.
            if let Some(timer) = participant.accept_timer.take() {
                timer.abort();
            }
            inner.sources.remove_owner(&participant.endpoint_id);
            let flushes = self.flush_follow_ups(inner, Some(&occupant));
            self.evaluate_lifecycle(inner);
            info!("member {} left {}", occupant, self.room);
            Some((participant.endpoint_id.clone(), flushes))
        };
        if let Some((endpoint, flushes)) = removed {
            self.bridges.remove_participant(&endpoint).await;
            for follow_up in flushes {
                self.spawn_follow_up(follow_up);
            }
        }
    }

    /// The invite pipeline: allocate on a bridge, translate the allocation
    /// into an offer, drive the session machine from pending.
    async fn invite_flow(self: Arc<Self>, occupant: OccupantJid) {
        let Some(params) = self.allocation_params(&occupant).await else {
            return;
        };
        let allocation = match self.bridges.allocate(&params).await {
            Ok(allocation) => allocation,
            Err(err) => {
                warn!("invite for {}/{} failed: {}", self.room, occupant, err);
                let mut guard = self.inner.lock().await;
                if let Some(participant) = guard.participants.get_mut(&occupant) {
                    participant.session.state = SessionState::Ended;
                }
                return;
            }
        };

        let offer = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ended || !inner.participants.contains_key(&occupant) {
                // Cancelled mid-flight: roll the allocation back.
                drop(guard);
                self.bridges.remove_participant(&params.endpoint_id).await;
                return;
            }
            Some(self.commit_offer(inner, &occupant, &params, &allocation))
        };
        let Some(Some(offer_iq)) = offer else {
            return;
        };

        // The ack only tells us the offer reached the participant; the
        // session stays pending until session-accept.
        match self.services.adapter.request(offer_iq).await {
            Ok(reply) if reply.is_error() => {
                warn!(
                    "offer to {} rejected: {:?}",
                    occupant,
                    reply.error_condition()
                );
                self.fail_pending_session(&occupant).await;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("offer to {} undeliverable: {}", occupant, err);
                self.fail_pending_session(&occupant).await;
            }
        }
    }

    /// Compute allocation parameters for one participant, or `None` when it
    /// is gone or the conference has ended.
    async fn allocation_params(&self, occupant: &OccupantJid) -> Option<AllocationParams> {
        let guard = self.inner.lock().await;
        if guard.ended {
            return None;
        }
        let participant = guard.participants.get(occupant)?;
        let senders = guard
            .participants
            .values()
            .filter(|p| p.occupant != *occupant && p.role.counts_as_sender())
            .count();
        let config = &self.services.config;
        Some(AllocationParams {
            endpoint_id: participant.endpoint_id.clone(),
            region: participant.region.clone(),
            media: participant.media_types(),
            use_sctp: config.enable_sctp && participant.supports_sctp(),
            start_audio_muted: senders >= config.audio_sender_limit,
            start_video_muted: senders >= config.video_sender_limit,
            sources: guard
                .sources
                .get(&participant.endpoint_id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Record the allocation on the participant's session and build the
    /// offer IQ. Runs under the conference lock.
    fn commit_offer(
        self: &Arc<Self>,
        inner: &mut ConferenceInner,
        occupant: &OccupantJid,
        params: &AllocationParams,
        allocation: &Allocation,
    ) -> Option<Iq> {
        let visible = self.visible_remote_map(inner, &EndpointId::new(occupant.nick()));
        let participant = inner.participants.get_mut(occupant)?;
        if !participant.session.is_pending() {
            participant.session = ParticipantSession::pending();
        }
        participant.session.bridge = Some(allocation.bridge.clone());
        participant.session.bridge_session_id = Some(allocation.bridge_session_id.clone());
        participant.signaled_sources = visible.clone();

        let mut offer = SessionMessage::new(
            JingleAction::SessionInitiate,
            participant.session.sid.clone(),
        );
        offer.bridge_session_id = Some(allocation.bridge_session_id.clone());
        offer.start_audio_muted = params.start_audio_muted;
        offer.start_video_muted = params.start_video_muted;
        let mut contents = source_map_contents(&visible);
        for media in &params.media {
            if !contents.iter().any(|c| c.media_type == Some(*media)) {
                contents.push(Content {
                    media_type: Some(*media),
                    ..Default::default()
                });
            }
        }
        // Bridge-contributed feedback sources ride in the matching content.
        for source in &allocation.endpoint.feedback_sources {
            if let Some(content) = contents
                .iter_mut()
                .find(|c| c.media_type == Some(source.media_type))
            {
                content.sources.sources.insert(source.clone());
            }
        }
        for content in &mut contents {
            content.transport = Some(allocation.endpoint.transport.clone());
        }
        if params.use_sctp {
            if let Some(first) = contents.first_mut() {
                first.sctp_port = allocation.endpoint.sctp_port;
            }
        }
        offer.bundle = contents.len() > 1;
        offer.contents = contents;

        // Response timeout: a session still pending when this fires failed.
        let conference = self.clone();
        let timer_occupant = occupant.clone();
        let sid = participant.session.sid.clone();
        let accept_timeout = self.services.config.session_accept_timeout;
        if let Some(old) = participant.accept_timer.take() {
            old.abort();
        }
        participant.accept_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(accept_timeout).await;
            conference.expire_pending_session(timer_occupant, sid).await;
        }));

        let mut iq = Iq::set(occupant.jid().clone(), offer.to_element());
        iq.from = Some(self.services.adapter.jid().clone());
        Some(iq)
    }

    /// The accept timer fired: if the same session is still pending, the
    /// invite failed.
    async fn expire_pending_session(self: &Arc<Self>, occupant: OccupantJid, sid: String) {
        let expired = {
            let mut guard = self.inner.lock().await;
            match guard.participants.get_mut(&occupant) {
                Some(p) if p.session.is_pending() && p.session.sid == sid => {
                    p.session.state = SessionState::Ended;
                    Some(p.endpoint_id.clone())
                }
                _ => None,
            }
        };
        if let Some(endpoint) = expired {
            warn!("{} never accepted its offer in {}", occupant, self.room);
            self.bridges.remove_participant(&endpoint).await;
        }
    }

    async fn fail_pending_session(&self, occupant: &OccupantJid) {
        let endpoint = {
            let mut guard = self.inner.lock().await;
            guard.participants.get_mut(occupant).and_then(|p| {
                if p.session.is_pending() {
                    p.session.state = SessionState::Ended;
                    Some(p.endpoint_id.clone())
                } else {
                    None
                }
            })
        };
        if let Some(endpoint) = endpoint {
            self.bridges.remove_participant(&endpoint).await;
        }
    }

    /// Entry point for inbound session IQs. Queues onto the participant's
    /// serial worker and resolves once that worker has produced the reply.
    pub async fn handle_session_iq(
        &self,
        occupant: OccupantJid,
        iq: Iq,
        message: SessionMessage,
    ) -> Result<Iq, StanzaError> {
        let reply_rx = {
            let guard = self.inner.lock().await;
            let Some(participant) = guard.participants.get(&occupant) else {
                return Err(StanzaError::new(ErrorCondition::ItemNotFound));
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            participant
                .iq_tx
                .send(QueuedSessionIq {
                    message,
                    reply: reply_tx,
                })
                .map_err(|_| StanzaError::new(ErrorCondition::InternalServerError))?;
            reply_rx
        };
        match reply_rx.await {
            Ok(Ok(())) => Ok(iq.result_reply()),
            Ok(Err(stanza_error)) => Err(stanza_error),
            Err(_) => Err(StanzaError::new(ErrorCondition::InternalServerError)),
        }
    }

    /// Serial per-participant processing: one IQ at a time, reply emitted
    /// before the next is dequeued.
    async fn run_iq_worker(
        self: Arc<Self>,
        occupant: OccupantJid,
        mut rx: mpsc::UnboundedReceiver<QueuedSessionIq>,
    ) {
        while let Some(item) = rx.recv().await {
            let result = self.process_session_message(&occupant, item.message).await;
            let _ = item.reply.send(result);
        }
        debug!("session worker for {} finished", occupant);
    }

    /// Apply one session message under the conference lock. Bridge round
    /// trips and signaling fan-out run as follow-ups after the lock drops.
    async fn process_session_message(
        self: &Arc<Self>,
        occupant: &OccupantJid,
        message: SessionMessage,
    ) -> Result<(), StanzaError> {
        let (result, follow_ups) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ended {
                return Err(StanzaError::new(ErrorCondition::ItemNotFound));
            }
            self.apply_session_message(inner, occupant, message)
        };
        for follow_up in follow_ups {
            self.spawn_follow_up(follow_up);
        }
        result
    }

    fn apply_session_message(
        self: &Arc<Self>,
        inner: &mut ConferenceInner,
        occupant: &OccupantJid,
        message: SessionMessage,
    ) -> (Result<(), StanzaError>, Vec<FollowUp>) {
        let mut follow_ups = Vec::new();
        let Some(participant) = inner.participants.get_mut(occupant) else {
            return (
                Err(StanzaError::new(ErrorCondition::ItemNotFound)),
                follow_ups,
            );
        };
        let endpoint = participant.endpoint_id.clone();

        let result = match message.action {
            JingleAction::SessionAccept => {
                if !participant.session.is_pending() || participant.session.sid != message.sid {
                    return (
                        Err(StanzaError::new(ErrorCondition::UnexpectedRequest)),
                        follow_ups,
                    );
                }
                let proposed = message.merged_sources();
                if !proposed.is_empty() {
                    if !propagates_sources(participant.role) {
                        return (
                            Err(StanzaError::with_text(
                                ErrorCondition::Forbidden,
                                "this role may not send sources",
                            )),
                            follow_ups,
                        );
                    }
                    if let Err(err) = inner.sources.try_add(&endpoint, &proposed) {
                        return (Err(err.to_stanza_error()), follow_ups);
                    }
                }
                let participant = inner
                    .participants
                    .get_mut(occupant)
                    .expect("present above");
                participant.session.state = SessionState::Active;
                participant.session.remote_transport = message.transport().cloned();
                if let Some(timer) = participant.accept_timer.take() {
                    timer.abort();
                }
                inner.started = true;
                info!("session with {} is active in {}", occupant, self.room);

                follow_ups.push(FollowUp::BridgeUpdate {
                    occupant: occupant.clone(),
                    transport: true,
                    sources: true,
                });
                // This participant learns the current conference sources
                // right away; everyone else coalesces the newcomer's.
                follow_ups.push(FollowUp::Flush {
                    occupant: occupant.clone(),
                    delay: Duration::ZERO,
                });
                follow_ups.extend(self.flush_follow_ups(inner, Some(occupant)));
                Ok(())
            }

            JingleAction::SourceAdd | JingleAction::SourceRemove => {
                if !participant.session.is_active() {
                    return (
                        Err(StanzaError::new(ErrorCondition::UnexpectedRequest)),
                        follow_ups,
                    );
                }
                if !propagates_sources(participant.role) {
                    return (
                        Err(StanzaError::with_text(
                            ErrorCondition::Forbidden,
                            "this role may not send sources",
                        )),
                        follow_ups,
                    );
                }
                let proposed = message.merged_sources();
                let outcome = if message.action == JingleAction::SourceAdd {
                    inner.sources.try_add(&endpoint, &proposed)
                } else {
                    inner.sources.try_remove(&endpoint, &proposed)
                };
                match outcome {
                    Ok(_) => {
                        follow_ups.push(FollowUp::BridgeUpdate {
                            occupant: occupant.clone(),
                            transport: false,
                            sources: true,
                        });
                        follow_ups.extend(self.flush_follow_ups(inner, Some(occupant)));
                        Ok(())
                    }
                    Err(err) => Err(err.to_stanza_error()),
                }
            }

            JingleAction::TransportInfo | JingleAction::TransportAccept => {
                if participant.session.is_ended() {
                    return (
                        Err(StanzaError::new(ErrorCondition::UnexpectedRequest)),
                        follow_ups,
                    );
                }
                if let Some(transport) = message.transport() {
                    participant.session.remote_transport = Some(transport.clone());
                    follow_ups.push(FollowUp::BridgeUpdate {
                        occupant: occupant.clone(),
                        transport: true,
                        sources: false,
                    });
                }
                Ok(())
            }

            JingleAction::TransportReject => {
                warn!("{} rejected a transport in {}", occupant, self.room);
                Ok(())
            }

            JingleAction::SessionInfo => {
                if !message.ice_failed {
                    return (Ok(()), follow_ups);
                }
                if !participant
                    .session
                    .matches_bridge_session(message.bridge_session_id.as_deref())
                {
                    debug!("stale ice-failed from {} ignored", occupant);
                    return (Ok(()), follow_ups);
                }
                if participant.limiter.accept() {
                    info!("ice failed for {}; re-inviting", occupant);
                    follow_ups.push(FollowUp::ReInvite {
                        occupant: occupant.clone(),
                    });
                    Ok(())
                } else {
                    follow_ups.extend(self.end_session(inner, occupant, false));
                    Err(StanzaError::with_text(
                        ErrorCondition::ResourceConstraint,
                        "restart rate limit exceeded",
                    ))
                }
            }

            JingleAction::SessionTerminate => {
                if !participant
                    .session
                    .matches_bridge_session(message.bridge_session_id.as_deref())
                {
                    debug!("stale session-terminate from {} ignored", occupant);
                    return (Ok(()), follow_ups);
                }
                if message.restart {
                    if participant.limiter.accept() {
                        follow_ups.extend(self.end_session(inner, occupant, false));
                        follow_ups.push(FollowUp::ReInvite {
                            occupant: occupant.clone(),
                        });
                        Ok(())
                    } else {
                        follow_ups.extend(self.end_session(inner, occupant, false));
                        Err(StanzaError::with_text(
                            ErrorCondition::ResourceConstraint,
                            "restart rate limit exceeded",
                        ))
                    }
                } else {
                    follow_ups.extend(self.end_session(inner, occupant, false));
                    Ok(())
                }
            }

            JingleAction::SessionInitiate
            | JingleAction::TransportReplace => Err(StanzaError::new(
                ErrorCondition::FeatureNotImplemented,
            )),
        };
        (result, follow_ups)
    }

    /// End one participant's session: mark ended, drop its sources, expire
    /// its endpoint, and let everyone else unlearn its streams. The
    /// participant itself stays in the room.
    fn end_session(
        self: &Arc<Self>,
        inner: &mut ConferenceInner,
        occupant: &OccupantJid,
        send_terminate: bool,
    ) -> Vec<FollowUp> {
        let mut follow_ups = Vec::new();
        let Some(participant) = inner.participants.get_mut(occupant) else {
            return follow_ups;
        };
        if participant.session.is_ended() {
            return follow_ups;
        }
        participant.session.state = SessionState::Ended;
        if let Some(timer) = participant.accept_timer.take() {
            timer.abort();
        }
        if send_terminate {
            let mut terminate =
                SessionMessage::new(JingleAction::SessionTerminate, participant.session.sid.clone());
            terminate.reason = Some(TerminateReason::Gone);
            let mut iq = Iq::set(occupant.jid().clone(), terminate.to_element());
            iq.id = format!("st-{}", uuid::Uuid::new_v4());
            iq.from = Some(self.services.adapter.jid().clone());
            follow_ups.push(FollowUp::Send(Stanza::Iq(iq)));
        }
        let endpoint = participant.endpoint_id.clone();
        inner.sources.remove_owner(&endpoint);
        follow_ups.push(FollowUp::BridgeRemove { endpoint });
        follow_ups.extend(self.flush_follow_ups(inner, Some(occupant)));
        follow_ups
    }

    /// Coalesced-flush follow-ups for every active participant except
    /// `except`. Participants with a flush already scheduled are skipped.
    fn flush_follow_ups(
        &self,
        inner: &mut ConferenceInner,
        except: Option<&OccupantJid>,
    ) -> Vec<FollowUp> {
        let delay = self
            .services
            .config
            .flush_delay(inner.participants.len());
        let mut follow_ups = Vec::new();
        for (occupant, participant) in inner.participants.iter_mut() {
            if Some(occupant) == except {
                continue;
            }
            if !participant.session.is_active() || participant.flush_scheduled {
                continue;
            }
            participant.flush_scheduled = true;
            follow_ups.push(FollowUp::Flush {
                occupant: occupant.clone(),
                delay,
            });
        }
        follow_ups
    }

    /// Flush the pending source diff towards one participant: at most one
    /// source-add and one source-remove IQ, nothing when the diff is empty.
    async fn flush_sources(self: &Arc<Self>, occupant: &OccupantJid) {
        let stanzas = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ended {
                return;
            }
            let visible = self.visible_remote_map(inner, &EndpointId::new(occupant.nick()));
            let Some(participant) = inner.participants.get_mut(occupant) else {
                return;
            };
            participant.flush_scheduled = false;
            if !participant.session.is_active() {
                return;
            }
            let diff = visible.diff(&participant.signaled_sources);
            if diff.is_empty() {
                return;
            }
            participant.signaled_sources = visible;

            let mut stanzas = Vec::new();
            // Removes go first so an identifier moving between owners is
            // never momentarily duplicated on the client.
            for (action, map) in [
                (JingleAction::SourceRemove, &diff.to_remove),
                (JingleAction::SourceAdd, &diff.to_add),
            ] {
                if map.is_empty() {
                    continue;
                }
                let mut message = SessionMessage::new(action, participant.session.sid.clone());
                message.contents = source_map_contents(map);
                let mut iq = Iq::set(occupant.jid().clone(), message.to_element());
                iq.id = format!("src-{}", uuid::Uuid::new_v4());
                iq.from = Some(self.services.adapter.jid().clone());
                stanzas.push(Stanza::Iq(iq));
            }
            stanzas
        };
        // Enqueued synchronously, in order, on the adapter's writer.
        for stanza in stanzas {
            self.services.adapter.send(stanza);
        }
    }

    /// The sources `viewer` should know about: everyone else's, minus
    /// owners whose role does not contribute sources.
    fn visible_remote_map(&self, inner: &ConferenceInner, viewer: &EndpointId) -> SourceMap {
        let mut map = inner.sources.snapshot().without_owner(viewer);
        for participant in inner.participants.values() {
            if !propagates_sources(participant.role) {
                map.remove_owner(&participant.endpoint_id);
            }
        }
        map
    }

    fn spawn_follow_up(self: &Arc<Self>, follow_up: FollowUp) {
        match follow_up {
            FollowUp::BridgeUpdate {
                occupant,
                transport,
                sources,
            } => {
                let conference = self.clone();
                tokio::spawn(async move {
                    conference.push_bridge_update(occupant, transport, sources).await;
                });
            }
            FollowUp::BridgeRemove { endpoint } => {
                let conference = self.clone();
                tokio::spawn(async move {
                    conference.bridges.remove_participant(&endpoint).await;
                });
            }
            FollowUp::Flush { occupant, delay } => {
                let conference = self.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    conference.flush_sources(&occupant).await;
                });
            }
            FollowUp::ReInvite { occupant } => {
                let conference = self.clone();
                tokio::spawn(async move {
                    conference.re_invite(occupant).await;
                });
            }
            FollowUp::Send(stanza) => self.services.adapter.send(stanza),
        }
    }

    /// Push one endpoint's current transport/source state to its bridge;
    /// a failing bridge escalates to re-invites for everyone it hosted.
    async fn push_bridge_update(
        self: &Arc<Self>,
        occupant: OccupantJid,
        transport: bool,
        sources: bool,
    ) {
        let (endpoint, remote_transport, source_set, bridge) = {
            let guard = self.inner.lock().await;
            let Some(participant) = guard.participants.get(&occupant) else {
                return;
            };
            (
                participant.endpoint_id.clone(),
                participant.session.remote_transport.clone(),
                guard.sources.get(&participant.endpoint_id).cloned(),
                participant.session.bridge.clone(),
            )
        };
        let transport_ref = if transport {
            remote_transport.as_ref()
        } else {
            None
        };
        let sources_owned = if sources {
            Some(source_set.unwrap_or_default())
        } else {
            None
        };
        match self
            .bridges
            .update_participant(&endpoint, transport_ref, sources_owned.as_ref(), None)
            .await
        {
            Ok(()) => {}
            Err(AllocationError::InvalidBridgeSession(_)) => {
                // The endpoint is no longer allocated; nothing to update.
            }
            Err(err) => {
                warn!("bridge update for {} failed: {}", endpoint, err);
                if let Some(bridge) = bridge {
                    self.handle_bridge_failure(bridge).await;
                }
            }
        }
    }

    /// A bridge stopped serving this conference: every endpoint it hosted
    /// gets re-invited (likely onto a different bridge).
    pub async fn handle_bridge_failure(self: &Arc<Self>, bridge: Jid) {
        let orphans = self.bridges.on_bridge_failed(&bridge).await;
        if orphans.is_empty() {
            return;
        }
        let occupants: Vec<OccupantJid> = {
            let guard = self.inner.lock().await;
            guard
                .participants
                .values()
                .filter(|p| orphans.contains(&p.endpoint_id))
                .map(|p| p.occupant.clone())
                .collect()
        };
        for occupant in occupants {
            let conference = self.clone();
            tokio::spawn(async move {
                conference.re_invite(occupant).await;
            });
        }
    }

    /// Tear the old session down (without signaling the participant) and
    /// run the invite pipeline again.
    async fn re_invite(self: Arc<Self>, occupant: OccupantJid) {
        let endpoint = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ended {
                return;
            }
            let Some(participant) = inner.participants.get_mut(&occupant) else {
                return;
            };
            if let Some(timer) = participant.accept_timer.take() {
                timer.abort();
            }
            participant.session = ParticipantSession::pending();
            participant.endpoint_id.clone()
        };
        self.bridges.remove_participant(&endpoint).await;
        self.invite_flow(occupant).await;
    }

    /// Membership changed: arm or re-arm the idle timers. Any later change
    /// bumps the epoch, so a stale timer fires into nothing.
    fn evaluate_lifecycle(self: &Arc<Self>, inner: &mut ConferenceInner) {
        if inner.ended {
            return;
        }
        inner.lifecycle_epoch += 1;
        let epoch = inner.lifecycle_epoch;
        if let Some(task) = inner.lifecycle_task.take() {
            task.abort();
        }
        let config = &self.services.config;
        let (delay, reason) = match inner.participants.len() {
            0 => (config.empty_timeout, "no remaining participants"),
            1 => (config.single_participant_timeout, "single participant left"),
            _ => return,
        };
        let conference = self.clone();
        inner.lifecycle_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let fire = {
                let guard = conference.inner.lock().await;
                !guard.ended && guard.lifecycle_epoch == epoch
            };
            if fire {
                conference.stop(reason).await;
            }
        }));
    }

    /// Terminal teardown: end every session, expire every bridge session,
    /// leave the room, and tell the focus manager.
    pub async fn stop(self: &Arc<Self>, reason: &str) {
        let terminations = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ended {
                return;
            }
            inner.ended = true;
            if let Some(task) = inner.lifecycle_task.take() {
                task.abort();
            }
            let occupants: Vec<OccupantJid> = inner.participants.keys().cloned().collect();
            let mut terminations = Vec::new();
            for occupant in occupants {
                terminations.extend(self.end_session(inner, &occupant, true));
            }
            for participant in inner.participants.values_mut() {
                participant.abort_tasks();
            }
            inner.participants.clear();
            terminations
        };
        for follow_up in terminations {
            if let FollowUp::Send(stanza) = follow_up {
                self.services.adapter.send(stanza);
            }
        }
        self.bridges.expire_all().await;
        if let Some(task) = self.muc_task.lock().take() {
            task.abort();
        }
        self.services
            .adapter
            .leave_muc(&self.room, &self.services.focus_nick, reason);
        info!("conference {} ended: {}", self.room, reason);
        let _ = self.events.send(ConferenceEvent::Ended {
            room: self.room.clone(),
            reason: reason.to_string(),
        });
    }

    pub async fn participant_count(&self) -> usize {
        self.inner.lock().await.participants.len()
    }

    pub async fn is_started(&self) -> bool {
        self.inner.lock().await.started
    }

    pub async fn is_ended(&self) -> bool {
        self.inner.lock().await.ended
    }

    pub async fn bridge_count(&self) -> usize {
        self.bridges.bridge_count().await
    }

    /// Snapshot of the source map, for tests and the debug surface.
    pub async fn source_map(&self) -> SourceMap {
        self.inner.lock().await.sources.snapshot()
    }

    pub async fn debug_state(&self, full: bool) -> serde_json::Value {
        let inner = self.inner.lock().await;
        let participants: Vec<serde_json::Value> = inner
            .participants
            .values()
            .map(|p| {
                let mut entry = json!({
                    "endpoint": p.endpoint_id.to_string(),
                    "role": p.role.as_str(),
                    "state": format!("{:?}", p.session.state),
                });
                if full {
                    entry["region"] = json!(p.region);
                    entry["bridge"] =
                        json!(p.session.bridge.as_ref().map(|b| b.to_string()));
                    entry["sources"] = json!(inner
                        .sources
                        .get(&p.endpoint_id)
                        .map(|s| s.source_count())
                        .unwrap_or(0));
                }
                entry
            })
            .collect();
        let mut state = json!({
            "room": self.room.to_string(),
            "meeting_id": self.meeting_id.to_string(),
            "started": inner.started,
            "can_manage": inner.can_manage,
            "pinned_bridge_version": self.props.pinned_bridge_version,
            "uptime_seconds": self.created_at.elapsed().as_secs(),
            "participants": participants,
        });
        drop(inner);
        if full {
            state["bridges"] = self.bridges.debug_state().await;
        }
        state
    }
}
