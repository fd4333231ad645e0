//! End-to-end conference flows over an in-process signaling fabric.
//!
//! The harness plays the chat service and the bridges: outbound stanzas
//! from the focus are routed either to scripted fake bridges (which answer
//! control IQs) or to the test body (which plays the participants).

use confocus_bridge_core::control::BRIDGE_NS;
use confocus_bridge_core::{BridgeCatalog, BridgeDetector, BridgeSelector, BridgeStatusExt};
use confocus_conference_core::source::EndpointSourceSet;
use confocus_conference_core::{
    ConferenceConfig, ConferenceProperties, ConferenceServices, EndpointId, FocusManager,
    JingleAction, MemberInfo, RestartLimitConfig, Role, SessionMessage,
};
use confocus_xmpp_core::loopback::LoopbackTransport;
use confocus_xmpp_core::sources::{GroupSemantics, MediaType, Source, SourceGroup, Ssrc};
use confocus_xmpp_core::transport::TransportDescription;
use confocus_xmpp_core::{
    Element, ErrorCondition, Iq, IqType, Jid, OccupantJid, Presence, RoomJid, Stanza, XmppAdapter,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const BREWERY: &str = "brewery@ops.example";
const ROOM: &str = "r@conf.example";

struct FakeBridge {
    jid: Jid,
    requests: Mutex<Vec<Element>>,
    fail: AtomicBool,
}

impl FakeBridge {
    fn new(jid: Jid) -> Arc<Self> {
        Arc::new(Self {
            jid,
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn requests_named(&self, name: &str) -> Vec<Element> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|el| el.name() == name)
            .cloned()
            .collect()
    }

    async fn wait_for_request(&self, name: &str, count: usize) -> Vec<Element> {
        for _ in 0..200 {
            let found = self.requests_named(name);
            if found.len() >= count {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "bridge {} never received {} x{} (saw {:?})",
            self.jid,
            name,
            count,
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|el| el.name().to_string())
                .collect::<Vec<_>>()
        );
    }

    fn reply_for(&self, iq: &Iq) -> Iq {
        if self.fail.load(Ordering::Relaxed) {
            return iq.error_reply(confocus_xmpp_core::StanzaError::new(
                ErrorCondition::ServiceUnavailable,
            ));
        }
        let payload = iq.payload.as_ref().expect("control request has payload");
        if payload.name() == "add-endpoint" {
            let endpoint_id = payload.attribute("endpoint-id").unwrap_or("?");
            let allocation = Element::new("allocation")
                .with_namespace(BRIDGE_NS)
                .attr("endpoint-id", endpoint_id)
                .child(
                    TransportDescription {
                        ufrag: Some(format!("uf-{}", endpoint_id)),
                        pwd: Some("pw".to_string()),
                        fingerprint: Some("AA:BB".to_string()),
                        fingerprint_hash: Some("sha-256".to_string()),
                        candidates: Vec::new(),
                    }
                    .to_element(),
                )
                .child(Element::new("sctp").attr("port", "5000"));
            iq.result_reply_with(allocation)
        } else {
            iq.result_reply()
        }
    }
}

struct Harness {
    adapter: XmppAdapter,
    catalog: Arc<BridgeCatalog>,
    focus: Arc<FocusManager>,
    client_rx: mpsc::UnboundedReceiver<Stanza>,
    /// Stanzas read off the stream but not matched yet; later expectations
    /// scan this before reading more.
    pending: VecDeque<Stanza>,
    bridges: Arc<Mutex<HashMap<Jid, Arc<FakeBridge>>>>,
    next_id: AtomicU64,
    _detector: BridgeDetector,
}

impl Harness {
    async fn new(config: ConferenceConfig) -> Self {
        let (transport, mut sent_rx) = LoopbackTransport::new();
        let adapter = XmppAdapter::new(
            Jid::parse("focus@auth.example/focus").unwrap(),
            Arc::new(transport),
        );
        let catalog = Arc::new(BridgeCatalog::new());
        let selector = Arc::new(BridgeSelector::new(catalog.clone()));
        let detector = BridgeDetector::new(
            adapter.clone(),
            catalog.clone(),
            RoomJid::parse(BREWERY).unwrap(),
            "focus",
        );
        detector.start().unwrap();

        let services = ConferenceServices {
            adapter: adapter.clone(),
            selector,
            catalog: catalog.clone(),
            config: Arc::new(config),
            focus_nick: "focus".to_string(),
        };
        let focus = FocusManager::new(services);
        focus.start().await.unwrap();

        let bridges: Arc<Mutex<HashMap<Jid, Arc<FakeBridge>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (client_tx, client_rx) = mpsc::unbounded_channel();

        // Router: bridge control goes to the fakes, the rest to the test.
        let router_bridges = bridges.clone();
        let router_adapter = adapter.clone();
        tokio::spawn(async move {
            while let Some(stanza) = sent_rx.recv().await {
                match &stanza {
                    Stanza::Iq(iq) if iq.iq_type.is_request() => {
                        let target = iq
                            .to
                            .as_ref()
                            .and_then(|to| router_bridges.lock().unwrap().get(to).cloned());
                        if let Some(bridge) = target {
                            bridge
                                .requests
                                .lock()
                                .unwrap()
                                .push(iq.payload.clone().expect("control payload"));
                            router_adapter.handle_inbound(Stanza::Iq(bridge.reply_for(iq)));
                            continue;
                        }
                        let _ = client_tx.send(stanza);
                    }
                    _ => {
                        let _ = client_tx.send(stanza);
                    }
                }
            }
        });

        Self {
            adapter,
            catalog,
            focus,
            client_rx,
            pending: VecDeque::new(),
            bridges,
            next_id: AtomicU64::new(1),
            _detector: detector,
        }
    }

    /// Return the first stanza matching `pred`, buffering everything else.
    async fn find_stanza(
        &mut self,
        what: &str,
        mut pred: impl FnMut(&Stanza) -> bool,
    ) -> Stanza {
        if let Some(pos) = self.pending.iter().position(|s| pred(s)) {
            return self.pending.remove(pos).unwrap();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                panic!("timed out waiting for {}", what);
            }
            match timeout(remaining, self.client_rx.recv()).await {
                Ok(Some(stanza)) => {
                    if pred(&stanza) {
                        return stanza;
                    }
                    self.pending.push_back(stanza);
                }
                Ok(None) => panic!("stream closed waiting for {}", what),
                Err(_) => panic!("timed out waiting for {}", what),
            }
        }
    }

    fn test_config() -> ConferenceConfig {
        ConferenceConfig {
            start_timeout: Duration::from_secs(30),
            single_participant_timeout: Duration::from_secs(30),
            empty_timeout: Duration::from_secs(30),
            session_accept_timeout: Duration::from_secs(10),
            allocation_timeout: Duration::from_secs(2),
            source_signaling_delay: Duration::from_millis(20),
            restart: RestartLimitConfig {
                min_interval: Duration::ZERO,
                max_requests: 2,
                window: Duration::from_secs(60),
            },
            ..Default::default()
        }
    }

    /// Register a fake bridge and advertise it in the brewery room.
    async fn add_bridge(&self, nick: &str, region: &str, stress: f64, relay_id: &str) -> Arc<FakeBridge> {
        let room = RoomJid::parse(BREWERY).unwrap();
        let occupant = room.occupant(nick);
        let bridge = FakeBridge::new(occupant.jid().clone());
        self.bridges
            .lock()
            .unwrap()
            .insert(occupant.jid().clone(), bridge.clone());

        let status = BridgeStatusExt {
            version: Some("2.3".to_string()),
            region: Some(region.to_string()),
            stress: Some(stress),
            relay_id: Some(relay_id.to_string()),
            ..Default::default()
        };
        self.send_bridge_presence(nick, &status);
        let expected = occupant.jid().clone();
        self.wait_until(|| self.catalog.get(&expected).is_some()).await;
        bridge
    }

    fn send_bridge_presence(&self, nick: &str, status: &BridgeStatusExt) {
        let room = RoomJid::parse(BREWERY).unwrap();
        let occupant = room.occupant(nick);
        let mut presence = Presence::available(room.jid().clone());
        presence.from = Some(occupant.jid().clone());
        for payload in status.to_payloads() {
            presence = presence.with_payload(payload);
        }
        self.adapter.handle_inbound(Stanza::Presence(presence));
    }

    async fn wait_until(&self, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn create_conference(&self) -> RoomJid {
        let room = RoomJid::parse(ROOM).unwrap();
        self.focus
            .get_or_create(&room, ConferenceProperties::default())
            .unwrap();
        room
    }

    fn occupant(&self, nick: &str) -> OccupantJid {
        RoomJid::parse(ROOM).unwrap().occupant(nick)
    }

    fn join_room(&self, nick: &str, region: &str) {
        let occupant = self.occupant(nick);
        let info = MemberInfo {
            role: Some(Role::Participant),
            region: Some(region.to_string()),
            features: Default::default(),
        };
        let mut presence = Presence::available(occupant.room().jid().clone());
        presence.from = Some(occupant.jid().clone());
        let presence = presence.with_payload(info.to_payload());
        self.adapter.handle_inbound(Stanza::Presence(presence));
    }

    fn leave_room(&self, nick: &str) {
        let occupant = self.occupant(nick);
        let mut presence = Presence::unavailable(occupant.room().jid().clone());
        presence.from = Some(occupant.jid().clone());
        self.adapter.handle_inbound(Stanza::Presence(presence));
    }

    /// Wait for an IQ addressed to the given occupant whose session payload
    /// matches `action`.
    async fn expect_session_iq(&mut self, nick: &str, action: JingleAction) -> (Iq, SessionMessage) {
        let target = self.occupant(nick).jid().clone();
        let what = format!("{:?} for {}", action, nick);
        let stanza = self
            .find_stanza(&what, |stanza| {
                matches!(stanza, Stanza::Iq(iq)
                    if iq.to.as_ref() == Some(&target)
                        && iq.iq_type.is_request()
                        && iq.payload
                            .as_ref()
                            .and_then(SessionMessage::from_element)
                            .is_some_and(|m| m.action == action))
            })
            .await;
        let Stanza::Iq(iq) = stanza else { unreachable!() };
        let message = iq
            .payload
            .as_ref()
            .and_then(SessionMessage::from_element)
            .expect("matched above");
        (iq, message)
    }

    /// Assert that no session IQ of `action` arrives for `nick` within a
    /// short window. Everything observed stays buffered.
    async fn expect_no_session_iq(&mut self, nick: &str, action: JingleAction, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.client_rx.recv()).await {
                Ok(Some(stanza)) => self.pending.push_back(stanza),
                _ => break,
            }
        }
        let target = self.occupant(nick).jid().clone();
        let offending = self.pending.iter().any(|stanza| {
            matches!(stanza, Stanza::Iq(iq)
                if iq.to.as_ref() == Some(&target)
                    && iq.payload
                        .as_ref()
                        .and_then(SessionMessage::from_element)
                        .is_some_and(|m| m.action == action))
        });
        assert!(!offending, "unexpected {:?} for {}", action, nick);
    }

    fn ack(&self, iq: &Iq) {
        self.adapter.handle_inbound(Stanza::Iq(iq.result_reply()));
    }

    /// Send a session IQ from a participant and wait for the focus reply.
    async fn send_session_iq(&mut self, nick: &str, message: SessionMessage) -> Iq {
        let id = format!("t-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut iq = Iq::set(self.adapter.jid().clone(), message.to_element());
        iq.id = id.clone();
        iq.from = Some(self.occupant(nick).jid().clone());
        self.adapter.handle_inbound(Stanza::Iq(iq));

        let target = self.occupant(nick).jid().clone();
        let stanza = self
            .find_stanza("session IQ reply", |stanza| {
                matches!(stanza, Stanza::Iq(reply)
                    if reply.id == id && reply.to.as_ref() == Some(&target))
            })
            .await;
        let Stanza::Iq(reply) = stanza else { unreachable!() };
        reply
    }

    /// Drive one participant through offer + accept with the given sources.
    async fn activate(&mut self, nick: &str, sources: EndpointSourceSet) -> SessionMessage {
        let (offer_iq, offer) = self.expect_session_iq(nick, JingleAction::SessionInitiate).await;
        self.ack(&offer_iq);
        let mut accept = SessionMessage::new(JingleAction::SessionAccept, offer.sid.clone());
        accept.contents = vec![confocus_conference_core::negotiation::Content {
            media_type: Some(MediaType::Audio),
            sources,
            transport: Some(TransportDescription {
                ufrag: Some(format!("{}-uf", nick)),
                ..Default::default()
            }),
            sctp_port: None,
        }];
        let reply = self.send_session_iq(nick, accept).await;
        assert_eq!(reply.iq_type, IqType::Result, "accept failed: {:?}", reply.error);
        offer
    }
}

fn audio_source(ssrc: u32) -> Source {
    Source::new(Ssrc(ssrc), MediaType::Audio)
}

fn video_source(ssrc: u32, msid: &str) -> Source {
    Source::new(Ssrc(ssrc), MediaType::Video).with_msid(msid)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_participant_happy_path() {
    let mut h = Harness::new(Harness::test_config()).await;
    let jvb_a = h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    let _jvb_b = h.add_bridge("jvbB", "eu-west", 0.2, "rB").await;

    h.create_conference();
    h.join_room("alice", "us-east");
    let (alice_offer_iq, alice_offer) =
        h.expect_session_iq("alice", JingleAction::SessionInitiate).await;
    h.ack(&alice_offer_iq);

    h.join_room("bob", "eu-west");
    let (bob_offer_iq, bob_offer) =
        h.expect_session_iq("bob", JingleAction::SessionInitiate).await;
    h.ack(&bob_offer_iq);

    // Single-bridge default: both endpoints land on jvbA.
    jvb_a.wait_for_request("create-session", 1).await;
    let adds = jvb_a.wait_for_request("add-endpoint", 2).await;
    let endpoints: Vec<&str> = adds
        .iter()
        .filter_map(|el| el.attribute("endpoint-id"))
        .collect();
    assert!(endpoints.contains(&"alice") && endpoints.contains(&"bob"));

    // Alice accepts with sources A1 (audio) and A2 (video).
    let mut accept = SessionMessage::new(JingleAction::SessionAccept, alice_offer.sid.clone());
    accept.contents = vec![confocus_conference_core::negotiation::Content {
        media_type: Some(MediaType::Audio),
        sources: EndpointSourceSet::from_parts(
            [audio_source(101), video_source(102, "alice-cam")],
            [],
        ),
        transport: Some(TransportDescription::default()),
        sctp_port: None,
    }];
    let reply = h.send_session_iq("alice", accept).await;
    assert_eq!(reply.iq_type, IqType::Result);

    // Bob accepts with B1/B2.
    let mut accept = SessionMessage::new(JingleAction::SessionAccept, bob_offer.sid.clone());
    accept.contents = vec![confocus_conference_core::negotiation::Content {
        media_type: Some(MediaType::Audio),
        sources: EndpointSourceSet::from_parts(
            [audio_source(201), video_source(202, "bob-cam")],
            [],
        ),
        transport: Some(TransportDescription::default()),
        sctp_port: None,
    }];
    let reply = h.send_session_iq("bob", accept).await;
    assert_eq!(reply.iq_type, IqType::Result);

    // Bob learns alice's sources, alice learns bob's.
    let (_, add_to_bob) = h.expect_session_iq("bob", JingleAction::SourceAdd).await;
    let bob_learned = add_to_bob.merged_sources();
    assert!(bob_learned.ssrcs().contains(&Ssrc(101)));
    assert!(bob_learned.ssrcs().contains(&Ssrc(102)));

    let (_, add_to_alice) = h.expect_session_iq("alice", JingleAction::SourceAdd).await;
    let alice_learned = add_to_alice.merged_sources();
    assert!(alice_learned.ssrcs().contains(&Ssrc(201)));
    assert!(alice_learned.ssrcs().contains(&Ssrc(202)));

    // Final map: alice owns {101, 102}, bob owns {201, 202}.
    let conference = h.focus.get(&RoomJid::parse(ROOM).unwrap()).unwrap();
    let map = conference.source_map().await;
    assert_eq!(
        map.get(&EndpointId::new("alice")).unwrap().ssrcs(),
        [Ssrc(101), Ssrc(102)].into_iter().collect()
    );
    assert_eq!(
        map.get(&EndpointId::new("bob")).unwrap().ssrcs(),
        [Ssrc(201), Ssrc(202)].into_iter().collect()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulcast_group_without_msid_is_rejected() {
    let mut h = Harness::new(Harness::test_config()).await;
    h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    h.create_conference();
    h.join_room("alice", "us-east");
    h.activate("alice", EndpointSourceSet::new()).await;

    let mut add = SessionMessage::new(JingleAction::SourceAdd, "ignored".to_string());
    add.contents = vec![confocus_conference_core::negotiation::Content {
        media_type: Some(MediaType::Video),
        sources: EndpointSourceSet::from_parts(
            [
                video_source(1, "cam"),
                video_source(2, "cam"),
                video_source(3, "cam"),
                Source::new(Ssrc(11), MediaType::Video),
            ],
            [
                SourceGroup::new(
                    GroupSemantics::Simulcast,
                    MediaType::Video,
                    vec![Ssrc(1), Ssrc(2), Ssrc(3)],
                ),
                SourceGroup::new(GroupSemantics::Fid, MediaType::Video, vec![Ssrc(1), Ssrc(11)]),
            ],
        ),
        transport: None,
        sctp_port: None,
    }];
    let reply = h.send_session_iq("alice", add).await;
    assert_eq!(reply.iq_type, IqType::Error);
    assert_eq!(reply.error_condition(), Some(ErrorCondition::BadRequest));

    let conference = h.focus.get(&RoomJid::parse(ROOM).unwrap()).unwrap();
    assert!(
        conference.source_map().await.get(&EndpointId::new("alice")).is_none(),
        "map unchanged after rejected add"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_owner_ssrc_conflict_is_rejected() {
    let mut h = Harness::new(Harness::test_config()).await;
    h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    h.create_conference();

    h.join_room("alice", "us-east");
    h.activate("alice", EndpointSourceSet::from_parts([audio_source(1000)], []))
        .await;
    h.join_room("bob", "us-east");
    let (bob_offer_iq, bob_offer) =
        h.expect_session_iq("bob", JingleAction::SessionInitiate).await;
    h.ack(&bob_offer_iq);
    let mut accept = SessionMessage::new(JingleAction::SessionAccept, bob_offer.sid);
    accept.contents = vec![confocus_conference_core::negotiation::Content {
        media_type: Some(MediaType::Audio),
        sources: EndpointSourceSet::from_parts([audio_source(1000)], []),
        transport: None,
        sctp_port: None,
    }];
    let reply = h.send_session_iq("bob", accept).await;
    assert_eq!(reply.iq_type, IqType::Error);
    assert_eq!(reply.error_condition(), Some(ErrorCondition::BadRequest));

    let conference = h.focus.get(&RoomJid::parse(ROOM).unwrap()).unwrap();
    let map = conference.source_map().await;
    assert!(map.get(&EndpointId::new("bob")).is_none());
    assert!(map.get(&EndpointId::new("alice")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_shutdown_grows_a_relay_mesh() {
    let mut h = Harness::new(Harness::test_config()).await;
    let jvb_a = h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    let jvb_b = h.add_bridge("jvbB", "eu-west", 0.2, "rB").await;
    h.create_conference();

    h.join_room("alice", "us-east");
    h.activate(
        "alice",
        EndpointSourceSet::from_parts([audio_source(101)], []),
    )
    .await;
    jvb_a.wait_for_request("add-endpoint", 1).await;
    // Alice's accepted sources reach her bridge.
    jvb_a.wait_for_request("modify-endpoint", 1).await;

    // jvbA starts draining; carol must land elsewhere.
    h.send_bridge_presence(
        "jvbA",
        &BridgeStatusExt {
            version: Some("2.3".to_string()),
            region: Some("us-east".to_string()),
            stress: Some(0.1),
            relay_id: Some("rA".to_string()),
            graceful_shutdown: true,
            ..Default::default()
        },
    );
    let jvb_a_jid = jvb_a.jid.clone();
    h.wait_until(|| {
        h.catalog
            .get(&jvb_a_jid)
            .map(|b| b.graceful_shutdown)
            .unwrap_or(false)
    })
    .await;

    h.join_room("carol", "us-east");
    let (carol_offer_iq, _) = h.expect_session_iq("carol", JingleAction::SessionInitiate).await;
    h.ack(&carol_offer_iq);
    let carol_adds = jvb_b.wait_for_request("add-endpoint", 1).await;
    assert_eq!(carol_adds[0].attribute("endpoint-id"), Some("carol"));

    // Full mesh: alice is mirrored onto jvbB, carol onto jvbA.
    let relays_on_b = jvb_b.wait_for_request("create-relay", 1).await;
    assert_eq!(relays_on_b[0].attribute("relay-id"), Some("rA"));
    let mirrored = relays_on_b[0].find_child("endpoint").unwrap();
    assert_eq!(mirrored.attribute("id"), Some("alice"));
    let mirrored_sources = mirrored.find_child("sources").unwrap();
    assert!(mirrored_sources
        .children()
        .any(|s| s.attribute("ssrc") == Some("101")));

    let relays_on_a = jvb_a.wait_for_request("create-relay", 1).await;
    assert_eq!(relays_on_a[0].attribute("relay-id"), Some("rB"));
    assert_eq!(
        relays_on_a[0].find_child("endpoint").unwrap().attribute("id"),
        Some("carol")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ice_failed_triggers_re_invite() {
    let mut h = Harness::new(Harness::test_config()).await;
    let jvb_a = h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    h.create_conference();
    h.join_room("alice", "us-east");
    let offer = h
        .activate("alice", EndpointSourceSet::from_parts([audio_source(101)], []))
        .await;
    let current_session = offer.bridge_session_id.clone().unwrap();

    // Stale ice-failed is ignored outright.
    let mut stale = SessionMessage::new(JingleAction::SessionInfo, offer.sid.clone());
    stale.ice_failed = true;
    stale.bridge_session_id = Some("cs-stale".to_string());
    let reply = h.send_session_iq("alice", stale).await;
    assert_eq!(reply.iq_type, IqType::Result);
    h.expect_no_session_iq("alice", JingleAction::SessionInitiate, Duration::from_millis(200))
        .await;

    // A current ice-failed re-invites without a terminate IQ.
    let mut failed = SessionMessage::new(JingleAction::SessionInfo, offer.sid.clone());
    failed.ice_failed = true;
    failed.bridge_session_id = Some(current_session);
    let reply = h.send_session_iq("alice", failed).await;
    assert_eq!(reply.iq_type, IqType::Result);

    let (new_offer_iq, new_offer) =
        h.expect_session_iq("alice", JingleAction::SessionInitiate).await;
    h.ack(&new_offer_iq);
    assert_ne!(new_offer.sid, offer.sid, "a fresh session is negotiated");
    // The old endpoint was expired on the bridge before re-allocating.
    jvb_a.wait_for_request("expire-endpoint", 1).await;
    let adds = jvb_a.wait_for_request("add-endpoint", 2).await;
    assert_eq!(adds.len(), 2, "re-invite allocates on the same bridge");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_requests_are_rate_limited() {
    let mut h = Harness::new(Harness::test_config()).await;
    h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    h.create_conference();
    h.join_room("alice", "us-east");
    let (offer_iq, mut offer) =
        h.expect_session_iq("alice", JingleAction::SessionInitiate).await;
    h.ack(&offer_iq);

    // Two restarts are honoured with fresh offers.
    for _ in 0..2 {
        let mut terminate = SessionMessage::new(JingleAction::SessionTerminate, offer.sid.clone());
        terminate.restart = true;
        let reply = h.send_session_iq("alice", terminate).await;
        assert_eq!(reply.iq_type, IqType::Result);
        let (next_iq, next_offer) =
            h.expect_session_iq("alice", JingleAction::SessionInitiate).await;
        h.ack(&next_iq);
        offer = next_offer;
    }

    // The third within the window is refused and the session stays ended.
    let mut terminate = SessionMessage::new(JingleAction::SessionTerminate, offer.sid.clone());
    terminate.restart = true;
    let reply = h.send_session_iq("alice", terminate).await;
    assert_eq!(reply.iq_type, IqType::Error);
    assert_eq!(
        reply.error_condition(),
        Some(ErrorCondition::ResourceConstraint)
    );
    h.expect_no_session_iq("alice", JingleAction::SessionInitiate, Duration::from_millis(300))
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaving_mid_invite_rolls_the_allocation_back() {
    let mut h = Harness::new(Harness::test_config()).await;
    let jvb_a = h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    h.create_conference();
    h.join_room("alice", "us-east");
    let (offer_iq, _) = h.expect_session_iq("alice", JingleAction::SessionInitiate).await;
    h.ack(&offer_iq);

    // Alice leaves before accepting; her endpoint must be expired.
    h.leave_room("alice");
    jvb_a.wait_for_request("expire-endpoint", 1).await;
    jvb_a.wait_for_request("expire-session", 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allocation_fails_over_to_the_next_bridge() {
    let mut h = Harness::new(Harness::test_config()).await;
    let jvb_a = h.add_bridge("jvbA", "us-east", 0.1, "rA").await;
    let jvb_b = h.add_bridge("jvbB", "eu-west", 0.2, "rB").await;
    jvb_a.fail.store(true, Ordering::Relaxed);

    h.create_conference();
    h.join_room("alice", "us-east");
    let (offer_iq, _) = h.expect_session_iq("alice", JingleAction::SessionInitiate).await;
    h.ack(&offer_iq);
    // jvbA refused, jvbB carried the allocation.
    let adds = jvb_b.wait_for_request("add-endpoint", 1).await;
    assert_eq!(adds[0].attribute("endpoint-id"), Some("alice"));
}
