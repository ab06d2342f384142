mod support;

use std::sync::Arc;
use std::time::Duration;

use peerlink_bus::LocalBus;
use peerlink_core::channel::{AnswerChannel, CandidateChannel, OfferChannel};
use peerlink_core::error::SessionFailure;
use peerlink_core::mock::{MockTransport, TransportCall};
use peerlink_core::role::RoleError;
use peerlink_core::{
    ChannelError, ConfigError, ConnectivityState, InitializationState, NegotiationState,
    PathCandidate, PeerId, SessionConfig, SessionDescription, SessionError, SessionEvent,
    SessionRole, SessionTag, TransportError, TransportEvent,
};
use support::*;

fn connected_pair(bus: &Arc<LocalBus>) -> (Endpoint, Endpoint) {
    let alice = spawn_endpoint(
        bus,
        "alice",
        static_provider(),
        MockTransport::new("alice").with_gathered_candidates(2),
        SessionConfig::default(),
    );
    let bob = spawn_endpoint(
        bus,
        "bob",
        static_provider(),
        MockTransport::new("bob").with_gathered_candidates(2),
        SessionConfig::default(),
    );
    (alice, bob)
}

#[tokio::test]
async fn initiate_before_config_creates_exactly_one_offer() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let provider = GatedProvider::new();
    let alice = spawn_endpoint(
        &bus,
        "alice",
        provider.clone(),
        MockTransport::new("alice"),
        SessionConfig::default(),
    );

    alice.handle.initiate("bob").await.expect("initiate");
    let snapshot = alice.handle.snapshot();
    assert!(snapshot.pending_offer);
    assert_eq!(snapshot.initialization, InitializationState::NotStarted);
    assert_eq!(snapshot.state, NegotiationState::LoadingConfig);
    assert_eq!(alice.transport.count(|call| *call == TransportCall::CreateOffer), 0);

    provider.open();
    let snapshot = within(
        "awaiting answer",
        alice.handle.wait_for_state(NegotiationState::AwaitingAnswer),
    )
    .await
    .expect("session alive");
    assert!(!snapshot.pending_offer);
    assert_eq!(snapshot.initialization, InitializationState::Ready);

    let calls = alice.transport.calls();
    let init = calls
        .iter()
        .position(|call| matches!(call, TransportCall::Initialize { .. }))
        .expect("initialised");
    let offer = calls
        .iter()
        .position(|call| *call == TransportCall::CreateOffer)
        .expect("offer created");
    assert!(init < offer);
    assert_eq!(alice.transport.count(|call| *call == TransportCall::CreateOffer), 1);

    eventually("offer published", || {
        bus.retained("peerlink/offers/bob").len() == 1
    })
    .await;

    let err = alice.handle.initiate("carol").await.unwrap_err();
    assert_eq!(
        err,
        SessionError::Role(RoleError::AlreadyAssigned {
            role: SessionRole::Offering,
            remote: PeerId::from("bob"),
        })
    );
    assert_eq!(alice.transport.count(|call| *call == TransportCall::CreateOffer), 1);
}

#[tokio::test]
async fn two_endpoints_reach_connected() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let (alice, bob) = connected_pair(&bus);

    alice.handle.initiate("bob").await.expect("initiate");

    let alice_view = within(
        "alice connected",
        alice.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("alice connected");
    let bob_view = within(
        "bob connected",
        bob.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("bob connected");

    assert_eq!(alice_view.role, SessionRole::Offering);
    assert_eq!(alice_view.remote, Some(PeerId::from("bob")));
    assert_eq!(bob_view.role, SessionRole::Answering);
    assert_eq!(bob_view.remote, Some(PeerId::from("alice")));

    eventually("candidates exchanged", || {
        alice
            .transport
            .count(|call| matches!(call, TransportCall::AddCandidate(_)))
            == 2
            && bob
                .transport
                .count(|call| matches!(call, TransportCall::AddCandidate(_)))
                == 2
    })
    .await;

    assert_eq!(
        bob.transport.count(|call| matches!(
            call,
            TransportCall::HandleRemoteOffer(offer) if offer.sdp == "mock-offer alice #1"
        )),
        1
    );
    assert_eq!(
        alice.transport.count(|call| matches!(
            call,
            TransportCall::HandleRemoteAnswer(answer) if answer.sdp == "mock-answer bob #1"
        )),
        1
    );
    assert_eq!(bob.transport.count(|call| *call == TransportCall::CreateOffer), 0);
}

#[tokio::test]
async fn offer_from_second_peer_is_rejected_as_cross_talk() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let mut bob = spawn_endpoint(
        &bus,
        "bob",
        static_provider(),
        MockTransport::new("bob"),
        SessionConfig::default(),
    );
    let alice = raw_peer(&bus, "alice");
    let carol = raw_peer(&bus, "carol");

    alice
        .publish_offer(&PeerId::from("bob"), SessionDescription::offer("alice offer"))
        .await
        .unwrap();
    within(
        "bob connected",
        bob.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("bob connected");

    carol
        .publish_offer(&PeerId::from("bob"), SessionDescription::offer("carol offer"))
        .await
        .unwrap();
    let event = next_event_matching(&mut bob.events, |event| {
        matches!(event, SessionEvent::CrossTalkRejected { .. })
    })
    .await;
    match event {
        SessionEvent::CrossTalkRejected { active, sender } => {
            assert_eq!(active, PeerId::from("alice"));
            assert_eq!(sender, PeerId::from("carol"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let snapshot = bob.handle.snapshot();
    assert_eq!(snapshot.remote, Some(PeerId::from("alice")));
    assert_eq!(snapshot.state, NegotiationState::Connected);
    assert_eq!(
        bob.transport
            .count(|call| matches!(call, TransportCall::HandleRemoteOffer(_))),
        1
    );
    assert!(bus.retained("peerlink/answers/carol").is_empty());
}

#[tokio::test]
async fn inbound_offer_scopes_candidate_subscription_to_sender() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let alice = raw_peer(&bus, "alice");
    let carol = raw_peer(&bus, "carol");
    carol
        .publish_candidate(PathCandidate::new("carol-host"), None)
        .await
        .unwrap();
    alice
        .publish_candidate(PathCandidate::new("alice-host"), None)
        .await
        .unwrap();

    let bob = spawn_endpoint(
        &bus,
        "bob",
        static_provider(),
        MockTransport::new("bob"),
        SessionConfig::default(),
    );
    within(
        "bob listening",
        bob.handle.wait_for_state(NegotiationState::Listening),
    )
    .await
    .expect("listening");
    assert_eq!(bus.subscriber_count("peerlink/candidates/alice"), 0);

    alice
        .publish_offer(&PeerId::from("bob"), SessionDescription::offer("alice offer"))
        .await
        .unwrap();
    within(
        "bob connected",
        bob.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("connected");

    eventually("alice candidate applied", || {
        bob.transport
            .count(|call| matches!(call, TransportCall::AddCandidate(_)))
            == 1
    })
    .await;
    assert_eq!(
        bob.transport.count(|call| {
            *call == TransportCall::AddCandidate(PathCandidate::new("alice-host"))
        }),
        1
    );
    assert_eq!(bus.subscriber_count("peerlink/candidates/alice"), 1);
    assert_eq!(bus.subscriber_count("peerlink/candidates/carol"), 0);
}

#[tokio::test]
async fn only_initiator_restarts_and_answer_listener_is_reused() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let (alice, mut bob) = connected_pair(&bus);

    alice.handle.initiate("bob").await.expect("initiate");
    within(
        "alice connected",
        alice.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("alice connected");
    within(
        "bob connected",
        bob.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("bob connected");

    assert!(bob
        .transport
        .emit(TransportEvent::Connectivity(ConnectivityState::Disconnected)));
    next_event_matching(&mut bob.events, |event| {
        matches!(
            event,
            SessionEvent::Connectivity(ConnectivityState::Disconnected)
        )
    })
    .await;
    assert_eq!(bob.transport.count(|call| *call == TransportCall::Restart), 0);
    assert_eq!(bob.handle.snapshot().restarts, 0);

    let mut alice_view = alice.handle.watch();
    for round in 1..=2u32 {
        assert!(alice
            .transport
            .emit(TransportEvent::Connectivity(ConnectivityState::Disconnected)));
        within(
            "alice reconnected",
            alice_view.wait_for(|snapshot| {
                snapshot.restarts == round && snapshot.state == NegotiationState::Connected
            }),
        )
        .await
        .expect("session alive");
    }

    assert_eq!(alice.transport.count(|call| *call == TransportCall::Restart), 2);
    assert_eq!(alice.transport.count(|call| *call == TransportCall::CreateOffer), 1);
    assert_eq!(
        bob.transport
            .count(|call| matches!(call, TransportCall::HandleRemoteOffer(_))),
        3
    );
    assert_eq!(bob.transport.count(|call| *call == TransportCall::Restart), 0);
    assert_eq!(bus.subscriber_count("peerlink/answers/alice"), 1);
    assert_eq!(bus.subscriber_count("peerlink/offers/bob"), 1);
}

#[tokio::test]
async fn teardown_silences_session_and_releases_transport() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let (mut alice, _bob) = connected_pair(&bus);

    alice.handle.initiate("bob").await.expect("initiate");
    within(
        "alice connected",
        alice.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("connected");

    within("teardown", alice.handle.teardown()).await;
    assert_eq!(alice.handle.snapshot().state, NegotiationState::TornDown);
    assert!(alice.handle.is_torn_down());

    let calls = alice.transport.calls();
    let detach = calls
        .iter()
        .position(|call| *call == TransportCall::Detach)
        .expect("detached");
    let release = calls
        .iter()
        .position(|call| *call == TransportCall::Release)
        .expect("released");
    assert!(detach < release);

    let mut tail = Vec::new();
    while let Some(event) = within("event stream closed", alice.events.recv()).await {
        tail.push(event);
    }
    assert!(matches!(tail.last(), Some(SessionEvent::TornDown)));

    let before = alice.transport.calls().len();
    assert!(!alice
        .transport
        .emit(TransportEvent::Connectivity(ConnectivityState::Disconnected)));
    raw_peer(&bus, "bob")
        .publish_answer(
            &PeerId::from("alice"),
            alice.handle.tag(),
            SessionDescription::answer("late"),
        )
        .await
        .unwrap();
    raw_peer(&bus, "bob")
        .publish_candidate(PathCandidate::new("late-host"), Some(alice.handle.tag()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.transport.calls().len(), before);
    assert_eq!(bus.subscriber_count("peerlink/answers/alice"), 0);
    assert_eq!(bus.subscriber_count("peerlink/candidates/bob"), 0);

    within("second teardown", alice.handle.teardown()).await;
    assert_eq!(alice.transport.count(|call| *call == TransportCall::Release), 1);
    assert_eq!(
        alice.handle.initiate("carol").await,
        Err(SessionError::TornDown)
    );
}

#[tokio::test]
async fn teardown_before_config_skips_release() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let provider = GatedProvider::new();
    let alice = spawn_endpoint(
        &bus,
        "alice",
        provider.clone(),
        MockTransport::new("alice"),
        SessionConfig::default(),
    );
    alice.handle.initiate("bob").await.expect("initiate");

    within("teardown", alice.handle.teardown()).await;
    provider.open();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(alice.transport.calls(), vec![TransportCall::Detach]);
    let snapshot = alice.handle.snapshot();
    assert_eq!(snapshot.state, NegotiationState::TornDown);
    assert_eq!(snapshot.initialization, InitializationState::NotStarted);
    assert!(!snapshot.pending_offer);
}

#[tokio::test]
async fn config_failure_is_surfaced() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let mut alice = spawn_endpoint(
        &bus,
        "alice",
        Arc::new(FailingProvider),
        MockTransport::new("alice"),
        SessionConfig::default(),
    );

    let event = next_event_matching(&mut alice.events, |event| {
        matches!(event, SessionEvent::Failed(_))
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::Failed(SessionFailure::ConfigFetch(ConfigError::Provider(_)))
    ));

    let err = within(
        "connected never reached",
        alice.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SessionError::Failed(message) if message.contains("relay registry unavailable")));
    assert!(matches!(
        alice.handle.initiate("bob").await,
        Err(SessionError::Failed(_))
    ));

    within("teardown", alice.handle.teardown()).await;
    assert_eq!(alice.transport.calls(), vec![TransportCall::Detach]);
}

#[tokio::test]
async fn offer_listener_failure_is_fatal() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let mut bob = spawn_endpoint(
        &bus,
        "bob",
        static_provider(),
        MockTransport::new("bob"),
        SessionConfig::default(),
    );
    within(
        "bob listening",
        bob.handle.wait_for_state(NegotiationState::Listening),
    )
    .await
    .expect("listening");

    assert!(bus.close("peerlink/offers/bob"));

    let event = next_event_matching(&mut bob.events, |event| {
        matches!(event, SessionEvent::Failed(_))
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::Failed(SessionFailure::ChannelListen {
            kind: "offers",
            source: ChannelError::Closed,
        })
    ));
    assert_eq!(bob.handle.snapshot().state, NegotiationState::Failed);

    within("teardown", bob.handle.teardown()).await;
    assert_eq!(bob.transport.count(|call| *call == TransportCall::Release), 1);
}

#[tokio::test]
async fn transport_error_event_fails_session() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let mut alice = spawn_endpoint(
        &bus,
        "alice",
        static_provider(),
        MockTransport::new("alice"),
        SessionConfig::default(),
    );
    within(
        "alice listening",
        alice.handle.wait_for_state(NegotiationState::Listening),
    )
    .await
    .expect("listening");

    assert!(alice
        .transport
        .emit(TransportEvent::Error(TransportError::Backend("dtls alert".into()))));

    let event = next_event_matching(&mut alice.events, |event| {
        matches!(event, SessionEvent::Failed(_))
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::Failed(SessionFailure::Transport(TransportError::Backend(_)))
    ));
    let snapshot = alice.handle.snapshot();
    assert_eq!(snapshot.state, NegotiationState::Failed);
    assert!(snapshot.failure.unwrap_or_default().contains("dtls alert"));
    eventually("offer listener dropped", || {
        bus.subscriber_count("peerlink/offers/alice") == 0
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_times_out() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let mut alice = spawn_endpoint(
        &bus,
        "alice",
        static_provider(),
        MockTransport::new("alice"),
        SessionConfig::default().with_negotiation_timeout(Duration::from_secs(2)),
    );
    alice.handle.initiate("bob").await.expect("initiate");
    within(
        "awaiting answer",
        alice.handle.wait_for_state(NegotiationState::AwaitingAnswer),
    )
    .await
    .expect("awaiting answer");

    let event = next_event_matching(&mut alice.events, |event| {
        matches!(event, SessionEvent::Failed(_))
    })
    .await;
    match event {
        SessionEvent::Failed(SessionFailure::NegotiationTimedOut { remote, elapsed }) => {
            assert_eq!(remote, PeerId::from("bob"));
            assert_eq!(elapsed, Duration::from_secs(2));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(alice.handle.snapshot().state, NegotiationState::Failed);
}

#[tokio::test]
async fn answer_from_unrelated_peer_is_ignored() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let alice = spawn_endpoint(
        &bus,
        "alice",
        static_provider(),
        MockTransport::new("alice"),
        SessionConfig::default(),
    );
    alice.handle.initiate("bob").await.expect("initiate");
    within(
        "awaiting answer",
        alice.handle.wait_for_state(NegotiationState::AwaitingAnswer),
    )
    .await
    .expect("awaiting answer");

    let bob = raw_peer(&bus, "bob");
    bob.publish_answer(
        &PeerId::from("alice"),
        SessionTag::new(),
        SessionDescription::answer("answer to an earlier alice"),
    )
    .await
    .unwrap();
    raw_peer(&bus, "carol")
        .publish_answer(
            &PeerId::from("alice"),
            alice.handle.tag(),
            SessionDescription::answer("carol answer"),
        )
        .await
        .unwrap();
    bob.publish_answer(
        &PeerId::from("alice"),
        alice.handle.tag(),
        SessionDescription::answer("bob answer"),
    )
    .await
    .unwrap();

    within(
        "alice connected",
        alice.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("connected");
    let answers: Vec<TransportCall> = alice
        .transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, TransportCall::HandleRemoteAnswer(_)))
        .collect();
    assert_eq!(
        answers,
        vec![TransportCall::HandleRemoteAnswer(SessionDescription::answer(
            "bob answer"
        ))]
    );
}

#[tokio::test]
async fn remote_candidate_removals_arrive_as_one_batch() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let bob = spawn_endpoint(
        &bus,
        "bob",
        static_provider(),
        MockTransport::new("bob"),
        SessionConfig::default(),
    );
    let alice = raw_peer(&bus, "alice");
    let first = PathCandidate::new("alice-host").with_media("0", 0);
    let second = PathCandidate::new("alice-srflx").with_media("0", 0);

    alice
        .publish_offer(&PeerId::from("bob"), SessionDescription::offer("alice offer"))
        .await
        .unwrap();
    alice.publish_candidate(first.clone(), None).await.unwrap();
    alice.publish_candidate(second.clone(), None).await.unwrap();
    alice
        .retract_candidates(vec![first.clone(), second.clone()], None)
        .await
        .unwrap();

    eventually("removal applied", || {
        bob.transport
            .count(|call| matches!(call, TransportCall::RemoveCandidates(_)))
            == 1
    })
    .await;
    let calls = bob.transport.calls();
    let candidate_calls: Vec<&TransportCall> = calls
        .iter()
        .filter(|call| {
            matches!(
                call,
                TransportCall::AddCandidate(_) | TransportCall::RemoveCandidates(_)
            )
        })
        .collect();
    assert_eq!(
        candidate_calls,
        vec![
            &TransportCall::AddCandidate(first.clone()),
            &TransportCall::AddCandidate(second.clone()),
            &TransportCall::RemoveCandidates(vec![first, second]),
        ]
    );
}

#[tokio::test]
async fn offer_from_remote_while_offering_is_ignored() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let alice = spawn_endpoint(
        &bus,
        "alice",
        static_provider(),
        MockTransport::new("alice"),
        SessionConfig::default(),
    );
    alice.handle.initiate("bob").await.expect("initiate");
    within(
        "awaiting answer",
        alice.handle.wait_for_state(NegotiationState::AwaitingAnswer),
    )
    .await
    .expect("awaiting answer");

    raw_peer(&bus, "bob")
        .publish_offer(&PeerId::from("alice"), SessionDescription::offer("bob offer"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = alice.handle.snapshot();
    assert_eq!(snapshot.role, SessionRole::Offering);
    assert_eq!(snapshot.state, NegotiationState::AwaitingAnswer);
    assert_eq!(snapshot.remote, Some(PeerId::from("bob")));
    assert_eq!(
        alice
            .transport
            .count(|call| matches!(call, TransportCall::HandleRemoteOffer(_))),
        0
    );
    assert!(bus.retained("peerlink/answers/bob").is_empty());
}

#[tokio::test]
async fn fresh_session_ignores_signaling_from_torn_down_sessions() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let (alice, bob) = connected_pair(&bus);

    alice.handle.initiate("bob").await.expect("initiate");
    within(
        "alice connected",
        alice.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("alice connected");
    within(
        "bob connected",
        bob.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .expect("bob connected");

    within("alice teardown", alice.handle.teardown()).await;
    within("bob teardown", bob.handle.teardown()).await;
    for topic in [
        "peerlink/offers/bob",
        "peerlink/answers/alice",
        "peerlink/candidates/alice",
        "peerlink/candidates/bob",
    ] {
        assert!(bus.retained(topic).is_empty(), "{topic} still holds frames");
    }

    let bob_again = spawn_endpoint(
        &bus,
        "bob",
        static_provider(),
        MockTransport::new("bob"),
        SessionConfig::default(),
    );
    within(
        "bob listening again",
        bob_again.handle.wait_for_state(NegotiationState::Listening),
    )
    .await
    .expect("listening");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = bob_again.handle.snapshot();
    assert_eq!(snapshot.state, NegotiationState::Listening);
    assert_eq!(snapshot.role, SessionRole::Undetermined);
    assert_eq!(snapshot.remote, None);
    assert_eq!(
        bob_again
            .transport
            .count(|call| matches!(call, TransportCall::HandleRemoteOffer(_))),
        0
    );
}
