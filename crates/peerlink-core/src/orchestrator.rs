//! Session actor: sequences config loading, role assignment and the
//! offer/answer/candidate exchange for one peer connection.
//!
//! All mutable session state lives in [`SessionActor`], driven by a single
//! tokio task. Collaborators talk to it through channels only: host commands,
//! transport events and deliveries from subscriptions spawned through the
//! [`SubscriptionRegistry`]. Teardown cancels the session token; the actor
//! notices on its next turn, cancels the registry, releases the transport and
//! withdraws what it published so no later session replays it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::channel::{ChannelError, EventStream, SignalingChannels};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionFailure};
use crate::model::{
    CandidateEvent, DescriptionEvent, PathCandidate, PeerId, PublishAck, ServerDescriptor,
    SessionDescription, SessionTag,
};
use crate::path_config::{ConfigError, ConfigProvider, PathConfigLoader};
use crate::registry::{PublishKind, SubscriptionId, SubscriptionKind, SubscriptionRegistry};
use crate::role::{OfferDecision, RoleCoordinator, RoleRejection, SessionRole};
use crate::session::{InitializationState, NegotiationState, SessionEvent, SessionSnapshot};
use crate::transport::{ConnectivityState, Transport, TransportEvent, TransportSink};

/// Collaborators a session is wired to.
#[derive(Clone)]
pub struct SessionDeps {
    pub config_provider: Arc<dyn ConfigProvider>,
    pub channels: SignalingChannels,
    pub transport: Arc<dyn Transport>,
}

enum Command {
    Initiate {
        remote: PeerId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

type StreamItem<T> = Option<Result<T, ChannelError>>;

enum Inbound {
    RelayConfig(Result<Vec<ServerDescriptor>, ConfigError>),
    Offer(StreamItem<DescriptionEvent>),
    Answer(StreamItem<DescriptionEvent>),
    Candidate(StreamItem<CandidateEvent>),
    Published {
        kind: PublishKind,
        result: Result<PublishAck, ChannelError>,
    },
}

struct Delivery {
    id: SubscriptionId,
    item: Inbound,
}

pub struct NegotiationOrchestrator;

impl NegotiationOrchestrator {
    /// Starts a session. The relay config load begins immediately.
    pub fn spawn(
        deps: SessionDeps,
        config: SessionConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let tag = deps.channels.session.tag();
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let actor = SessionActor {
            loader: Arc::new(PathConfigLoader::new(deps.config_provider.clone())),
            deps,
            config,
            cancel: cancel.clone(),
            registry: SubscriptionRegistry::new(cancel.clone()),
            role: RoleCoordinator::new(),
            remote_session: None,
            state: NegotiationState::Idle,
            initialization: InitializationState::NotStarted,
            pending_offer: false,
            restarts: 0,
            failure: None,
            deadline: None,
            inbox: inbox_tx,
            transport_sink: transport_tx,
            events: event_tx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(
            actor
                .run(command_rx, transport_rx, inbox_rx)
                .instrument(info_span!("session", tag = %tag)),
        );

        let handle = SessionHandle {
            tag,
            commands: command_tx,
            snapshot: snapshot_rx,
            cancel,
        };
        (handle, event_rx)
    }
}

/// Host-side handle. Dropping it tears the session down.
pub struct SessionHandle {
    tag: SessionTag,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Takes the offering role towards `remote`. The offer itself is created
    /// as soon as the transport is initialised.
    pub async fn initiate(&self, remote: impl Into<PeerId>) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::TornDown);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Initiate {
                remote: remote.into(),
                reply,
            })
            .map_err(|_| SessionError::TornDown)?;
        rx.await.map_err(|_| SessionError::TornDown)?
    }

    /// Tag this session publishes under on the signaling channels.
    pub fn tag(&self) -> SessionTag {
        self.tag
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Resolves once the session reaches `state`. Fails early if the session
    /// fails or is torn down first.
    pub async fn wait_for_state(
        &self,
        state: NegotiationState,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| {
                snapshot.state == state
                    || snapshot.state == NegotiationState::Failed
                    || snapshot.state.is_terminal()
            })
            .await
            .map_err(|_| SessionError::TornDown)?
            .clone();
        if snapshot.state == state {
            return Ok(snapshot);
        }
        match snapshot.state {
            NegotiationState::Failed => Err(SessionError::Failed(
                snapshot.failure.unwrap_or_else(|| "unknown failure".to_string()),
            )),
            _ => Err(SessionError::TornDown),
        }
    }

    /// Cancels every subscription, detaches and releases the transport.
    /// Resolves once the actor has finished; safe to call repeatedly.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let mut rx = self.snapshot.clone();
        let _ = rx.wait_for(|snapshot| snapshot.state.is_terminal()).await;
    }

    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionActor {
    deps: SessionDeps,
    config: SessionConfig,
    loader: Arc<PathConfigLoader>,
    cancel: CancellationToken,
    registry: SubscriptionRegistry,
    role: RoleCoordinator,
    /// Session of the remote peer, once an offer or answer from it arrived.
    remote_session: Option<SessionTag>,
    state: NegotiationState,
    initialization: InitializationState,
    pending_offer: bool,
    restarts: u32,
    failure: Option<String>,
    deadline: Option<Instant>,
    inbox: mpsc::UnboundedSender<Delivery>,
    transport_sink: TransportSink,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

async fn negotiation_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Forwards a subscription stream into the actor inbox until it errors, ends
/// or the actor goes away.
async fn pump<T>(
    id: SubscriptionId,
    mut stream: EventStream<T>,
    inbox: mpsc::UnboundedSender<Delivery>,
    wrap: fn(StreamItem<T>) -> Inbound,
) {
    loop {
        let item = stream.next().await;
        let done = !matches!(item, Some(Ok(_)));
        if inbox.send(Delivery { id, item: wrap(item) }).is_err() || done {
            return;
        }
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut inbox: mpsc::UnboundedReceiver<Delivery>,
    ) {
        self.load_relay_config();
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                Some(delivery) = inbox.recv() => self.handle_delivery(delivery).await,
                _ = negotiation_deadline(deadline) => self.on_negotiation_timeout(),
                else => break,
            }
            self.publish_snapshot();
        }
        self.shutdown().await;
    }

    fn live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn current_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            role: self.role.role(),
            remote: self.role.remote().cloned(),
            initialization: self.initialization,
            pending_offer: self.pending_offer,
            restarts: self.restarts,
            failure: self.failure.clone(),
        }
    }

    fn publish_snapshot(&self) {
        let next = self.current_snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn transition(&mut self, to: NegotiationState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if to.is_negotiating() {
            if !from.is_negotiating() {
                self.deadline = self
                    .config
                    .negotiation_timeout
                    .map(|timeout| Instant::now() + timeout);
            }
        } else {
            self.deadline = None;
        }
        debug!(
            target = "peerlink::orchestrator",
            %from,
            %to,
            "state transition"
        );
        self.emit(SessionEvent::StateChanged { from, to });
        self.publish_snapshot();
    }

    fn fail(&mut self, failure: SessionFailure) {
        if matches!(
            self.state,
            NegotiationState::Failed | NegotiationState::TornDown
        ) {
            return;
        }
        error!(
            target = "peerlink::orchestrator",
            state = %self.state,
            error = %failure,
            "session failed"
        );
        self.failure = Some(failure.to_string());
        self.pending_offer = false;
        let cancelled = self.registry.cancel_where(SubscriptionKind::is_stream);
        trace!(target = "peerlink::orchestrator", cancelled, "listeners cancelled");
        self.transition(NegotiationState::Failed);
        self.emit(SessionEvent::Failed(failure));
    }

    fn load_relay_config(&mut self) {
        self.transition(NegotiationState::LoadingConfig);
        let loader = self.loader.clone();
        let inbox = self.inbox.clone();
        self.registry
            .spawn(SubscriptionKind::RelayConfig, move |id| async move {
                let result = loader.load().await;
                let _ = inbox.send(Delivery {
                    id,
                    item: Inbound::RelayConfig(result),
                });
            });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate { remote, reply } => {
                let result = self.initiate(remote).await;
                self.publish_snapshot();
                let _ = reply.send(result);
            }
        }
    }

    async fn initiate(&mut self, remote: PeerId) -> Result<(), SessionError> {
        if self.state == NegotiationState::Failed {
            return Err(SessionError::Failed(
                self.failure.clone().unwrap_or_default(),
            ));
        }
        self.role.begin_as_initiator(remote.clone())?;
        info!(
            target = "peerlink::orchestrator",
            remote = %remote,
            "initiating session"
        );
        self.emit(SessionEvent::RoleAssigned {
            role: SessionRole::Offering,
            remote: remote.clone(),
        });
        self.scope_candidates(&remote);
        match self.initialization {
            InitializationState::Ready => self.create_offer().await,
            InitializationState::NotStarted => {
                debug!(
                    target = "peerlink::orchestrator",
                    "transport not ready; deferring offer"
                );
                self.pending_offer = true;
            }
        }
        Ok(())
    }

    async fn create_offer(&mut self) {
        if let Err(err) = self.deps.transport.create_offer().await {
            if self.live() {
                self.fail(SessionFailure::Transport(err));
            }
        }
    }

    async fn on_relay_config(&mut self, result: Result<Vec<ServerDescriptor>, ConfigError>) {
        let servers = match result {
            Ok(servers) => servers,
            Err(err) => {
                self.fail(SessionFailure::ConfigFetch(err));
                return;
            }
        };
        if self.state != NegotiationState::LoadingConfig {
            return;
        }
        debug!(
            target = "peerlink::orchestrator",
            servers = servers.len(),
            "initialising transport"
        );
        if let Err(err) = self
            .deps
            .transport
            .initialize(servers, self.transport_sink.clone())
            .await
        {
            if self.live() {
                self.fail(SessionFailure::Transport(err));
            }
            return;
        }
        if !self.live() {
            return;
        }
        self.initialization = InitializationState::Ready;
        self.open_offer_listener();
        self.transition(NegotiationState::Listening);
        if std::mem::take(&mut self.pending_offer) {
            self.create_offer().await;
        }
    }

    fn open_offer_listener(&mut self) {
        let stream = self.deps.channels.offers.subscribe_offers();
        let inbox = self.inbox.clone();
        self.registry.spawn(SubscriptionKind::Offers, move |id| {
            pump(id, stream, inbox, Inbound::Offer)
        });
    }

    /// Opened once per session; later offers reuse it.
    fn ensure_answer_listener(&mut self) {
        if self
            .registry
            .find(|kind| *kind == SubscriptionKind::Answers)
            .is_some()
        {
            return;
        }
        let stream = self.deps.channels.answers.subscribe_answers();
        let inbox = self.inbox.clone();
        self.registry.spawn(SubscriptionKind::Answers, move |id| {
            pump(id, stream, inbox, Inbound::Answer)
        });
    }

    /// Replaces the candidate subscription with one scoped to `remote`.
    fn scope_candidates(&mut self, remote: &PeerId) {
        let cancelled = self
            .registry
            .cancel_where(|kind| matches!(kind, SubscriptionKind::Candidates(_)));
        if cancelled > 0 {
            debug!(
                target = "peerlink::orchestrator",
                remote = %remote,
                cancelled,
                "re-scoping candidate subscription"
            );
        }
        let stream = self
            .deps
            .channels
            .candidates
            .subscribe_candidates(remote, self.remote_session);
        let inbox = self.inbox.clone();
        self.registry
            .spawn(SubscriptionKind::Candidates(remote.clone()), move |id| {
                pump(id, stream, inbox, Inbound::Candidate)
            });
    }

    fn spawn_publish<F, Fut>(&mut self, kind: PublishKind, publish: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<PublishAck, ChannelError>> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        self.registry
            .spawn(SubscriptionKind::Publish(kind), move |id| async move {
                let result = publish().await;
                let _ = inbox.send(Delivery {
                    id,
                    item: Inbound::Published { kind, result },
                });
            });
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        let Delivery { id, item } = delivery;
        if !self.registry.is_active(id) {
            trace!(
                target = "peerlink::orchestrator",
                %id,
                "dropping event from inactive subscription"
            );
            return;
        }
        match item {
            Inbound::RelayConfig(result) => {
                self.registry.complete(id);
                self.on_relay_config(result).await;
            }
            Inbound::Published { kind, result } => {
                self.registry.complete(id);
                self.on_published(kind, result);
            }
            Inbound::Offer(item) => match item {
                Some(Ok(event)) => self.on_inbound_offer(event).await,
                Some(Err(err)) => self.listen_failed(id, "offers", err),
                None => self.listen_failed(id, "offers", ChannelError::Closed),
            },
            Inbound::Answer(item) => match item {
                Some(Ok(event)) => self.on_inbound_answer(event).await,
                Some(Err(err)) => self.listen_failed(id, "answers", err),
                None => self.listen_failed(id, "answers", ChannelError::Closed),
            },
            Inbound::Candidate(item) => match item {
                Some(Ok(event)) => self.on_remote_candidates(event).await,
                Some(Err(err)) => self.listen_failed(id, "candidates", err),
                None => self.listen_failed(id, "candidates", ChannelError::Closed),
            },
        }
    }

    fn listen_failed(&mut self, id: SubscriptionId, kind: &'static str, source: ChannelError) {
        self.registry.complete(id);
        self.fail(SessionFailure::ChannelListen { kind, source });
    }

    async fn on_inbound_offer(&mut self, event: DescriptionEvent) {
        let DescriptionEvent {
            sender,
            session,
            description,
            ..
        } = event;
        match self.role.on_inbound_offer(&sender) {
            OfferDecision::Accepted => {
                info!(
                    target = "peerlink::orchestrator",
                    remote = %sender,
                    remote_session = %session,
                    "answering inbound offer"
                );
                self.emit(SessionEvent::RoleAssigned {
                    role: SessionRole::Answering,
                    remote: sender.clone(),
                });
                self.remote_session = Some(session);
                self.scope_candidates(&sender);
            }
            OfferDecision::Renegotiate if self.remote_session != Some(session) => {
                info!(
                    target = "peerlink::orchestrator",
                    remote = %sender,
                    remote_session = %session,
                    "remote peer started a new session; re-scoping candidates"
                );
                self.remote_session = Some(session);
                self.scope_candidates(&sender);
            }
            OfferDecision::Renegotiate => {
                debug!(
                    target = "peerlink::orchestrator",
                    remote = %sender,
                    "renegotiation offer"
                );
            }
            OfferDecision::Rejected(RoleRejection::CrossTalk { active, sender }) => {
                warn!(
                    target = "peerlink::orchestrator",
                    active = %active,
                    sender = %sender,
                    "rejecting offer from peer outside this session"
                );
                self.emit(SessionEvent::CrossTalkRejected { active, sender });
                return;
            }
            OfferDecision::Rejected(RoleRejection::Glare { remote }) => {
                warn!(
                    target = "peerlink::orchestrator",
                    remote = %remote,
                    "ignoring offer from remote while offering"
                );
                return;
            }
        }
        self.transition(NegotiationState::AwaitingTransportAnswer);
        if let Err(err) = self.deps.transport.handle_remote_offer(description).await {
            if self.live() {
                self.fail(SessionFailure::Transport(err));
            }
        }
    }

    async fn on_inbound_answer(&mut self, event: DescriptionEvent) {
        if !self.role.accepts_answer_from(&event.sender)
            || self.state != NegotiationState::AwaitingAnswer
        {
            debug!(
                target = "peerlink::orchestrator",
                sender = %event.sender,
                state = %self.state,
                "ignoring answer"
            );
            return;
        }
        self.remote_session = Some(event.session);
        if let Err(err) = self
            .deps
            .transport
            .handle_remote_answer(event.description)
            .await
        {
            if self.live() {
                self.fail(SessionFailure::Transport(err));
            }
            return;
        }
        if self.live() {
            self.transition(NegotiationState::Connected);
        }
    }

    async fn on_remote_candidates(&mut self, event: CandidateEvent) {
        let result = match event {
            CandidateEvent::Added(candidate) => {
                trace!(
                    target = "peerlink::orchestrator",
                    candidate = %candidate.candidate,
                    "remote candidate"
                );
                self.deps.transport.add_candidate(candidate).await
            }
            CandidateEvent::Removed(candidates) => {
                trace!(
                    target = "peerlink::orchestrator",
                    count = candidates.len(),
                    "remote candidates removed"
                );
                self.deps.transport.remove_candidates(candidates).await
            }
        };
        if let Err(err) = result {
            warn!(
                target = "peerlink::orchestrator",
                error = %err,
                "transport rejected remote candidate update"
            );
        }
    }

    fn on_published(&mut self, kind: PublishKind, result: Result<PublishAck, ChannelError>) {
        match result {
            Ok(ack) => {
                trace!(target = "peerlink::orchestrator", ?kind, seq = ack.seq, "publish acknowledged");
                if kind == PublishKind::Answer
                    && self.state == NegotiationState::AwaitingTransportAnswer
                {
                    self.transition(NegotiationState::Connected);
                }
            }
            Err(err) => {
                warn!(
                    target = "peerlink::orchestrator",
                    ?kind,
                    error = %err,
                    "publish failed"
                );
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state == NegotiationState::Failed {
            trace!(target = "peerlink::orchestrator", ?event, "session failed; ignoring transport event");
            return;
        }
        match event {
            TransportEvent::Connectivity(connectivity) => {
                self.on_connectivity(connectivity).await
            }
            TransportEvent::CandidateDiscovered(candidate) => self.publish_candidate(candidate),
            TransportEvent::CandidatesRemoved(candidates) => self.retract_candidates(candidates),
            TransportEvent::LocalOffer(offer) => self.on_local_offer(offer),
            TransportEvent::LocalAnswer(answer) => self.on_local_answer(answer),
            TransportEvent::Error(err) => self.fail(SessionFailure::Transport(err)),
        }
    }

    async fn on_connectivity(&mut self, connectivity: ConnectivityState) {
        debug!(
            target = "peerlink::orchestrator",
            connectivity = %connectivity,
            state = %self.state,
            "transport connectivity"
        );
        self.emit(SessionEvent::Connectivity(connectivity));
        match connectivity {
            connected if connected.is_connected() => {
                if self.state == NegotiationState::AwaitingTransportAnswer {
                    self.transition(NegotiationState::Connected);
                }
            }
            ConnectivityState::Disconnected => {
                if self.role.role() == SessionRole::Offering
                    && self.state == NegotiationState::Connected
                {
                    self.restart().await;
                }
            }
            ConnectivityState::Failed => {
                warn!(
                    target = "peerlink::orchestrator",
                    "transport reports connectivity failure"
                );
            }
            _ => {}
        }
    }

    async fn restart(&mut self) {
        self.restarts += 1;
        info!(
            target = "peerlink::orchestrator",
            restarts = self.restarts,
            "connection lost; restarting negotiation"
        );
        self.transition(NegotiationState::Restarting);
        if let Err(err) = self.deps.transport.restart().await {
            if self.live() {
                self.fail(SessionFailure::Transport(err));
            }
        }
    }

    fn on_local_offer(&mut self, offer: SessionDescription) {
        let Some(remote) = self.role.remote().cloned() else {
            warn!(target = "peerlink::orchestrator", "local offer without a remote; dropping");
            return;
        };
        if self.role.role() != SessionRole::Offering {
            warn!(target = "peerlink::orchestrator", "local offer while answering; dropping");
            return;
        }
        debug!(
            target = "peerlink::orchestrator",
            remote = %remote,
            "publishing offer"
        );
        let channel = self.deps.channels.offers.clone();
        self.spawn_publish(PublishKind::Offer, move || async move {
            channel.publish_offer(&remote, offer).await
        });
        self.ensure_answer_listener();
        self.transition(NegotiationState::AwaitingAnswer);
    }

    fn on_local_answer(&mut self, answer: SessionDescription) {
        let Some(remote) = self.role.remote().cloned() else {
            warn!(target = "peerlink::orchestrator", "local answer without a remote; dropping");
            return;
        };
        if self.role.role() != SessionRole::Answering {
            warn!(target = "peerlink::orchestrator", "local answer while offering; dropping");
            return;
        }
        let Some(reply_to) = self.remote_session else {
            warn!(
                target = "peerlink::orchestrator",
                "local answer without an offering session; dropping"
            );
            return;
        };
        debug!(
            target = "peerlink::orchestrator",
            remote = %remote,
            reply_to = %reply_to,
            "publishing answer"
        );
        let channel = self.deps.channels.answers.clone();
        self.spawn_publish(PublishKind::Answer, move || async move {
            channel.publish_answer(&remote, reply_to, answer).await
        });
    }

    fn publish_candidate(&mut self, candidate: PathCandidate) {
        if self.role.remote().is_none() {
            trace!(
                target = "peerlink::orchestrator",
                "no remote yet; not publishing local candidate"
            );
            return;
        }
        let to = self.remote_session;
        let channel = self.deps.channels.candidates.clone();
        self.spawn_publish(PublishKind::Candidate, move || async move {
            channel.publish_candidate(candidate, to).await
        });
    }

    fn retract_candidates(&mut self, candidates: Vec<PathCandidate>) {
        if self.role.remote().is_none() || candidates.is_empty() {
            return;
        }
        let to = self.remote_session;
        let channel = self.deps.channels.candidates.clone();
        self.spawn_publish(PublishKind::Retraction, move || async move {
            channel.retract_candidates(candidates, to).await
        });
    }

    fn on_negotiation_timeout(&mut self) {
        let elapsed = self.config.negotiation_timeout.unwrap_or(Duration::ZERO);
        self.deadline = None;
        let remote = self
            .role
            .remote()
            .cloned()
            .unwrap_or_else(|| PeerId::from("unknown"));
        self.fail(SessionFailure::NegotiationTimedOut { remote, elapsed });
    }

    async fn shutdown(&mut self) {
        let cancelled = self.registry.cancel_all();
        self.deps.transport.detach();
        let released = self.initialization == InitializationState::Ready;
        if released {
            if let Err(err) = self.deps.transport.release().await {
                warn!(
                    target = "peerlink::orchestrator",
                    error = %err,
                    "transport release failed"
                );
            }
        }
        let withdrawn = match self.deps.channels.session.withdraw().await {
            Ok(withdrawn) => withdrawn,
            Err(err) => {
                warn!(
                    target = "peerlink::orchestrator",
                    error = %err,
                    "failed to withdraw published signals"
                );
                0
            }
        };
        info!(
            target = "peerlink::orchestrator",
            cancelled,
            released,
            withdrawn,
            "session torn down"
        );
        self.pending_offer = false;
        self.transition(NegotiationState::TornDown);
        self.emit(SessionEvent::TornDown);
    }
}
