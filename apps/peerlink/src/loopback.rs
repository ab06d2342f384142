//! Two endpoints in one process, negotiating over a shared [`LocalBus`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use peerlink_bus::LocalBus;
use peerlink_core::mock::MockTransport;
use peerlink_core::{
    BusSignaling, ConfigError, ConfigProvider, ConnectivityState, HttpConfigProvider,
    NegotiationOrchestrator, NegotiationState, PeerId, SessionDeps, SessionError, SessionEvent,
    SessionHandle, SessionSnapshot, SignalingChannels, StaticConfigProvider, Transport,
    TransportEvent,
};
use peerlink_webrtc::WebRtcTransport;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AppConfig, RelaySource, TransportKind};

const GATHERED_MOCK_CANDIDATES: usize = 2;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{peer}: {source}")]
    Session {
        peer: PeerId,
        #[source]
        source: SessionError,
    },
    #[error("{peer} not connected within {timeout:?}")]
    TimedOut { peer: PeerId, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct LoopbackReport {
    pub initiator: SessionSnapshot,
    pub responder: SessionSnapshot,
    pub elapsed: Duration,
}

struct Endpoint {
    id: PeerId,
    handle: SessionHandle,
    mock: Option<Arc<MockTransport>>,
    _events: JoinHandle<()>,
}

fn relay_provider(relay: &RelaySource) -> Result<Arc<dyn ConfigProvider>, ConfigError> {
    Ok(match relay {
        RelaySource::Static(urls) => Arc::new(StaticConfigProvider::from_urls(urls.clone())),
        RelaySource::Http { url, token } => {
            let provider = HttpConfigProvider::new(url)?;
            match token {
                Some(token) => Arc::new(provider.with_token(token.clone())),
                None => Arc::new(provider),
            }
        }
    })
}

fn log_events(peer: PeerId, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { from, to } => {
                    info!(peer = %peer, %from, %to, "state changed")
                }
                SessionEvent::RoleAssigned { role, remote } => {
                    info!(peer = %peer, %role, remote = %remote, "role assigned")
                }
                SessionEvent::CrossTalkRejected { active, sender } => {
                    warn!(peer = %peer, active = %active, sender = %sender, "cross-talk rejected")
                }
                SessionEvent::Connectivity(state) => {
                    info!(peer = %peer, connectivity = %state, "transport connectivity")
                }
                SessionEvent::Failed(failure) => {
                    warn!(peer = %peer, error = %failure, "session failed")
                }
                SessionEvent::TornDown => info!(peer = %peer, "session torn down"),
            }
        }
    })
}

fn spawn_endpoint(
    bus: &Arc<LocalBus>,
    id: &PeerId,
    config: &AppConfig,
    provider: Arc<dyn ConfigProvider>,
) -> Endpoint {
    let (transport, mock): (Arc<dyn Transport>, Option<Arc<MockTransport>>) =
        match config.transport {
            TransportKind::Mock => {
                let mock = Arc::new(
                    MockTransport::new(id.as_str())
                        .with_gathered_candidates(GATHERED_MOCK_CANDIDATES),
                );
                (mock.clone(), Some(mock))
            }
            TransportKind::Webrtc => (Arc::new(WebRtcTransport::new()), None),
        };
    let channels =
        SignalingChannels::from_shared(Arc::new(BusSignaling::new(bus.clone(), id.clone())));
    let deps = SessionDeps {
        config_provider: provider,
        channels,
        transport,
    };
    let (handle, events) = NegotiationOrchestrator::spawn(deps, config.session.clone());
    Endpoint {
        id: id.clone(),
        handle,
        mock,
        _events: log_events(id.clone(), events),
    }
}

async fn wait_connected(
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<SessionSnapshot, LoopbackError> {
    match tokio::time::timeout(
        timeout,
        endpoint.handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    {
        Ok(Ok(snapshot)) => Ok(snapshot),
        Ok(Err(source)) => Err(LoopbackError::Session {
            peer: endpoint.id.clone(),
            source,
        }),
        Err(_) => Err(LoopbackError::TimedOut {
            peer: endpoint.id.clone(),
            timeout,
        }),
    }
}

/// Drops the initiator's link once and waits for the renegotiated session.
async fn exercise_restart(endpoint: &Endpoint, timeout: Duration) -> Result<(), LoopbackError> {
    let Some(mock) = &endpoint.mock else {
        return Ok(());
    };
    let restarts = endpoint.handle.snapshot().restarts;
    info!(peer = %endpoint.id, "simulating link loss");
    mock.emit(TransportEvent::Connectivity(ConnectivityState::Disconnected));
    let mut view = endpoint.handle.watch();
    let reconnected = view.wait_for(|snapshot| {
        (snapshot.restarts > restarts && snapshot.state == NegotiationState::Connected)
            || snapshot.state == NegotiationState::Failed
    });
    let outcome = match tokio::time::timeout(timeout, reconnected).await {
        Ok(Ok(snapshot)) if snapshot.state == NegotiationState::Connected => Ok(()),
        Ok(Ok(snapshot)) => Err(LoopbackError::Session {
            peer: endpoint.id.clone(),
            source: SessionError::Failed(snapshot.failure.clone().unwrap_or_default()),
        }),
        Ok(Err(_)) => Err(LoopbackError::Session {
            peer: endpoint.id.clone(),
            source: SessionError::TornDown,
        }),
        Err(_) => Err(LoopbackError::TimedOut {
            peer: endpoint.id.clone(),
            timeout,
        }),
    };
    outcome
}

pub async fn run_loopback(config: &AppConfig) -> Result<LoopbackReport, LoopbackError> {
    let started = Instant::now();
    let bus = Arc::new(LocalBus::new());
    let provider = relay_provider(&config.relay)?;
    let initiator = spawn_endpoint(&bus, &config.local, config, provider.clone());
    let responder = spawn_endpoint(&bus, &config.remote, config, provider);

    let outcome = async {
        initiator
            .handle
            .initiate(config.remote.clone())
            .await
            .map_err(|source| LoopbackError::Session {
                peer: initiator.id.clone(),
                source,
            })?;
        wait_connected(&initiator, config.connect_timeout).await?;
        wait_connected(&responder, config.connect_timeout).await?;
        if config.simulate_disconnect {
            exercise_restart(&initiator, config.connect_timeout).await?;
        }
        Ok::<_, LoopbackError>(LoopbackReport {
            initiator: initiator.handle.snapshot(),
            responder: responder.handle.snapshot(),
            elapsed: started.elapsed(),
        })
    }
    .await;

    initiator.handle.teardown().await;
    responder.handle.teardown().await;
    outcome
}
