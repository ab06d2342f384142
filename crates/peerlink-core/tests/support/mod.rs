#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_bus::LocalBus;
use peerlink_core::mock::MockTransport;
use peerlink_core::{
    BusSignaling, ConfigError, ConfigProvider, NegotiationOrchestrator, PeerId, ServerDescriptor,
    SessionConfig, SessionDeps, SessionEvent, SessionHandle, SignalingChannels,
    StaticConfigProvider,
};
use tokio::sync::{mpsc, Semaphore};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    within(what, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn stun() -> Vec<ServerDescriptor> {
    vec![ServerDescriptor::new("stun:stun.example.org:3478")]
}

pub fn static_provider() -> Arc<dyn ConfigProvider> {
    Arc::new(StaticConfigProvider::new(stun()))
}

/// Holds `fetch` until the test opens the gate.
pub struct GatedProvider {
    servers: Vec<ServerDescriptor>,
    gate: Semaphore,
}

impl GatedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: stun(),
            gate: Semaphore::new(0),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl ConfigProvider for GatedProvider {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ConfigError::Provider("gate closed".into()))?;
        Ok(self.servers.clone())
    }
}

pub struct FailingProvider;

#[async_trait]
impl ConfigProvider for FailingProvider {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        Err(ConfigError::Provider("relay registry unavailable".into()))
    }
}

pub struct Endpoint {
    pub id: PeerId,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub transport: Arc<MockTransport>,
}

pub fn spawn_endpoint(
    bus: &Arc<LocalBus>,
    id: &str,
    provider: Arc<dyn ConfigProvider>,
    transport: MockTransport,
    config: SessionConfig,
) -> Endpoint {
    let id = PeerId::from(id);
    let transport = Arc::new(transport);
    let channels =
        SignalingChannels::from_shared(Arc::new(BusSignaling::new(bus.clone(), id.clone())));
    let deps = SessionDeps {
        config_provider: provider,
        channels,
        transport: transport.clone(),
    };
    let (handle, events) = NegotiationOrchestrator::spawn(deps, config);
    Endpoint {
        id,
        handle,
        events,
        transport,
    }
}

/// Signaling identity driven by the test itself.
pub fn raw_peer(bus: &Arc<LocalBus>, id: &str) -> BusSignaling {
    BusSignaling::new(bus.clone(), PeerId::from(id))
}

pub async fn next_event_matching<P>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    predicate: P,
) -> SessionEvent
where
    P: Fn(&SessionEvent) -> bool,
{
    within("session event", async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("session event stream ended"),
            }
        }
    })
    .await
}
