//! Seam between the orchestrator and the native media transport.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{PathCandidate, ServerDescriptor, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Completed)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Completed => "completed",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Everything a transport reports back. Delivered in order over one sink.
#[derive(Debug)]
pub enum TransportEvent {
    Connectivity(ConnectivityState),
    CandidateDiscovered(PathCandidate),
    CandidatesRemoved(Vec<PathCandidate>),
    LocalOffer(SessionDescription),
    LocalAnswer(SessionDescription),
    Error(TransportError),
}

pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotInitialized,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport backend error: {0}")]
    Backend(String),
    #[error("transport closed")]
    Closed,
}

/// Native transport driven by the orchestrator.
///
/// Description-producing calls do not return the description: the transport
/// emits [`TransportEvent::LocalOffer`] / [`TransportEvent::LocalAnswer`] on
/// the sink handed to [`Transport::initialize`], keeping a single ordered
/// stream of outputs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(
        &self,
        servers: Vec<ServerDescriptor>,
        sink: TransportSink,
    ) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<(), TransportError>;

    async fn handle_remote_offer(&self, offer: SessionDescription) -> Result<(), TransportError>;

    async fn handle_remote_answer(&self, answer: SessionDescription)
        -> Result<(), TransportError>;

    /// May arrive before the remote description; a transport that cannot
    /// apply it yet holds it until the description is set.
    async fn add_candidate(&self, candidate: PathCandidate) -> Result<(), TransportError>;

    /// Best effort. A backend without candidate removal only forgets
    /// candidates it has not applied yet and returns `Ok` for the rest, which
    /// then age out with their ICE pairs.
    async fn remove_candidates(&self, candidates: Vec<PathCandidate>)
        -> Result<(), TransportError>;

    /// Renegotiates with fresh candidates; emits a new local offer.
    async fn restart(&self) -> Result<(), TransportError>;

    /// Stops delivering events. Called before `release` at teardown.
    fn detach(&self) {}

    async fn release(&self) -> Result<(), TransportError>;
}
