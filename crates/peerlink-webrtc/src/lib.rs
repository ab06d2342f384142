//! [`Transport`] backed by a webrtc-rs peer connection.
//!
//! The offering side opens a reliable control data channel so the offer
//! carries an application section; the answering side accepts whatever
//! channel arrives. Local descriptions, gathered candidates and ICE
//! connectivity changes are reported through the session's transport sink.
//! Remote candidates that show up before the remote description are held and
//! applied once it is set.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_core::{
    ConnectivityState, PathCandidate, ServerDescriptor, SessionDescription, Transport,
    TransportError, TransportEvent, TransportSink,
};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub const DEFAULT_CONTROL_LABEL: &str = "peerlink-control";

#[derive(Debug, Error)]
pub enum WebRtcError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("peer connection not initialised")]
    NotInitialized,
}

impl From<WebRtcError> for TransportError {
    fn from(err: WebRtcError) -> Self {
        match err {
            WebRtcError::NotInitialized => TransportError::NotInitialized,
            WebRtcError::Rtc(err) => TransportError::Backend(err.to_string()),
        }
    }
}

type SharedSink = Arc<Mutex<Option<TransportSink>>>;

fn deliver(sink: &SharedSink, event: TransportEvent) {
    if let Some(sink) = sink.lock().as_ref() {
        let _ = sink.send(event);
    }
}

pub fn ice_servers(servers: &[ServerDescriptor]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

pub fn connectivity(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

/// Remote candidates received ahead of the remote description.
#[derive(Debug, Default)]
struct PendingCandidates {
    held: Vec<PathCandidate>,
}

impl PendingCandidates {
    fn hold(&mut self, candidate: PathCandidate) {
        if !self.held.contains(&candidate) {
            self.held.push(candidate);
        }
    }

    /// Forgets held candidates named in `removed`; returns those that were
    /// not held and so may already be applied.
    fn retract(&mut self, removed: Vec<PathCandidate>) -> Vec<PathCandidate> {
        removed
            .into_iter()
            .filter(|candidate| {
                let before = self.held.len();
                self.held.retain(|held| held != candidate);
                self.held.len() == before
            })
            .collect()
    }

    fn drain(&mut self) -> Vec<PathCandidate> {
        std::mem::take(&mut self.held)
    }

    fn len(&self) -> usize {
        self.held.len()
    }
}

async fn apply_candidate(
    peer: &RTCPeerConnection,
    candidate: PathCandidate,
) -> Result<(), TransportError> {
    peer.add_ice_candidate(RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    })
    .await
    .map_err(|err| TransportError::InvalidCandidate(err.to_string()))
}

pub struct WebRtcTransport {
    control_label: String,
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    sink: SharedSink,
    control: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
    pending: AsyncMutex<PendingCandidates>,
}

impl Default for WebRtcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRtcTransport {
    pub fn new() -> Self {
        Self::with_control_label(DEFAULT_CONTROL_LABEL)
    }

    pub fn with_control_label(label: impl Into<String>) -> Self {
        Self {
            control_label: label.into(),
            peer: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            control: Arc::new(AsyncMutex::new(None)),
            pending: AsyncMutex::new(PendingCandidates::default()),
        }
    }

    /// Remote candidates waiting for the remote description.
    pub async fn pending_candidates(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Control channel, once opened locally or announced by the remote.
    pub async fn control_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.control.lock().await.clone()
    }

    fn peer(&self) -> Result<Arc<RTCPeerConnection>, WebRtcError> {
        self.peer.lock().clone().ok_or(WebRtcError::NotInitialized)
    }

    fn install_handlers(&self, peer: &RTCPeerConnection) {
        let sink = self.sink.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "peerlink::webrtc", "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        trace!(
                            target = "peerlink::webrtc",
                            candidate = %init.candidate,
                            "local candidate"
                        );
                        deliver(
                            &sink,
                            TransportEvent::CandidateDiscovered(PathCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                server_url: None,
                            }),
                        );
                    }
                    Err(err) => {
                        warn!(
                            target = "peerlink::webrtc",
                            error = %err,
                            "failed to serialise local candidate"
                        );
                    }
                }
            })
        }));

        let sink = self.sink.clone();
        peer.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!(target = "peerlink::webrtc", state = ?state, "ice connection state");
                if let Some(state) = connectivity(state) {
                    deliver(&sink, TransportEvent::Connectivity(state));
                }
            })
        }));

        let control = self.control.clone();
        peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let control = control.clone();
            Box::pin(async move {
                debug!(
                    target = "peerlink::webrtc",
                    label = %channel.label(),
                    "remote data channel"
                );
                *control.lock().await = Some(channel);
            })
        }));
    }

    async fn ensure_control_channel(&self, peer: &RTCPeerConnection) -> Result<(), WebRtcError> {
        let mut control = self.control.lock().await;
        if control.is_none() {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = peer
                .create_data_channel(&self.control_label, Some(init))
                .await?;
            *control = Some(channel);
        }
        Ok(())
    }

    /// Sets the remote description and applies every candidate held for it.
    async fn set_remote(
        &self,
        peer: &RTCPeerConnection,
        remote: RTCSessionDescription,
    ) -> Result<(), TransportError> {
        let held = {
            let mut pending = self.pending.lock().await;
            peer.set_remote_description(remote)
                .await
                .map_err(|err| TransportError::InvalidDescription(err.to_string()))?;
            pending.drain()
        };
        if !held.is_empty() {
            debug!(
                target = "peerlink::webrtc",
                count = held.len(),
                "applying held remote candidates"
            );
        }
        for candidate in held {
            if let Err(err) = apply_candidate(peer, candidate).await {
                warn!(
                    target = "peerlink::webrtc",
                    error = %err,
                    "held remote candidate rejected"
                );
            }
        }
        Ok(())
    }

    async fn offer(&self, options: Option<RTCOfferOptions>) -> Result<(), TransportError> {
        let peer = self.peer()?;
        self.ensure_control_channel(&peer).await?;
        let offer = peer.create_offer(options).await.map_err(WebRtcError::from)?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(WebRtcError::from)?;
        deliver(
            &self.sink,
            TransportEvent::LocalOffer(SessionDescription::offer(offer.sdp)),
        );
        Ok(())
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn initialize(
        &self,
        servers: Vec<ServerDescriptor>,
        sink: TransportSink,
    ) -> Result<(), TransportError> {
        if self.peer.lock().is_some() {
            return Err(TransportError::Setup("peer connection already exists".into()));
        }
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: ice_servers(&servers),
            ..Default::default()
        };
        let peer = api
            .new_peer_connection(config)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        *self.sink.lock() = Some(sink);
        self.install_handlers(&peer);
        *self.peer.lock() = Some(Arc::new(peer));
        info!(
            target = "peerlink::webrtc",
            servers = servers.len(),
            "peer connection created"
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<(), TransportError> {
        self.offer(None).await
    }

    async fn handle_remote_offer(&self, offer: SessionDescription) -> Result<(), TransportError> {
        let peer = self.peer()?;
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|err| TransportError::InvalidDescription(err.to_string()))?;
        self.set_remote(&peer, remote).await?;
        let answer = peer.create_answer(None).await.map_err(WebRtcError::from)?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(WebRtcError::from)?;
        deliver(
            &self.sink,
            TransportEvent::LocalAnswer(SessionDescription::answer(answer.sdp)),
        );
        Ok(())
    }

    async fn handle_remote_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<(), TransportError> {
        let peer = self.peer()?;
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|err| TransportError::InvalidDescription(err.to_string()))?;
        self.set_remote(&peer, remote).await
    }

    async fn add_candidate(&self, candidate: PathCandidate) -> Result<(), TransportError> {
        let peer = self.peer()?;
        {
            let mut pending = self.pending.lock().await;
            if peer.remote_description().await.is_none() {
                trace!(
                    target = "peerlink::webrtc",
                    candidate = %candidate.candidate,
                    "holding remote candidate until the remote description is set"
                );
                pending.hold(candidate);
                return Ok(());
            }
        }
        apply_candidate(&peer, candidate).await
    }

    async fn remove_candidates(
        &self,
        candidates: Vec<PathCandidate>,
    ) -> Result<(), TransportError> {
        self.peer()?;
        let requested = candidates.len();
        let applied = self.pending.lock().await.retract(candidates);
        // webrtc-rs has no candidate removal; applied pairs age out on their own.
        debug!(
            target = "peerlink::webrtc",
            requested,
            dropped_held = requested - applied.len(),
            left_applied = applied.len(),
            "remote candidate removal"
        );
        Ok(())
    }

    async fn restart(&self) -> Result<(), TransportError> {
        info!(target = "peerlink::webrtc", "ice restart");
        self.offer(Some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        }))
        .await
    }

    fn detach(&self) {
        self.sink.lock().take();
    }

    async fn release(&self) -> Result<(), TransportError> {
        self.sink.lock().take();
        self.control.lock().await.take();
        self.pending.lock().await.drain();
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            peer.close().await.map_err(WebRtcError::from)?;
            info!(target = "peerlink::webrtc", "peer connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn calls_before_initialize_are_rejected() {
        let transport = WebRtcTransport::new();
        assert!(matches!(
            transport.create_offer().await,
            Err(TransportError::NotInitialized)
        ));
        assert!(matches!(
            transport
                .add_candidate(PathCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host"))
                .await,
            Err(TransportError::NotInitialized)
        ));
        transport.release().await.unwrap();
    }

    #[test]
    fn held_candidates_can_be_retracted_before_flush() {
        let host = PathCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        let srflx = PathCandidate::new("candidate:2 1 udp 1686052607 203.0.113.9 50000 typ srflx");
        let relay = PathCandidate::new("candidate:3 1 udp 41885439 198.51.100.4 3478 typ relay");

        let mut pending = PendingCandidates::default();
        pending.hold(host.clone());
        pending.hold(srflx.clone());
        pending.hold(host.clone());
        assert_eq!(pending.len(), 2);

        let applied = pending.retract(vec![srflx, relay.clone()]);
        assert_eq!(applied, vec![relay]);
        assert_eq!(pending.drain(), vec![host]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn maps_servers_and_states() {
        let servers = ice_servers(&[
            ServerDescriptor::new("stun:stun.example.org:3478"),
            ServerDescriptor::new("turn:relay.example.org:3478").with_credentials("user", "pass"),
        ]);
        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "pass");

        assert_eq!(
            connectivity(RTCIceConnectionState::Disconnected),
            Some(ConnectivityState::Disconnected)
        );
        assert_eq!(connectivity(RTCIceConnectionState::Unspecified), None);
    }

    #[tokio::test]
    #[ignore = "binds UDP sockets for ICE"]
    async fn offer_produces_local_description() {
        let transport = WebRtcTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.initialize(Vec::new(), tx).await.unwrap();
        assert!(matches!(
            transport.initialize(Vec::new(), mpsc::unbounded_channel().0).await,
            Err(TransportError::Setup(_))
        ));

        transport.create_offer().await.unwrap();
        let offer = loop {
            match rx.recv().await {
                Some(TransportEvent::LocalOffer(offer)) => break offer,
                Some(_) => continue,
                None => panic!("sink closed"),
            }
        };
        assert!(offer.sdp.contains("m=application"));
        assert!(transport.control_channel().await.is_some());

        transport.detach();
        transport.release().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "binds UDP sockets for ICE"]
    async fn early_remote_candidates_are_held_until_answer() {
        let offerer = WebRtcTransport::new();
        let answerer = WebRtcTransport::new();
        let (offer_tx, mut offer_rx) = mpsc::unbounded_channel();
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
        offerer.initialize(Vec::new(), offer_tx).await.unwrap();
        answerer.initialize(Vec::new(), answer_tx).await.unwrap();

        offerer.create_offer().await.unwrap();
        let offer = loop {
            match offer_rx.recv().await {
                Some(TransportEvent::LocalOffer(offer)) => break offer,
                Some(_) => continue,
                None => panic!("offerer sink closed"),
            }
        };
        answerer.handle_remote_offer(offer).await.unwrap();
        let mut early = Vec::new();
        let answer = loop {
            match answer_rx.recv().await {
                Some(TransportEvent::LocalAnswer(answer)) => break answer,
                Some(TransportEvent::CandidateDiscovered(candidate)) => early.push(candidate),
                Some(_) => continue,
                None => panic!("answerer sink closed"),
            }
        };
        let early_candidate = match early.pop() {
            Some(candidate) => candidate,
            None => loop {
                match answer_rx.recv().await {
                    Some(TransportEvent::CandidateDiscovered(candidate)) => break candidate,
                    Some(_) => continue,
                    None => panic!("answerer sink closed"),
                }
            },
        };

        offerer.add_candidate(early_candidate).await.unwrap();
        assert_eq!(offerer.pending_candidates().await, 1);
        offerer.handle_remote_answer(answer).await.unwrap();
        assert_eq!(offerer.pending_candidates().await, 0);

        offerer.release().await.unwrap();
        answerer.release().await.unwrap();
    }
}
