//! Intermediary signaling channels: offers, answers and candidates.

mod bus;

pub use bus::{BusSignaling, SignalEnvelope};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use peerlink_bus::BusError;
use thiserror::Error;

use crate::model::{
    CandidateEvent, DescriptionEvent, PathCandidate, PeerId, PublishAck, SessionDescription,
    SessionTag,
};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling subscriber lagged by {0} messages")]
    Lagged(u64),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode signaling message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl From<BusError> for ChannelError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed(_) => ChannelError::Closed,
            BusError::Lagged(skipped) => ChannelError::Lagged(skipped),
        }
    }
}

pub type EventStream<T> = BoxStream<'static, Result<T, ChannelError>>;

/// Session descriptions addressed to the local endpoint, and publishing of
/// descriptions addressed to a remote one.
#[async_trait]
pub trait OfferChannel: Send + Sync {
    async fn publish_offer(
        &self,
        remote: &PeerId,
        offer: SessionDescription,
    ) -> Result<PublishAck, ChannelError>;

    fn subscribe_offers(&self) -> EventStream<DescriptionEvent>;
}

/// Answers carry the tag of the offering session they reply to.
#[async_trait]
pub trait AnswerChannel: Send + Sync {
    async fn publish_answer(
        &self,
        remote: &PeerId,
        reply_to: SessionTag,
        answer: SessionDescription,
    ) -> Result<PublishAck, ChannelError>;

    /// Only answers replying to this session's offers.
    fn subscribe_answers(&self) -> EventStream<DescriptionEvent>;
}

/// Candidates are scoped to their sender: `subscribe_candidates(remote, ..)`
/// yields only what `remote` published.
///
/// A candidate names the recipient session when the sender knows it. A
/// subscriber accepts candidates addressed to its own session, and
/// unaddressed ones from `remote_session` once that is known.
#[async_trait]
pub trait CandidateChannel: Send + Sync {
    async fn publish_candidate(
        &self,
        candidate: PathCandidate,
        to: Option<SessionTag>,
    ) -> Result<PublishAck, ChannelError>;

    async fn retract_candidates(
        &self,
        candidates: Vec<PathCandidate>,
        to: Option<SessionTag>,
    ) -> Result<PublishAck, ChannelError>;

    fn subscribe_candidates(
        &self,
        remote: &PeerId,
        remote_session: Option<SessionTag>,
    ) -> EventStream<CandidateEvent>;
}

/// Identity of the session on the intermediary.
#[async_trait]
pub trait ChannelSession: Send + Sync {
    /// Stamped on everything this session publishes.
    fn tag(&self) -> SessionTag;

    /// Removes what this session left on the intermediary, so a later
    /// session never replays it. Returns the number of messages removed.
    async fn withdraw(&self) -> Result<usize, ChannelError>;
}

/// The channels a session talks through.
#[derive(Clone)]
pub struct SignalingChannels {
    pub offers: Arc<dyn OfferChannel>,
    pub answers: Arc<dyn AnswerChannel>,
    pub candidates: Arc<dyn CandidateChannel>,
    pub session: Arc<dyn ChannelSession>,
}

impl SignalingChannels {
    /// Uses one backend for every channel.
    pub fn from_shared<C>(channel: Arc<C>) -> Self
    where
        C: OfferChannel + AnswerChannel + CandidateChannel + ChannelSession + 'static,
    {
        Self {
            offers: channel.clone(),
            answers: channel.clone(),
            candidates: channel.clone(),
            session: channel,
        }
    }
}
