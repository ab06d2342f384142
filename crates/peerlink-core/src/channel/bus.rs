use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use peerlink_bus::{BusSubscription, Retain, SignalBus};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    AnswerChannel, CandidateChannel, ChannelError, ChannelSession, EventStream, OfferChannel,
};
use crate::model::{
    CandidateEvent, DescriptionEvent, PathCandidate, PeerId, PublishAck, SdpKind,
    SessionDescription, SessionTag,
};

/// JSON payload carried by every signaling frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEnvelope {
    Description {
        sender: PeerId,
        session: SessionTag,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<SessionTag>,
        description: SessionDescription,
    },
    CandidateAdded {
        session: SessionTag,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<SessionTag>,
        candidate: PathCandidate,
    },
    CandidatesRemoved {
        session: SessionTag,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<SessionTag>,
        candidates: Vec<PathCandidate>,
    },
}

impl SignalEnvelope {
    pub fn encode(&self) -> Result<Bytes, ChannelError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(ChannelError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(payload).map_err(ChannelError::Decode)
    }
}

/// Whether a candidate frame belongs to the subscribing session.
fn candidate_in_scope(
    local: SessionTag,
    remote_session: Option<SessionTag>,
    session: SessionTag,
    to: Option<SessionTag>,
) -> bool {
    match to {
        Some(to) => to == local,
        None => remote_session == Some(session),
    }
}

/// Signaling channels over a [`SignalBus`], for one session.
///
/// Offers and answers go to `peerlink/{offers,answers}/<recipient>`;
/// candidates go to `peerlink/candidates/<sender>` so a subscriber scopes
/// itself to one remote by topic. Every frame is published under the
/// session's tag: a newer description replaces the session's previous one on
/// its topic, and [`ChannelSession::withdraw`] clears them all.
#[derive(Clone)]
pub struct BusSignaling {
    bus: Arc<dyn SignalBus>,
    local: PeerId,
    session: SessionTag,
}

impl BusSignaling {
    pub fn new(bus: Arc<dyn SignalBus>, local: PeerId) -> Self {
        Self {
            bus,
            local,
            session: SessionTag::new(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn session(&self) -> SessionTag {
        self.session
    }

    pub fn offers_topic(peer: &PeerId) -> String {
        format!("peerlink/offers/{peer}")
    }

    pub fn answers_topic(peer: &PeerId) -> String {
        format!("peerlink/answers/{peer}")
    }

    pub fn candidates_topic(peer: &PeerId) -> String {
        format!("peerlink/candidates/{peer}")
    }

    fn publish(
        &self,
        topic: &str,
        envelope: &SignalEnvelope,
        retain: Retain,
    ) -> Result<PublishAck, ChannelError> {
        let payload = envelope.encode()?;
        let origin = self.session.to_string();
        let delivery = self.bus.publish(topic, &origin, payload, retain)?;
        trace!(
            target = "peerlink::bus",
            topic,
            seq = delivery.seq,
            live = delivery.live_subscribers,
            "signal published"
        );
        Ok(PublishAck { seq: delivery.seq })
    }

    fn describe(&self, description: SessionDescription, reply_to: Option<SessionTag>) -> SignalEnvelope {
        SignalEnvelope::Description {
            sender: self.local.clone(),
            session: self.session,
            reply_to,
            description,
        }
    }

    fn descriptions<F>(&self, topic: String, accept: F) -> EventStream<DescriptionEvent>
    where
        F: Fn(&DescriptionEvent) -> bool + Send + 'static,
    {
        let sub = self.bus.subscribe(&topic);
        decoded(sub, move |envelope| match envelope {
            SignalEnvelope::Description {
                sender,
                session,
                reply_to,
                description,
            } => Some(DescriptionEvent {
                sender,
                session,
                reply_to,
                description,
            })
            .filter(|event| accept(event)),
            _ => None,
        })
    }
}

/// Turns a bus subscription into a typed stream. Frames that fail to decode,
/// do not belong on this topic or belong to another session are skipped; a
/// bus error is yielded once and ends the stream.
fn decoded<T, F>(sub: BusSubscription, map: F) -> EventStream<T>
where
    T: Send + 'static,
    F: Fn(SignalEnvelope) -> Option<T> + Send + 'static,
{
    stream::unfold(Some((sub, map)), |state| async move {
        let (mut sub, map) = state?;
        loop {
            match sub.recv().await {
                Ok(frame) => match SignalEnvelope::decode(&frame.payload) {
                    Ok(envelope) => match map(envelope) {
                        Some(item) => return Some((Ok(item), Some((sub, map)))),
                        None => {
                            debug!(
                                target = "peerlink::bus",
                                topic = %frame.topic,
                                origin = %frame.origin,
                                seq = frame.seq,
                                "signal not meant for this session; skipping"
                            );
                        }
                    },
                    Err(err) => {
                        warn!(
                            target = "peerlink::bus",
                            topic = %frame.topic,
                            seq = frame.seq,
                            error = %err,
                            "undecodable signal; skipping"
                        );
                    }
                },
                Err(err) => return Some((Err(ChannelError::from(err)), None)),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl OfferChannel for BusSignaling {
    async fn publish_offer(
        &self,
        remote: &PeerId,
        offer: SessionDescription,
    ) -> Result<PublishAck, ChannelError> {
        self.publish(
            &Self::offers_topic(remote),
            &self.describe(offer, None),
            Retain::Replace,
        )
    }

    fn subscribe_offers(&self) -> EventStream<DescriptionEvent> {
        self.descriptions(Self::offers_topic(&self.local), |event| {
            event.description.kind == SdpKind::Offer
        })
    }
}

#[async_trait]
impl AnswerChannel for BusSignaling {
    async fn publish_answer(
        &self,
        remote: &PeerId,
        reply_to: SessionTag,
        answer: SessionDescription,
    ) -> Result<PublishAck, ChannelError> {
        self.publish(
            &Self::answers_topic(remote),
            &self.describe(answer, Some(reply_to)),
            Retain::Replace,
        )
    }

    fn subscribe_answers(&self) -> EventStream<DescriptionEvent> {
        let local = self.session;
        self.descriptions(Self::answers_topic(&self.local), move |event| {
            event.description.kind == SdpKind::Answer && event.reply_to == Some(local)
        })
    }
}

#[async_trait]
impl CandidateChannel for BusSignaling {
    async fn publish_candidate(
        &self,
        candidate: PathCandidate,
        to: Option<SessionTag>,
    ) -> Result<PublishAck, ChannelError> {
        self.publish(
            &Self::candidates_topic(&self.local),
            &SignalEnvelope::CandidateAdded {
                session: self.session,
                to,
                candidate,
            },
            Retain::Append,
        )
    }

    async fn retract_candidates(
        &self,
        candidates: Vec<PathCandidate>,
        to: Option<SessionTag>,
    ) -> Result<PublishAck, ChannelError> {
        self.publish(
            &Self::candidates_topic(&self.local),
            &SignalEnvelope::CandidatesRemoved {
                session: self.session,
                to,
                candidates,
            },
            Retain::Append,
        )
    }

    fn subscribe_candidates(
        &self,
        remote: &PeerId,
        remote_session: Option<SessionTag>,
    ) -> EventStream<CandidateEvent> {
        let local = self.session;
        let sub = self.bus.subscribe(&Self::candidates_topic(remote));
        decoded(sub, move |envelope| match envelope {
            SignalEnvelope::CandidateAdded {
                session,
                to,
                candidate,
            } if candidate_in_scope(local, remote_session, session, to) => {
                Some(CandidateEvent::Added(candidate))
            }
            SignalEnvelope::CandidatesRemoved {
                session,
                to,
                candidates,
            } if candidate_in_scope(local, remote_session, session, to) => {
                Some(CandidateEvent::Removed(candidates))
            }
            _ => None,
        })
    }
}

#[async_trait]
impl ChannelSession for BusSignaling {
    fn tag(&self) -> SessionTag {
        self.session
    }

    async fn withdraw(&self) -> Result<usize, ChannelError> {
        Ok(self.bus.withdraw(&self.session.to_string()))
    }
}
