//! In-process signaling bus with retained topics.
//!
//! Frames published on a topic are kept in that topic's log. A new
//! subscriber first drains the log and then follows live frames, so a peer
//! that starts listening late still sees what was written before it arrived.
//! Every frame names its origin; an origin can replace its own earlier frames
//! on a topic and withdraw all of them when it goes away. The log per topic is
//! bounded and drops its oldest frames first.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const TOPIC_CAPACITY: usize = 256;
pub const DEFAULT_RETAIN_LIMIT: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub topic: String,
    pub origin: String,
    pub seq: u64,
    pub payload: Bytes,
}

/// Outcome of a publish: the frame's sequence number in its topic and how
/// many live subscribers received it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub seq: u64,
    pub live_subscribers: usize,
}

/// How a published frame sits in its topic's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
    /// Kept next to the origin's earlier frames.
    Append,
    /// Supersedes the origin's earlier frames on the topic.
    Replace,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus topic {0} closed")]
    Closed(String),
    #[error("bus subscriber lagged by {0} frames")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait SignalBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> BusSubscription;

    fn publish(
        &self,
        topic: &str,
        origin: &str,
        payload: Bytes,
        retain: Retain,
    ) -> BusResult<Delivery>;

    /// Drops every retained frame published by `origin`, on every topic.
    /// Returns how many frames were removed.
    fn withdraw(&self, origin: &str) -> usize;
}

/// Receiver half of a topic: retained backlog first, then live frames.
#[derive(Debug)]
pub struct BusSubscription {
    topic: String,
    backlog: VecDeque<BusFrame>,
    live: broadcast::Receiver<BusFrame>,
}

impl BusSubscription {
    pub fn new(
        topic: impl Into<String>,
        backlog: impl IntoIterator<Item = BusFrame>,
        live: broadcast::Receiver<BusFrame>,
    ) -> Self {
        Self {
            topic: topic.into(),
            backlog: backlog.into_iter().collect(),
            live,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> BusResult<BusFrame> {
        if let Some(frame) = self.backlog.pop_front() {
            return Ok(frame);
        }
        match self.live.recv().await {
            Ok(frame) => Ok(frame),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed(self.topic.clone())),
        }
    }
}

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<BusFrame>,
    retained: VecDeque<BusFrame>,
    next_seq: u64,
}

impl Topic {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(TOPIC_CAPACITY).0,
            retained: VecDeque::new(),
            next_seq: 1,
        }
    }
}

/// Bus shared by every endpoint living in one process; used by tests and by
/// the loopback host.
#[derive(Debug)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, Topic>>,
    retain_limit: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_retain_limit(DEFAULT_RETAIN_LIMIT)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A limit of zero keeps nothing for late subscribers.
    pub fn with_retain_limit(retain_limit: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            retain_limit,
        }
    }

    pub fn retained(&self, topic: &str) -> Vec<BusFrame> {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.retained.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drops a topic with its log. Live subscribers observe
    /// [`BusError::Closed`] once they have drained what they already hold.
    pub fn close(&self, topic: &str) -> bool {
        let removed = self.topics.write().remove(topic).is_some();
        if removed {
            trace!(target = "peerlink::bus", topic, "closed topic");
        }
        removed
    }
}

impl SignalBus for LocalBus {
    fn subscribe(&self, topic: &str) -> BusSubscription {
        let mut guard = self.topics.write();
        let entry = guard.entry(topic.to_string()).or_insert_with(Topic::new);
        // Backlog snapshot and live receiver are taken under one lock, so a
        // frame is seen exactly once.
        let live = entry.sender.subscribe();
        BusSubscription::new(topic, entry.retained.iter().cloned(), live)
    }

    fn publish(
        &self,
        topic: &str,
        origin: &str,
        payload: Bytes,
        retain: Retain,
    ) -> BusResult<Delivery> {
        let mut guard = self.topics.write();
        let entry = guard.entry(topic.to_string()).or_insert_with(Topic::new);
        let seq = entry.next_seq;
        entry.next_seq += 1;
        let frame = BusFrame {
            topic: topic.to_string(),
            origin: origin.to_string(),
            seq,
            payload,
        };
        if retain == Retain::Replace {
            entry.retained.retain(|kept| kept.origin != origin);
        }
        if self.retain_limit > 0 {
            if entry.retained.len() == self.retain_limit {
                if let Some(dropped) = entry.retained.pop_front() {
                    debug!(
                        target = "peerlink::bus",
                        topic,
                        seq = dropped.seq,
                        "retained log full; dropping oldest frame"
                    );
                }
            }
            entry.retained.push_back(frame.clone());
        }
        // No live receivers is fine: the frame stays in the log.
        let live_subscribers = entry.sender.send(frame).unwrap_or(0);
        trace!(
            target = "peerlink::bus",
            topic,
            origin,
            seq,
            live_subscribers,
            "published frame"
        );
        Ok(Delivery {
            seq,
            live_subscribers,
        })
    }

    fn withdraw(&self, origin: &str) -> usize {
        let mut guard = self.topics.write();
        let mut removed = 0;
        for entry in guard.values_mut() {
            let before = entry.retained.len();
            entry.retained.retain(|frame| frame.origin != origin);
            removed += before - entry.retained.len();
        }
        if removed > 0 {
            debug!(target = "peerlink::bus", origin, removed, "withdrew frames");
        }
        removed
    }
}
