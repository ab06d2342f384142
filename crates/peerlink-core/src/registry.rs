//! Scoped ownership of every subscription and in-flight one-shot task of a
//! session.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::model::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishKind {
    Offer,
    Answer,
    Candidate,
    Retraction,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    RelayConfig,
    Offers,
    Answers,
    Candidates(PeerId),
    Publish(PublishKind),
}

impl SubscriptionKind {
    /// Long-lived listeners, as opposed to one-shot tasks.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            SubscriptionKind::Offers | SubscriptionKind::Answers | SubscriptionKind::Candidates(_)
        )
    }
}

#[derive(Debug)]
struct Entry {
    kind: SubscriptionKind,
    token: CancellationToken,
}

/// Tasks spawned through the registry run until they finish or their token is
/// cancelled, whichever comes first. Every token is a child of the session
/// root, so cancelling the root stops them all without touching the registry.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    root: CancellationToken,
    next_id: u64,
    entries: HashMap<SubscriptionId, Entry>,
    closed: bool,
}

impl SubscriptionRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            next_id: 1,
            entries: HashMap::new(),
            closed: false,
        }
    }

    /// Registers and spawns a task. Returns `None` once the registry is
    /// closed; nothing is spawned in that case.
    pub fn spawn<F, Fut>(&mut self, kind: SubscriptionKind, task: F) -> Option<SubscriptionId>
    where
        F: FnOnce(SubscriptionId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.closed || self.root.is_cancelled() {
            return None;
        }
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let token = self.root.child_token();
        let guard = token.clone();
        let fut = task(id);
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = fut => {}
            }
        });
        trace!(target = "peerlink::orchestrator", %id, ?kind, "subscription opened");
        self.entries.insert(id, Entry { kind, token });
        Some(id)
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        !self.closed && self.entries.contains_key(&id)
    }

    pub fn kind(&self, id: SubscriptionId) -> Option<&SubscriptionKind> {
        self.entries.get(&id).map(|entry| &entry.kind)
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<SubscriptionId>
    where
        P: FnMut(&SubscriptionKind) -> bool,
    {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.kind))
            .map(|(id, _)| *id)
            .min()
    }

    pub fn count<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&SubscriptionKind) -> bool,
    {
        self.entries
            .values()
            .filter(|entry| predicate(&entry.kind))
            .count()
    }

    /// Forgets a task that finished on its own.
    pub fn complete(&mut self, id: SubscriptionId) -> Option<SubscriptionKind> {
        self.entries.remove(&id).map(|entry| entry.kind)
    }

    pub fn cancel(&mut self, id: SubscriptionId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.token.cancel();
                trace!(target = "peerlink::orchestrator", %id, kind = ?entry.kind, "subscription cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_where<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&SubscriptionKind) -> bool,
    {
        let ids: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.kind))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Cancels everything and refuses further spawns.
    pub fn cancel_all(&mut self) -> usize {
        self.closed = true;
        let cancelled = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.token.cancel();
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
