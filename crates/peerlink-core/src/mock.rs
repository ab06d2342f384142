//! Scripted in-memory transport. Records every call and answers with fake
//! descriptions, which is enough to drive full negotiations without a media
//! stack.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::model::{PathCandidate, ServerDescriptor, SessionDescription};
use crate::transport::{ConnectivityState, Transport, TransportError, TransportEvent, TransportSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Initialize { servers: Vec<ServerDescriptor> },
    CreateOffer,
    HandleRemoteOffer(SessionDescription),
    HandleRemoteAnswer(SessionDescription),
    AddCandidate(PathCandidate),
    RemoveCandidates(Vec<PathCandidate>),
    Restart,
    Detach,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Initialize,
    CreateOffer,
    HandleRemoteOffer,
    HandleRemoteAnswer,
    AddCandidate,
    RemoveCandidates,
    Restart,
    Release,
}

#[derive(Default)]
struct MockState {
    calls: Vec<TransportCall>,
    sink: Option<TransportSink>,
    failing: HashSet<MockOp>,
    descriptions: u32,
    candidates: u32,
}

pub struct MockTransport {
    label: String,
    connect_on_answer: bool,
    gathered: usize,
    state: Mutex<MockState>,
    changed: Notify,
}

impl MockTransport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            connect_on_answer: true,
            gathered: 0,
            state: Mutex::new(MockState::default()),
            changed: Notify::new(),
        }
    }

    /// Emit `Connected` right after a remote answer is applied (default on).
    pub fn connect_on_answer(mut self, enabled: bool) -> Self {
        self.connect_on_answer = enabled;
        self
    }

    /// Number of host candidates discovered after each local description.
    pub fn with_gathered_candidates(mut self, count: usize) -> Self {
        self.gathered = count;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Makes every later call of `op` fail with a backend error.
    pub fn fail_call(&self, op: MockOp) {
        self.state.lock().failing.insert(op);
    }

    /// Pushes an event as if the transport produced it. Returns false when
    /// no sink is attached.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let state = self.state.lock();
        match &state.sink {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&TransportCall) -> bool,
    {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Waits until at least `n` recorded calls satisfy `predicate`.
    pub async fn wait_for_calls<P>(&self, n: usize, predicate: P)
    where
        P: Fn(&TransportCall) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            if self.count(&predicate) >= n {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, op: Option<MockOp>, call: TransportCall) -> Result<(), TransportError> {
        let failing = {
            let mut state = self.state.lock();
            state.calls.push(call);
            op.map(|op| state.failing.contains(&op)).unwrap_or(false)
        };
        self.changed.notify_waiters();
        if failing {
            debug!(target = "peerlink::mock", label = %self.label, ?op, "scripted failure");
            return Err(TransportError::Backend(format!(
                "{} scripted failure for {:?}",
                self.label, op
            )));
        }
        Ok(())
    }

    fn require_sink(&self) -> Result<TransportSink, TransportError> {
        self.state
            .lock()
            .sink
            .clone()
            .ok_or(TransportError::NotInitialized)
    }

    /// Emits a local description followed by freshly gathered candidates.
    fn describe(&self, offer: bool) -> Result<(), TransportError> {
        let sink = self.require_sink()?;
        let (seq, first_candidate) = {
            let mut state = self.state.lock();
            state.descriptions += 1;
            let first = state.candidates;
            state.candidates += self.gathered as u32;
            (state.descriptions, first)
        };
        let event = if offer {
            TransportEvent::LocalOffer(SessionDescription::offer(format!(
                "mock-offer {} #{seq}",
                self.label
            )))
        } else {
            TransportEvent::LocalAnswer(SessionDescription::answer(format!(
                "mock-answer {} #{seq}",
                self.label
            )))
        };
        let _ = sink.send(event);
        for n in 0..self.gathered as u32 {
            let index = first_candidate + n;
            let candidate = PathCandidate::new(format!(
                "candidate:{index} 1 udp 2122260223 10.0.0.{} {} typ host ufrag {}",
                index + 1,
                50000 + index,
                self.label
            ))
            .with_media("0", 0);
            let _ = sink.send(TransportEvent::CandidateDiscovered(candidate));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn initialize(
        &self,
        servers: Vec<ServerDescriptor>,
        sink: TransportSink,
    ) -> Result<(), TransportError> {
        self.record(
            Some(MockOp::Initialize),
            TransportCall::Initialize { servers },
        )?;
        let _ = sink.send(TransportEvent::Connectivity(ConnectivityState::New));
        self.state.lock().sink = Some(sink);
        Ok(())
    }

    async fn create_offer(&self) -> Result<(), TransportError> {
        self.record(Some(MockOp::CreateOffer), TransportCall::CreateOffer)?;
        self.describe(true)
    }

    async fn handle_remote_offer(&self, offer: SessionDescription) -> Result<(), TransportError> {
        self.record(
            Some(MockOp::HandleRemoteOffer),
            TransportCall::HandleRemoteOffer(offer),
        )?;
        self.describe(false)
    }

    async fn handle_remote_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(
            Some(MockOp::HandleRemoteAnswer),
            TransportCall::HandleRemoteAnswer(answer),
        )?;
        let sink = self.require_sink()?;
        if self.connect_on_answer {
            let _ = sink.send(TransportEvent::Connectivity(ConnectivityState::Connected));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: PathCandidate) -> Result<(), TransportError> {
        self.record(
            Some(MockOp::AddCandidate),
            TransportCall::AddCandidate(candidate),
        )
    }

    async fn remove_candidates(
        &self,
        candidates: Vec<PathCandidate>,
    ) -> Result<(), TransportError> {
        self.record(
            Some(MockOp::RemoveCandidates),
            TransportCall::RemoveCandidates(candidates),
        )
    }

    async fn restart(&self) -> Result<(), TransportError> {
        self.record(Some(MockOp::Restart), TransportCall::Restart)?;
        self.describe(true)
    }

    fn detach(&self) {
        let _ = self.record(None, TransportCall::Detach);
        self.state.lock().sink = None;
    }

    async fn release(&self) -> Result<(), TransportError> {
        self.record(Some(MockOp::Release), TransportCall::Release)?;
        self.state.lock().sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn offer_is_followed_by_gathered_candidates() {
        let transport = MockTransport::new("alice").with_gathered_candidates(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.initialize(Vec::new(), tx).await.unwrap();
        transport.create_offer().await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Connectivity(ConnectivityState::New))
        ));
        match rx.recv().await {
            Some(TransportEvent::LocalOffer(offer)) => assert_eq!(offer.sdp, "mock-offer alice #1"),
            other => panic!("unexpected event: {other:?}"),
        }
        for _ in 0..2 {
            assert!(matches!(
                rx.recv().await,
                Some(TransportEvent::CandidateDiscovered(_))
            ));
        }
    }

    #[tokio::test]
    async fn calls_before_initialize_fail() {
        let transport = MockTransport::new("bob");
        assert!(matches!(
            transport.create_offer().await,
            Err(TransportError::NotInitialized)
        ));
        assert_eq!(transport.calls(), vec![TransportCall::CreateOffer]);
    }

    #[tokio::test]
    async fn scripted_failure_and_detach() {
        let transport = MockTransport::new("carol");
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.initialize(Vec::new(), tx).await.unwrap();
        transport.fail_call(MockOp::Restart);
        assert!(matches!(
            transport.restart().await,
            Err(TransportError::Backend(_))
        ));

        transport.detach();
        assert!(!transport.is_attached());
        assert!(!transport.emit(TransportEvent::Connectivity(ConnectivityState::Checking)));
        assert_eq!(transport.count(|call| *call == TransportCall::Detach), 1);
    }
}
