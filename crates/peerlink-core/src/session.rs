use std::fmt;

use crate::error::SessionFailure;
use crate::model::PeerId;
use crate::role::SessionRole;
use crate::transport::ConnectivityState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    LoadingConfig,
    Listening,
    AwaitingAnswer,
    AwaitingTransportAnswer,
    Connected,
    Restarting,
    Failed,
    TornDown,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::TornDown)
    }

    /// Waiting on the remote's description; the negotiation timeout applies.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::AwaitingAnswer | NegotiationState::AwaitingTransportAnswer
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::LoadingConfig => "loading_config",
            NegotiationState::Listening => "listening",
            NegotiationState::AwaitingAnswer => "awaiting_answer",
            NegotiationState::AwaitingTransportAnswer => "awaiting_transport_answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Restarting => "restarting",
            NegotiationState::Failed => "failed",
            NegotiationState::TornDown => "torn_down",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitializationState {
    #[default]
    NotStarted,
    Ready,
}

/// Point-in-time view of a session, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: NegotiationState,
    pub role: SessionRole,
    pub remote: Option<PeerId>,
    pub initialization: InitializationState,
    pub pending_offer: bool,
    pub restarts: u32,
    pub failure: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: NegotiationState::Idle,
            role: SessionRole::Undetermined,
            remote: None,
            initialization: InitializationState::NotStarted,
            pending_offer: false,
            restarts: 0,
            failure: None,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        from: NegotiationState,
        to: NegotiationState,
    },
    RoleAssigned {
        role: SessionRole,
        remote: PeerId,
    },
    CrossTalkRejected {
        active: PeerId,
        sender: PeerId,
    },
    Connectivity(ConnectivityState),
    Failed(SessionFailure),
    TornDown,
}
