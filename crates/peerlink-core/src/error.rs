use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::model::PeerId;
use crate::path_config::ConfigError;
use crate::role::RoleError;
use crate::transport::TransportError;

/// Structural failure that moves a session to `Failed`.
#[derive(Debug, Error)]
pub enum SessionFailure {
    #[error("relay config fetch failed: {0}")]
    ConfigFetch(#[source] ConfigError),
    #[error("{kind} subscription failed: {source}")]
    ChannelListen {
        kind: &'static str,
        #[source]
        source: ChannelError,
    },
    #[error("transport failure: {0}")]
    Transport(#[source] TransportError),
    #[error("negotiation with {remote} timed out after {elapsed:?}")]
    NegotiationTimedOut { remote: PeerId, elapsed: Duration },
}

/// Errors returned to host calls on a [`crate::SessionHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error("session failed: {0}")]
    Failed(String),
    #[error("session torn down")]
    TornDown,
}
