//! Signaling orchestration for peer-to-peer sessions.
//!
//! A session decides which endpoint offers and which answers, loads relay
//! configuration before any offer exists, brokers descriptions and path
//! candidates through [`channel`] implementations and hands them to a native
//! [`transport::Transport`]. Everything is driven by one actor task per
//! session; see [`orchestrator`].

pub mod channel;
pub mod config;
pub mod error;
pub mod mock;
pub mod model;
pub mod orchestrator;
pub mod path_config;
pub mod registry;
pub mod role;
pub mod session;
pub mod transport;

pub use channel::{BusSignaling, ChannelError, ChannelSession, SignalingChannels};
pub use config::SessionConfig;
pub use error::{SessionError, SessionFailure};
pub use model::{
    CandidateEvent, DescriptionEvent, PathCandidate, PeerId, PublishAck, SdpKind,
    ServerDescriptor, SessionDescription, SessionTag,
};
pub use orchestrator::{NegotiationOrchestrator, SessionDeps, SessionHandle};
pub use path_config::{
    ConfigError, ConfigProvider, HttpConfigProvider, PathConfigLoader, StaticConfigProvider,
};
pub use role::SessionRole;
pub use session::{InitializationState, NegotiationState, SessionEvent, SessionSnapshot};
pub use transport::{ConnectivityState, Transport, TransportError, TransportEvent, TransportSink};
