use std::fmt;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use peerlink_core::path_config::DEFAULT_STUN_URL;
use peerlink_core::{PeerId, SessionConfig};
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "peerlink",
    about = "Negotiate a peer session between two in-process endpoints",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "PEERLINK_LOCAL_ID",
        default_value = "alice",
        help = "Identity of the initiating endpoint"
    )]
    pub local: String,

    #[arg(
        long,
        env = "PEERLINK_REMOTE_ID",
        default_value = "bob",
        help = "Identity of the answering endpoint"
    )]
    pub remote: String,

    #[arg(
        long,
        value_enum,
        env = "PEERLINK_TRANSPORT",
        default_value_t = TransportKind::Mock
    )]
    pub transport: TransportKind,

    #[arg(
        long = "ice-server",
        env = "PEERLINK_ICE_SERVERS",
        value_delimiter = ',',
        value_name = "URL",
        help = "STUN/TURN server URL; repeat or comma-separate"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long = "ice-config-url",
        env = "PEERLINK_ICE_CONFIG_URL",
        value_name = "URL",
        help = "Fetch the relay server list as JSON from this endpoint"
    )]
    pub ice_config_url: Option<String>,

    #[arg(
        long = "ice-config-token",
        env = "PEERLINK_ICE_CONFIG_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub ice_config_token: Option<String>,

    #[arg(
        long = "connect-timeout-ms",
        env = "PEERLINK_CONNECT_TIMEOUT_MS",
        default_value_t = 15_000
    )]
    pub connect_timeout_ms: u64,

    #[arg(
        long = "negotiation-timeout-ms",
        env = "PEERLINK_NEGOTIATION_TIMEOUT_MS",
        help = "Fail a session stuck waiting for the remote description (0 disables)"
    )]
    pub negotiation_timeout_ms: Option<u64>,

    #[arg(
        long = "simulate-disconnect",
        help = "After connecting, drop the initiator's link once to exercise restart"
    )]
    pub simulate_disconnect: bool,

    #[arg(
        long = "log-filter",
        env = "RUST_LOG",
        default_value = crate::telemetry::DEFAULT_LOG_FILTER
    )]
    pub log_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Mock,
    Webrtc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaySource {
    Static(Vec<String>),
    Http { url: String, token: Option<String> },
}

impl fmt::Display for RelaySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelaySource::Static(urls) => write!(f, "static({})", urls.join(",")),
            // The token stays out of logs.
            RelaySource::Http { url, .. } => write!(f, "http({url})"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppConfigError {
    #[error("local and remote endpoints must differ (both are {0})")]
    SamePeer(String),
    #[error("endpoint ids must not be empty")]
    EmptyPeer,
    #[error("--ice-server and --ice-config-url are mutually exclusive")]
    ConflictingRelaySources,
    #[error("--simulate-disconnect needs the mock transport")]
    SimulationUnsupported,
    #[error("connect timeout must be positive")]
    ZeroConnectTimeout,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_filter: String,
    pub local: PeerId,
    pub remote: PeerId,
    pub transport: TransportKind,
    pub relay: RelaySource,
    pub connect_timeout: Duration,
    pub session: SessionConfig,
    pub simulate_disconnect: bool,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, AppConfigError> {
        let local = cli.local.trim().to_string();
        let remote = cli.remote.trim().to_string();
        if local.is_empty() || remote.is_empty() {
            return Err(AppConfigError::EmptyPeer);
        }
        if local == remote {
            return Err(AppConfigError::SamePeer(local));
        }
        if cli.simulate_disconnect && cli.transport != TransportKind::Mock {
            return Err(AppConfigError::SimulationUnsupported);
        }
        if cli.connect_timeout_ms == 0 {
            return Err(AppConfigError::ZeroConnectTimeout);
        }

        let ice_servers: Vec<String> = cli
            .ice_servers
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        let relay = match cli.ice_config_url {
            Some(_) if !ice_servers.is_empty() => {
                return Err(AppConfigError::ConflictingRelaySources)
            }
            Some(url) => RelaySource::Http {
                url,
                token: cli.ice_config_token,
            },
            None if ice_servers.is_empty() => RelaySource::Static(vec![DEFAULT_STUN_URL.into()]),
            None => RelaySource::Static(ice_servers),
        };

        let session = match cli.negotiation_timeout_ms {
            Some(ms) if ms > 0 => {
                SessionConfig::default().with_negotiation_timeout(Duration::from_millis(ms))
            }
            _ => SessionConfig::default(),
        };

        Ok(Self {
            log_filter: cli.log_filter,
            local: PeerId::from(local),
            remote: PeerId::from(remote),
            transport: cli.transport,
            relay,
            connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
            session,
            simulate_disconnect: cli.simulate_disconnect,
        })
    }
}
