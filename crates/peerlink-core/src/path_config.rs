//! Relay / traversal server configuration, fetched once per session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::model::ServerDescriptor;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("relay config request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid relay config url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unexpected status from relay config endpoint: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("relay config provider failed: {0}")]
    Provider(String),
    #[error("relay config already loaded for this session")]
    AlreadyLoaded,
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>, ConfigError>;
}

/// One-shot wrapper around a [`ConfigProvider`]: the first `load` fetches,
/// every later call fails with [`ConfigError::AlreadyLoaded`].
pub struct PathConfigLoader {
    provider: Arc<dyn ConfigProvider>,
    started: AtomicBool,
}

impl PathConfigLoader {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            started: AtomicBool::new(false),
        }
    }

    pub async fn load(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyLoaded);
        }
        let servers = self.provider.fetch().await?;
        debug!(
            target = "peerlink::config",
            servers = servers.len(),
            "relay config loaded"
        );
        Ok(servers)
    }
}

/// Fixed server list, typically from the environment.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    servers: Vec<ServerDescriptor>,
}

impl StaticConfigProvider {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self { servers }
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(urls.into_iter().map(ServerDescriptor::new).collect())
    }

    /// Reads `PEERLINK_ICE_SERVERS` (comma separated). Unset falls back to a
    /// public STUN server; `PEERLINK_LOCALHOST_ONLY` yields an empty list.
    pub fn from_env() -> Self {
        if std::env::var("PEERLINK_LOCALHOST_ONLY").is_ok() {
            return Self::default();
        }
        match std::env::var("PEERLINK_ICE_SERVERS") {
            Ok(raw) => Self::from_urls(split_urls(&raw)),
            Err(_) => Self::from_urls([DEFAULT_STUN_URL]),
        }
    }

    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        Ok(self.servers.clone())
    }
}

pub fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RelayConfigBody {
    Wrapped { ice_servers: Vec<ServerDescriptor> },
    Bare(Vec<ServerDescriptor>),
}

/// Fetches the server list as JSON from an HTTP endpoint. Accepts either a
/// bare array or `{"ice_servers": [...]}`.
#[derive(Clone)]
pub struct HttpConfigProvider {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl HttpConfigProvider {
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(url).map_err(|err| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn fetch(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        let mut request = self.http.get(self.url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ConfigError::UnexpectedStatus { status, body });
        }
        let servers = match res.json::<RelayConfigBody>().await? {
            RelayConfigBody::Wrapped { ice_servers } => ice_servers,
            RelayConfigBody::Bare(servers) => servers,
        };
        Ok(servers)
    }
}
