//! STUN/TURN server configuration.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use duet_protocol::{IceConfig, IceServerInfo};
use serde::Deserialize;
use tracing::{info, warn};

use crate::token::TokenProvider;

pub const FALLBACK_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn ice_servers(&self) -> anyhow::Result<Vec<IceServerInfo>>;
}

/// Servers listed in the `[ice]` config section.
pub struct ConfiguredIceServers {
    servers: Vec<IceServerInfo>,
}

impl ConfiguredIceServers {
    pub fn new(config: &IceConfig) -> Self {
        Self {
            servers: config.servers(),
        }
    }
}

#[async_trait]
impl IceServerProvider for ConfiguredIceServers {
    async fn ice_servers(&self) -> anyhow::Result<Vec<IceServerInfo>> {
        Ok(self.servers.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceServersResponse {
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<RawIceServer>,
    },
    Bare(Vec<RawIceServer>),
}

#[derive(Deserialize)]
struct RawIceServer {
    urls: RawUrls,
    username: Option<String>,
    credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUrls {
    One(String),
    Many(Vec<String>),
}

impl From<RawIceServer> for IceServerInfo {
    fn from(raw: RawIceServer) -> Self {
        let urls = match raw.urls {
            RawUrls::One(u) => vec![u],
            RawUrls::Many(u) => u,
        };
        IceServerInfo {
            urls,
            username: raw.username,
            credential: raw.credential,
        }
    }
}

fn parse_ice_servers(body: &str) -> anyhow::Result<Vec<IceServerInfo>> {
    let parsed: IceServersResponse =
        serde_json::from_str(body).context("Invalid ICE server response")?;
    let raw = match parsed {
        IceServersResponse::Wrapped { ice_servers } => ice_servers,
        IceServersResponse::Bare(servers) => servers,
    };
    Ok(raw.into_iter().map(IceServerInfo::from).collect())
}

/// Fetches short-lived TURN credentials from the backend.
pub struct HttpIceServerProvider {
    client: reqwest::Client,
    url: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpIceServerProvider {
    pub fn new(url: impl Into<String>, token: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl IceServerProvider for HttpIceServerProvider {
    async fn ice_servers(&self) -> anyhow::Result<Vec<IceServerInfo>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = self.token.access_token() {
            request = request.bearer_auth(token);
        }
        let body = request
            .send()
            .await
            .context("ICE server request failed")?
            .error_for_status()
            .context("ICE server endpoint rejected request")?
            .text()
            .await
            .context("Failed to read ICE server response")?;
        parse_ice_servers(&body)
    }
}

pub fn fallback_ice_servers() -> Vec<IceServerInfo> {
    vec![IceServerInfo {
        urls: FALLBACK_STUN_URLS.iter().map(|u| u.to_string()).collect(),
        username: None,
        credential: None,
    }]
}

/// Ask the provider for servers, falling back to public STUN on failure or
/// an empty list.
pub async fn resolve_ice_servers(provider: &dyn IceServerProvider) -> Vec<IceServerInfo> {
    match provider.ice_servers().await {
        Ok(servers) if !servers.is_empty() => {
            info!(
                count = servers.len(),
                relay = servers.iter().any(IceServerInfo::is_relay),
                "ICE servers resolved"
            );
            servers
        }
        Ok(_) => {
            warn!("ICE server provider returned no servers, using public STUN");
            fallback_ice_servers()
        }
        Err(e) => {
            warn!("Failed to fetch ICE servers: {e:#}, using public STUN");
            fallback_ice_servers()
        }
    }
}
