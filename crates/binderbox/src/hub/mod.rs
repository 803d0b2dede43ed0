//! The hub: owns user sessions and the managed build service.

mod api;
mod services;

pub use api::{HubState, SessionInfo, StartSessionRequest, router};
pub use services::{ManagedService, service_env};

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::settings::EngineEndpoints;
use crate::spawner::{SessionSpawner, SpawnConfig};
use crate::supervisor::{HubApplication, ServiceDescriptor};

/// How visitors are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Everyone is let in; the hub is a single-host sandbox.
    Disabled,
}

/// Full hub configuration, assembled once by the supervisor.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub log_level: String,
    pub auth: AuthMode,
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Address sessions and services use to call back into the hub.
    pub connect_ip: IpAddr,
    /// Operator-supplied external URL; replaces the derived one when set.
    pub external_url: Option<String>,
    pub spawn: SpawnConfig,
    pub endpoints: EngineEndpoints,
    pub services: Vec<ServiceDescriptor>,
    pub default_url: String,
    /// Port the session server listens on inside its container.
    pub session_port: u16,
}

impl HubConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Externally reachable hub URL.
    pub fn public_url(&self) -> String {
        match &self.external_url {
            Some(url) => url.clone(),
            None => format!("http://{}:{}/", self.connect_ip, self.port),
        }
    }

    /// Hub API as reached from sessions and services.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}/hub/api", self.connect_ip, self.port)
    }

    pub fn session_url(&self, host_port: u16) -> String {
        format!("http://{}:{}/", self.connect_ip, host_port)
    }
}

/// Hub application driven by the supervisor's event loop.
pub struct Hub {
    config: Arc<HubConfig>,
    spawner: Option<Arc<dyn SessionSpawner>>,
    listener: Option<TcpListener>,
    tokens: BTreeMap<String, String>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config: Arc::new(config),
            spawner: None,
            listener: None,
            tokens: BTreeMap::new(),
        }
    }

    /// Use `spawner` instead of the one described by the spawn configuration.
    pub fn with_spawner(mut self, spawner: Arc<dyn SessionSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Address actually bound, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl HubApplication for Hub {
    async fn initialize(&mut self) -> Result<()> {
        info!(
            "initializing hub: engine {}, spawner {:?}, log level {}",
            self.config.spawn.engine, self.config.spawn.kind, self.config.log_level
        );
        if self.config.auth == AuthMode::Disabled {
            warn!("authentication is disabled; every visitor can start a session");
        }

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding hub to {addr}"))?;
        self.listener = Some(listener);

        if self.spawner.is_none() {
            self.spawner = Some(self.config.spawn.build_spawner(&self.config.endpoints));
        }

        self.tokens = self
            .config
            .services
            .iter()
            .map(|s| (s.name.clone(), Uuid::new_v4().simple().to_string()))
            .collect();

        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("hub started before it was initialized")?;
        let spawner = self
            .spawner
            .clone()
            .context("hub started without a session spawner")?;

        let mut children = Vec::with_capacity(self.config.services.len());
        for descriptor in &self.config.services {
            let token = self
                .tokens
                .get(&descriptor.name)
                .with_context(|| format!("no API token minted for service {}", descriptor.name))?;
            children.push(ManagedService::launch(descriptor, &self.config, token)?);
        }

        let state = self
            .config
            .services
            .iter()
            .filter_map(|s| self.tokens.get(&s.name).map(|token| (token, s.admin)))
            .fold(
                HubState::new(self.config.clone(), spawner),
                |state, (token, admin)| state.with_service_token(token.clone(), admin),
            );
        let app = router(state);
        info!(
            "hub listening on http://{} (public URL {})",
            listener.local_addr().context("reading hub address")?,
            self.config.public_url()
        );

        let server = async move {
            axum::serve(listener, app)
                .await
                .context("serving hub API")
        };

        tokio::select! {
            res = server => res,
            res = services::supervise(children) => res,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::container::Engine;
    use std::net::Ipv4Addr;

    pub(crate) fn test_config() -> HubConfig {
        HubConfig {
            log_level: "DEBUG".to_string(),
            auth: AuthMode::Disabled,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            connect_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            external_url: None,
            spawn: SpawnConfig::for_engine(Engine::Docker),
            endpoints: EngineEndpoints::default(),
            services: Vec::new(),
            default_url: "/services/binder/".to_string(),
            session_port: 8888,
        }
    }

    #[test]
    fn public_url_prefers_override() {
        let mut config = test_config();
        config.port = 8000;
        assert_eq!(config.public_url(), "http://10.0.0.5:8000/");

        config.external_url = Some("https://example.test".to_string());
        assert_eq!(config.public_url(), "https://example.test");
        assert_eq!(config.api_url(), "http://10.0.0.5:8000/hub/api");
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        let mut hub = Hub::new(test_config());
        let err = hub.start().await.unwrap_err();
        assert!(err.to_string().contains("initialized"));
    }

    #[tokio::test]
    async fn initialize_binds_and_builds_spawner() {
        let mut hub = Hub::new(test_config());
        hub.initialize().await.unwrap();
        assert!(hub.local_addr().is_some());
        assert!(hub.spawner.is_some());
    }

    #[tokio::test]
    async fn crashed_service_ends_the_hub() {
        let mut config = test_config();
        config.services = vec![ServiceDescriptor {
            name: "binder".to_string(),
            admin: true,
            command: vec!["false".to_string()],
            url: "http://localhost:8585".to_string(),
            environment: BTreeMap::new(),
        }];

        let mut hub = Hub::new(config);
        hub.initialize().await.unwrap();
        let err = hub.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("binder"));
    }
}
