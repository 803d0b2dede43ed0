//! The build service: turns repository references into images and asks the
//! hub to launch sessions on them.

mod api;
mod hub_client;

pub use api::{BuildRequest, BuildResponse, BuildServiceState, router};
pub use hub_client::{HubClient, LaunchedSession, SessionLauncher};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use log::info;
use serde::Serialize;
use tokio::net::TcpListener;

use crate::build::{BuildConfig, ImageBuilder, Repo2DockerBuilder};
use crate::container::{Engine, ImageRegistry, RegistryKind};
use crate::supervisor::{BuildServiceApplication, shutdown_signal};

/// Full build-service configuration, assembled once by the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct BuildServiceConfig {
    pub engine: Engine,
    pub debug: bool,
    pub use_registry: bool,
    /// Whether a remote builder cluster is needed. Always false on a single host.
    pub builder_required: bool,
    pub build: BuildConfig,
    pub registry: RegistryKind,
    pub push_secret: Option<String>,
    pub about_message: String,
    pub banner_message: String,
    /// Hub address as reached from this host.
    pub hub_url_local: String,
    /// Path prefix the service is mounted under.
    pub base_url: String,
    /// Hub address as handed to visitors.
    pub hub_url: String,
    pub listen: SocketAddr,
    #[serde(skip_serializing)]
    pub api_token: String,
}

/// Build-service application driven by the supervisor.
pub struct BuildService {
    config: Arc<BuildServiceConfig>,
    builder: Option<Arc<dyn ImageBuilder>>,
    registry: Option<Arc<dyn ImageRegistry>>,
    launcher: Option<Arc<dyn SessionLauncher>>,
    shutdown: Option<BoxFuture<'static, ()>>,
    bound: Option<SocketAddr>,
}

impl BuildService {
    pub fn new(config: BuildServiceConfig) -> Self {
        Self {
            config: Arc::new(config),
            builder: None,
            registry: None,
            launcher: None,
            shutdown: None,
            bound: None,
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ImageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn SessionLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Stop serving when `signal` resolves instead of on Ctrl+C/SIGTERM.
    pub fn with_shutdown(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// Address the last `start` bound to.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    fn state(&self) -> Result<BuildServiceState> {
        Ok(BuildServiceState::new(
            self.config.clone(),
            self.builder
                .clone()
                .context("build service used before it was initialized")?,
            self.registry.clone().context("no image registry")?,
            self.launcher.clone().context("no hub client")?,
        ))
    }

    async fn serve(&mut self) -> Result<()> {
        let app = router(self.state()?);
        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("binding build service to {}", self.config.listen))?;
        let addr = listener.local_addr().context("reading build-service address")?;
        self.bound = Some(addr);
        info!(
            "build service ({}) listening on http://{addr}{}",
            self.config.engine, self.config.base_url
        );

        let shutdown = self
            .shutdown
            .take()
            .unwrap_or_else(|| Box::pin(shutdown_signal()));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("serving build-service API")?;

        info!("build service stopped");
        Ok(())
    }
}

impl BuildServiceApplication for BuildService {
    fn initialize(&mut self) -> Result<()> {
        let config = &self.config;
        if config.build.invocation.binary.trim().is_empty() {
            bail!("no image builder configured");
        }
        if !config.base_url.starts_with('/') {
            bail!("base URL '{}' must start with '/'", config.base_url);
        }
        if config.engine != config.build.engine {
            bail!(
                "build strategy targets {} but the service runs on {}",
                config.build.engine,
                config.engine
            );
        }

        if self.builder.is_none() {
            self.builder = Some(Arc::new(Repo2DockerBuilder::new(config.build.clone())));
        }
        if self.registry.is_none() {
            self.registry = Some(config.registry.clone().into_registry());
        }
        if self.launcher.is_none() {
            let client = HubClient::new(&config.hub_url_local, &config.api_token)?;
            self.launcher = Some(Arc::new(client));
        }

        info!(
            "initialized build service: engine {}, registry {}, hub {}",
            config.engine,
            if config.use_registry { "local" } else { "none" },
            config.hub_url
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("creating build-service runtime")?;
        runtime.block_on(self.serve())
    }
}
