//! Container engine detection.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};

use super::{ContainerError, ContainerResult, DockerClient, Engine, RequestedEngine};

/// Socket docker listens on when `DOCKER_HOST` is not set.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Order in which engines are tried when the caller asked for `auto`.
const PROBE_ORDER: [Engine; 2] = [Engine::Docker, Engine::Podman];

/// Checks whether a given engine is usable on this host.
///
/// Every probe follows the same contract: `Ok(())` means usable, any error
/// means "not available" and is never propagated past [`resolve`].
pub trait EngineProbe {
    fn check(&self, engine: Engine) -> Result<()>;
}

/// Resolve the engine to use for this process.
///
/// An explicit request is returned as-is without touching the host. `auto`
/// tries docker first and podman second, stopping at the first usable one.
pub fn resolve(requested: RequestedEngine, probe: &dyn EngineProbe) -> ContainerResult<Engine> {
    if let Some(engine) = requested.explicit() {
        debug!("using explicitly requested container engine {engine}");
        return Ok(engine);
    }

    for engine in PROBE_ORDER {
        match probe.check(engine) {
            Ok(()) => {
                info!("detected container engine: {engine}");
                return Ok(engine);
            }
            Err(e) => debug!("container engine {engine} not available: {e:#}"),
        }
    }

    Err(ContainerError::EngineNotFound)
}

/// Resolve the docker API socket from a `DOCKER_HOST` value.
///
/// Only `unix://` endpoints are understood; anything else falls back to the
/// default socket.
pub fn docker_socket_path(docker_host: Option<&str>) -> PathBuf {
    match docker_host.and_then(|h| h.strip_prefix("unix://")) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_DOCKER_SOCKET),
    }
}

/// Probes the real host: docker by API handshake, podman by `podman version`.
#[derive(Debug, Clone)]
pub struct HostProbe {
    docker_socket: PathBuf,
    podman_binary: String,
    timeout: Duration,
}

impl HostProbe {
    pub fn new(docker_socket: impl Into<PathBuf>, podman_binary: impl Into<String>) -> Self {
        Self {
            docker_socket: docker_socket.into(),
            podman_binary: podman_binary.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// `GET /_ping` against the docker API socket.
    ///
    /// Detection runs before any runtime exists, so the ping gets a
    /// throwaway current-thread one.
    fn ping_docker(&self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building runtime for docker ping")?;

        runtime.block_on(async {
            let client = DockerClient::new(&self.docker_socket);
            tokio::time::timeout(self.timeout, client.ping())
                .await
                .map_err(|_| {
                    anyhow!(
                        "docker API at {} did not answer within {:?}",
                        self.docker_socket.display(),
                        self.timeout
                    )
                })?
                .with_context(|| format!("pinging {}", self.docker_socket.display()))
        })
    }

    fn podman_version(&self) -> Result<()> {
        debug!("{} version", self.podman_binary);
        let output = Command::new(&self.podman_binary)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("running {} version", self.podman_binary))?;

        if !output.status.success() {
            bail!(
                "{} version exited with {}: {}",
                self.podman_binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl EngineProbe for HostProbe {
    fn check(&self, engine: Engine) -> Result<()> {
        match engine {
            Engine::Docker => self.ping_docker(),
            Engine::Podman => self.podman_version(),
        }
    }
}
