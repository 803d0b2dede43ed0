//! Session spawning.
//!
//! [`SpawnConfig::for_engine`] picks how user sessions are launched for the
//! resolved engine; the hub then turns that into a live [`SessionSpawner`].

mod docker_api;
mod podman_cli;

pub use docker_api::DockerApiSpawner;
pub use podman_cli::PodmanCliSpawner;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::container::{
    ContainerError, ContainerResult, Engine, validate_container_name, validate_env_var_key,
    validate_image_name,
};
use crate::settings::EngineEndpoints;

/// Entrypoint started inside every session container.
pub const SESSION_COMMAND: &str = "jupyter-notebook";

/// Label carrying the owning user on every session container.
pub const USER_LABEL: &str = "binderbox.user";

/// How a spawner talks to its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnerKind {
    /// Native engine API over its control socket.
    DockerApi,
    /// One CLI invocation per operation.
    PodmanCli,
}

/// How the hub launches user session containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub engine: Engine,
    pub kind: SpawnerKind,
    /// Command run inside the session container.
    pub cmd: Vec<String>,
    pub debug: bool,
    /// Remove the container once the session ends.
    pub remove: bool,
}

impl SpawnConfig {
    pub fn for_engine(engine: Engine) -> Self {
        let kind = match engine {
            Engine::Docker => SpawnerKind::DockerApi,
            Engine::Podman => SpawnerKind::PodmanCli,
        };
        Self {
            engine,
            kind,
            cmd: vec![SESSION_COMMAND.to_string()],
            debug: true,
            remove: true,
        }
    }

    /// Full command line for a session listening on `port`.
    pub fn session_command(&self, port: u16) -> Vec<String> {
        let mut cmd = self.cmd.clone();
        cmd.push("--ip=0.0.0.0".to_string());
        cmd.push(format!("--port={port}"));
        if self.debug {
            cmd.push("--debug".to_string());
        }
        cmd
    }

    /// Instantiate the spawner this configuration describes.
    pub fn build_spawner(&self, endpoints: &EngineEndpoints) -> Arc<dyn SessionSpawner> {
        match self.kind {
            SpawnerKind::DockerApi => {
                Arc::new(DockerApiSpawner::new(&endpoints.docker_socket, self.clone()))
            }
            SpawnerKind::PodmanCli => Arc::new(PodmanCliSpawner::new(
                endpoints.podman_binary.clone(),
                self.clone(),
            )),
        }
    }
}

/// Request to start one user's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub user: String,
    pub image: String,
    /// Port the session server listens on inside the container.
    pub port: u16,
    pub env: BTreeMap<String, String>,
}

impl SessionRequest {
    pub fn new(user: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            image: image.into(),
            port,
            env: BTreeMap::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Deterministic container name for the user.
    pub fn container_name(&self) -> String {
        format!("binderbox-{}", self.user)
    }

    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.container_name())?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        if self.port == 0 {
            return Err(ContainerError::InvalidInput(
                "session port cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// A started session container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub user: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    /// Host port the session port was published on.
    pub host_port: Option<u16>,
}

/// Observed state of a session container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Container exists but is not running (created, exited, ...).
    Stopped { status: String },
    /// Container is gone, usually auto-removed after exit.
    Missing,
}

impl SessionStatus {
    pub(crate) fn from_state(status: &str) -> Self {
        match status {
            "running" => SessionStatus::Running,
            other => SessionStatus::Stopped {
                status: other.to_string(),
            },
        }
    }
}

/// Starts, stops and inspects per-user session containers.
#[async_trait]
pub trait SessionSpawner: Send + Sync {
    async fn start(&self, request: &SessionRequest) -> ContainerResult<SessionHandle>;
    async fn stop(&self, handle: &SessionHandle) -> ContainerResult<()>;
    async fn status(&self, handle: &SessionHandle) -> ContainerResult<SessionStatus>;
}

/// Find the host port bound to `container_port/tcp` in an engine's
/// `NetworkSettings.Ports` object.
pub(crate) fn published_port(ports: &serde_json::Value, container_port: u16) -> Option<u16> {
    ports
        .get(format!("{container_port}/tcp"))?
        .as_array()?
        .iter()
        .filter_map(|binding| binding.get("HostPort")?.as_str()?.parse().ok())
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn docker_uses_the_api_spawner() {
        let cfg = SpawnConfig::for_engine(Engine::Docker);
        assert_eq!(cfg.kind, SpawnerKind::DockerApi);
        assert_eq!(cfg.cmd, vec![SESSION_COMMAND.to_string()]);
        assert!(cfg.debug);
        assert!(cfg.remove);
    }

    #[test]
    fn podman_uses_the_cli_spawner() {
        let cfg = SpawnConfig::for_engine(Engine::Podman);
        assert_eq!(cfg.kind, SpawnerKind::PodmanCli);
        assert_eq!(cfg.engine, Engine::Podman);
        assert!(cfg.remove);
    }

    #[test]
    fn session_command_listens_on_all_interfaces() {
        let cfg = SpawnConfig::for_engine(Engine::Docker);
        assert_eq!(
            cfg.session_command(8888),
            vec!["jupyter-notebook", "--ip=0.0.0.0", "--port=8888", "--debug"]
        );
    }

    #[test]
    fn session_request_validation() {
        let ok = SessionRequest::new("alice", "localhost/r2d-demo:abc", 8888).env("TOKEN", "x");
        assert!(ok.validate().is_ok());
        assert_eq!(ok.container_name(), "binderbox-alice");

        assert!(SessionRequest::new("al ice", "img", 8888).validate().is_err());
        assert!(SessionRequest::new("alice", "img;ls", 8888).validate().is_err());
        assert!(SessionRequest::new("alice", "img", 0).validate().is_err());
        assert!(
            SessionRequest::new("alice", "img", 8888)
                .env("BAD-KEY", "x")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn finds_published_port() {
        let ports = json!({
            "8888/tcp": [{"HostIp": "0.0.0.0", "HostPort": "49153"}],
            "22/tcp": null
        });
        assert_eq!(published_port(&ports, 8888), Some(49153));
        assert_eq!(published_port(&ports, 22), None);
        assert_eq!(published_port(&ports, 9999), None);
    }

    #[test]
    fn status_from_engine_state() {
        assert_eq!(SessionStatus::from_state("running"), SessionStatus::Running);
        assert_eq!(
            SessionStatus::from_state("exited"),
            SessionStatus::Stopped {
                status: "exited".to_string()
            }
        );
    }
}
