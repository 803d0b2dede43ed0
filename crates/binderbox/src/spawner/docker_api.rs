//! Session spawner that talks to the Docker Engine API over its unix socket.

use std::path::PathBuf;

use async_trait::async_trait;
use hyper::{Method, StatusCode};
use log::{info, warn};
use serde_json::{Value, json};

use super::{
    SessionHandle, SessionRequest, SessionSpawner, SessionStatus, SpawnConfig, USER_LABEL,
    published_port,
};
use crate::container::{
    ContainerError, ContainerResult, DockerClient, api_error, validate_container_name,
};

const STOP_TIMEOUT_SECS: u32 = 10;

/// Spawner backed by the docker daemon's HTTP API.
#[derive(Debug, Clone)]
pub struct DockerApiSpawner {
    docker: DockerClient,
    config: SpawnConfig,
}

impl DockerApiSpawner {
    pub fn new(socket: impl Into<PathBuf>, config: SpawnConfig) -> Self {
        Self {
            docker: DockerClient::new(socket),
            config,
        }
    }

    /// Body for `POST /containers/create`.
    pub fn create_body(&self, request: &SessionRequest) -> Value {
        let port_key = format!("{}/tcp", request.port);
        json!({
            "Image": request.image,
            "Cmd": self.config.session_command(request.port),
            "Env": request.env_list(),
            "Labels": { USER_LABEL: request.user },
            "ExposedPorts": { port_key.clone(): {} },
            "HostConfig": {
                "AutoRemove": self.config.remove,
                "PortBindings": { port_key: [{ "HostIp": "", "HostPort": "" }] },
            },
        })
    }

    /// `GET /containers/{id}/json`; `Ok(None)` on 404.
    async fn inspect(&self, id: &str) -> ContainerResult<Option<Value>> {
        validate_container_name(id)?;

        let path = format!("/containers/{id}/json");
        let (status, bytes) = self.docker.call(Method::GET, &path, None).await?;
        match status {
            StatusCode::OK => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ContainerError::ParseError(e.to_string())),
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(api_error(&path, other, &bytes)),
        }
    }

    /// `DELETE /containers/{id}?force=true` for a container that never ran.
    ///
    /// Auto-removal only covers containers that started, so a failed start
    /// would otherwise hold the user's container name.
    async fn discard(&self, id: &str) {
        let path = format!("/containers/{id}?force=true");
        let removed = self
            .docker
            .call_expecting(
                Method::DELETE,
                &path,
                None,
                &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
            )
            .await;
        if let Err(e) = removed {
            warn!("could not remove unstarted container {id}: {e}");
        }
    }
}

#[async_trait]
impl SessionSpawner for DockerApiSpawner {
    async fn start(&self, request: &SessionRequest) -> ContainerResult<SessionHandle> {
        request.validate()?;

        let name = request.container_name();
        let created = self
            .docker
            .call_expecting(
                Method::POST,
                &format!("/containers/create?name={name}"),
                Some(&self.create_body(request)),
                &[StatusCode::CREATED],
            )
            .await?;
        let created: Value =
            serde_json::from_slice(&created).map_err(|e| ContainerError::ParseError(e.to_string()))?;
        let container_id = created
            .get("Id")
            .and_then(Value::as_str)
            .ok_or_else(|| ContainerError::ParseError("create response without Id".to_string()))?
            .to_string();

        let started = self
            .docker
            .call_expecting(
                Method::POST,
                &format!("/containers/{container_id}/start"),
                None,
                &[StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED],
            )
            .await;
        if let Err(e) = started {
            self.discard(&container_id).await;
            return Err(e);
        }

        let host_port = self
            .inspect(&container_id)
            .await?
            .and_then(|info| {
                info.pointer("/NetworkSettings/Ports")
                    .and_then(|ports| published_port(ports, request.port))
            });
        info!("started session {name} for {} on host port {host_port:?}", request.user);

        Ok(SessionHandle {
            user: request.user.clone(),
            container_id,
            container_name: name,
            image: request.image.clone(),
            host_port,
        })
    }

    async fn stop(&self, handle: &SessionHandle) -> ContainerResult<()> {
        validate_container_name(&handle.container_id)?;

        // 304: already stopped. 404: already auto-removed.
        self.docker
            .call_expecting(
                Method::POST,
                &format!(
                    "/containers/{}/stop?t={STOP_TIMEOUT_SECS}",
                    handle.container_id
                ),
                None,
                &[
                    StatusCode::NO_CONTENT,
                    StatusCode::NOT_MODIFIED,
                    StatusCode::NOT_FOUND,
                ],
            )
            .await
            .map(|_| ())
    }

    async fn status(&self, handle: &SessionHandle) -> ContainerResult<SessionStatus> {
        Ok(match self.inspect(&handle.container_id).await? {
            Some(info) => {
                let state = info
                    .pointer("/State/Status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                SessionStatus::from_state(state)
            }
            None => SessionStatus::Missing,
        })
    }
}
