//! Session spawner that shells out to the podman CLI.

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use super::{
    SessionHandle, SessionRequest, SessionSpawner, SessionStatus, SpawnConfig, USER_LABEL,
    published_port,
};
use crate::container::{ContainerError, ContainerResult, validate_container_name};

/// Seconds a session gets to shut down before it is killed.
const STOP_TIMEOUT_SECS: u32 = 10;

/// Runs one `podman` invocation per operation.
#[derive(Debug, Clone)]
pub struct PodmanCliSpawner {
    binary: String,
    config: SpawnConfig,
}

impl PodmanCliSpawner {
    pub fn new(binary: impl Into<String>, config: SpawnConfig) -> Self {
        Self {
            binary: binary.into(),
            config,
        }
    }

    /// Arguments for `podman run` that start the session detached.
    pub fn run_args(&self, request: &SessionRequest) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if self.config.remove {
            args.push("--rm".to_string());
        }

        args.push("--name".to_string());
        args.push(request.container_name());

        args.push("--label".to_string());
        args.push(format!("{USER_LABEL}={}", request.user));

        // Publish on a random host port; the assignment is read back afterwards.
        args.push("-p".to_string());
        args.push(request.port.to_string());

        for pair in request.env_list() {
            args.push("-e".to_string());
            args.push(pair);
        }

        args.push(request.image.clone());
        args.extend(self.config.session_command(request.port));
        args
    }

    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::command_failed(command, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::command_failed(command, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `inspect` a single field; `Ok(None)` when the container does not exist.
    async fn inspect_field(&self, id: &str, format: &str) -> ContainerResult<Option<String>> {
        validate_container_name(id)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", format, id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::command_failed("inspect", e))?;

        if !output.status.success() {
            return Ok(None);
        }

        let value = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        Ok((!value.is_empty()).then_some(value))
    }

    async fn host_port(&self, id: &str, container_port: u16) -> ContainerResult<Option<u16>> {
        let Some(raw) = self
            .inspect_field(id, "{{json .NetworkSettings.Ports}}")
            .await?
        else {
            return Ok(None);
        };
        let ports: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| ContainerError::ParseError(e.to_string()))?;
        Ok(published_port(&ports, container_port))
    }
}

#[async_trait]
impl SessionSpawner for PodmanCliSpawner {
    async fn start(&self, request: &SessionRequest) -> ContainerResult<SessionHandle> {
        request.validate()?;

        let container_id = self.run("run", &self.run_args(request)).await?;
        let host_port = self.host_port(&container_id, request.port).await?;
        info!(
            "started session {} for {} on host port {:?}",
            request.container_name(),
            request.user,
            host_port
        );

        Ok(SessionHandle {
            user: request.user.clone(),
            container_id,
            container_name: request.container_name(),
            image: request.image.clone(),
            host_port,
        })
    }

    async fn stop(&self, handle: &SessionHandle) -> ContainerResult<()> {
        validate_container_name(&handle.container_id)?;

        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            STOP_TIMEOUT_SECS.to_string(),
            handle.container_id.clone(),
        ];
        match self.run("stop", &args).await {
            Ok(_) => Ok(()),
            // Auto-removed containers disappear on their own; that counts as stopped.
            Err(e) => match self.status(handle).await? {
                SessionStatus::Missing => Ok(()),
                _ => Err(e),
            },
        }
    }

    async fn status(&self, handle: &SessionHandle) -> ContainerResult<SessionStatus> {
        Ok(
            match self
                .inspect_field(&handle.container_id, "{{.State.Status}}")
                .await?
            {
                Some(state) => SessionStatus::from_state(&state),
                None => SessionStatus::Missing,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Engine;

    fn spawner() -> PodmanCliSpawner {
        PodmanCliSpawner::new("podman", SpawnConfig::for_engine(Engine::Podman))
    }

    #[test]
    fn run_args_remove_label_and_publish() {
        let request = SessionRequest::new("alice", "localhost/r2d-demo:abc", 8888)
            .env("JUPYTER_TOKEN", "t0k");
        let args = spawner().run_args(&request);

        assert_eq!(&args[..3], ["run", "-d", "--rm"]);
        let joined = args.join(" ");
        assert!(joined.contains("--name binderbox-alice"));
        assert!(joined.contains("--label binderbox.user=alice"));
        assert!(joined.contains("-p 8888"));
        assert!(joined.contains("-e JUPYTER_TOKEN=t0k"));
        assert!(joined.ends_with("localhost/r2d-demo:abc jupyter-notebook --ip=0.0.0.0 --port=8888 --debug"));
    }

    #[test]
    fn keep_containers_when_remove_is_off() {
        let mut config = SpawnConfig::for_engine(Engine::Podman);
        config.remove = false;
        let args = PodmanCliSpawner::new("podman", config)
            .run_args(&SessionRequest::new("bob", "img", 8888));
        assert!(!args.contains(&"--rm".to_string()));
    }

    #[tokio::test]
    async fn start_rejects_invalid_request_before_running() {
        let spawner = PodmanCliSpawner::new(
            "/nonexistent/podman",
            SpawnConfig::for_engine(Engine::Podman),
        );
        let err = spawner
            .start(&SessionRequest::new("bad user", "img", 8888))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_a_command_failure() {
        let spawner = PodmanCliSpawner::new(
            "/nonexistent/podman",
            SpawnConfig::for_engine(Engine::Podman),
        );
        let err = spawner
            .start(&SessionRequest::new("alice", "img", 8888))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::CommandFailed { .. }));
    }
}
