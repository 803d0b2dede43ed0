//! Docker Engine API client over the daemon's unix socket.

use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use log::debug;
use serde_json::Value;

use super::{ContainerError, ContainerResult};

/// Thin request/response layer shared by engine detection and the
/// docker session spawner.
#[derive(Clone)]
pub struct DockerClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("socket", &self.socket)
            .finish()
    }
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client: Client::unix(),
        }
    }

    /// `GET /_ping`; the daemon answers 200 when it is serving requests.
    pub async fn ping(&self) -> ContainerResult<()> {
        self.call_expecting(Method::GET, "/_ping", None, &[StatusCode::OK])
            .await
            .map(|_| ())
    }

    /// Send one request and collect the whole response body.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ContainerResult<(StatusCode, Bytes)> {
        debug!("docker API {method} {path}");

        let payload = match body {
            Some(value) => Bytes::from(
                serde_json::to_vec(value).map_err(|e| ContainerError::ParseError(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let uri: hyper::Uri = Uri::new(&self.socket, path).into();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| ContainerError::InvalidInput(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ContainerError::command_failed(path, e))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ContainerError::command_failed(path, e))?
            .to_bytes();

        Ok((status, bytes))
    }

    /// Call an endpoint and fail on anything outside `expected`.
    pub async fn call_expecting(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        expected: &[StatusCode],
    ) -> ContainerResult<Bytes> {
        let (status, bytes) = self.call(method, path, body).await?;
        if expected.contains(&status) {
            return Ok(bytes);
        }
        Err(api_error(path, status, &bytes))
    }
}

/// Map an unexpected daemon response, preferring its JSON `message`.
pub(crate) fn api_error(endpoint: &str, status: StatusCode, body: &[u8]) -> ContainerError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    ContainerError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_prefers_daemon_message() {
        let err = api_error(
            "/containers/create",
            StatusCode::CONFLICT,
            br#"{"message":"name already in use"}"#,
        );
        match err {
            ContainerError::Api {
                status, message, ..
            } => {
                assert_eq!(status, 409);
                assert_eq!(message, "name already in use");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_to_raw_body() {
        let err = api_error("/_ping", StatusCode::SERVICE_UNAVAILABLE, b" starting up \n");
        assert!(err.to_string().contains("starting up"));
    }

    #[tokio::test]
    async fn missing_socket_is_a_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = DockerClient::new(dir.path().join("missing.sock"));
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ContainerError::CommandFailed { .. }));
    }
}
