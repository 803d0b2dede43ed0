//! Client for the hub's session API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::debug;
use reqwest::{StatusCode, Url};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api_error::ApiError;

/// What the hub reports about a session it launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchedSession {
    pub container: String,
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Asks the hub to start a user session on an image.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, user: &str, image: &str) -> Result<LaunchedSession, ApiError>;
}

/// Talks to the hub over its local address, authenticated with the
/// service's API token.
#[derive(Debug, Clone)]
pub struct HubClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("building hub HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    /// `<base>/hub/api/users/<user>/server`, with `user` kept as one
    /// encoded path segment.
    fn server_url(&self, user: &str) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ApiError::bad_gateway(format!("hub URL '{}': {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::bad_gateway(format!("hub URL '{}' has no path", self.base_url)))?
            .pop_if_empty()
            .extend(["hub", "api", "users", user, "server"]);
        Ok(url)
    }
}

#[async_trait]
impl SessionLauncher for HubClient {
    async fn launch(&self, user: &str, image: &str) -> Result<LaunchedSession, ApiError> {
        let url = self.server_url(user)?;
        debug!("POST {url} image={image}");

        let resp = self
            .client
            .post(url.clone())
            .header(AUTHORIZATION, format!("token {}", self.token))
            .json(&json!({ "image": image }))
            .send()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("hub unreachable at {url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("hub refused session for {user} ({status}): {body}");
            return Err(match status {
                StatusCode::CONFLICT => ApiError::conflict(message),
                StatusCode::BAD_REQUEST => ApiError::bad_request(message),
                _ => ApiError::bad_gateway(message),
            });
        }

        resp.json()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("unreadable hub response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Path, http::HeaderMap, routing::post};
    use serde_json::Value;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn launch_sends_token_and_image() {
        let app = Router::new().route(
            "/hub/api/users/{user}/server",
            post(
                |Path(user): Path<String>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers[AUTHORIZATION], "token s3cret");
                    (
                        axum::http::StatusCode::CREATED,
                        Json(json!({
                            "user": user,
                            "container": format!("binderbox-{user}"),
                            "image": body["image"],
                            "url": "http://10.0.0.5:49153/",
                            "token": "abc",
                            "status": {"state": "running"}
                        })),
                    )
                },
            ),
        );
        let base = serve(app).await;

        let client = HubClient::new(format!("{base}/"), "s3cret").unwrap();
        let session = client.launch("alice", "r2d-demo:main").await.unwrap();
        assert_eq!(session.container, "binderbox-alice");
        assert_eq!(session.url.as_deref(), Some("http://10.0.0.5:49153/"));
        assert_eq!(session.token.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn conflict_is_passed_through() {
        let app = Router::new().route(
            "/hub/api/users/{user}/server",
            post(|| async { (axum::http::StatusCode::CONFLICT, "already running") }),
        );
        let base = serve(app).await;

        let client = HubClient::new(base, "t").unwrap();
        let err = client.launch("alice", "img:tag").await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unreachable_hub_is_a_gateway_error() {
        let client = HubClient::new("http://127.0.0.1:1", "t").unwrap();
        let err = client.launch("alice", "img:tag").await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn user_stays_inside_its_path_segment() {
        let client = HubClient::new("http://localhost:8000/", "t").unwrap();
        assert_eq!(
            client.server_url("alice").unwrap().as_str(),
            "http://localhost:8000/hub/api/users/alice/server"
        );

        let escaped = client.server_url("bob/../alice").unwrap();
        assert_eq!(
            escaped.as_str(),
            "http://localhost:8000/hub/api/users/bob%2F..%2Falice/server"
        );
    }

    #[tokio::test]
    async fn traversal_in_user_does_not_reach_another_session() {
        let app = Router::new().route(
            "/hub/api/users/{user}/server",
            post(|Path(user): Path<String>| async move {
                Json(json!({ "container": format!("binderbox-{user}") }))
            }),
        );
        let base = serve(app).await;

        let client = HubClient::new(base, "t").unwrap();
        let session = client.launch("bob/../alice", "img:tag").await.unwrap();
        assert_ne!(session.container, "binderbox-alice");
        assert_eq!(session.container, "binderbox-bob/../alice");
    }
}
