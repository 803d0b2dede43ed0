//! Hub HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

use super::HubConfig;
use crate::api_error::ApiError;
use crate::container::validate_user_name;
use crate::env::{API_URL_VAR, SERVICE_PREFIX_VAR};
use crate::spawner::{SessionHandle, SessionRequest, SessionSpawner, SessionStatus};
use crate::supervisor::ServiceDescriptor;

/// One user's session. Locked for the whole of a start, stop or inspect so
/// requests for the same user are serialized.
type SessionSlot = Arc<Mutex<Option<SessionHandle>>>;

/// Shared state behind the hub routes.
#[derive(Clone)]
pub struct HubState {
    config: Arc<HubConfig>,
    spawner: Arc<dyn SessionSpawner>,
    /// Held only to look up or create a slot, never across engine calls.
    sessions: Arc<Mutex<HashMap<String, SessionSlot>>>,
    /// Managed-service API tokens and whether the service is an admin.
    service_tokens: Arc<HashMap<String, bool>>,
}

impl HubState {
    pub fn new(config: Arc<HubConfig>, spawner: Arc<dyn SessionSpawner>) -> Self {
        Self {
            config,
            spawner,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            service_tokens: Arc::new(HashMap::new()),
        }
    }

    /// Accept `token` from a managed service.
    pub fn with_service_token(mut self, token: impl Into<String>, admin: bool) -> Self {
        Arc::make_mut(&mut self.service_tokens).insert(token.into(), admin);
        self
    }

    async fn slot(&self, user: &str) -> SessionSlot {
        self.sessions
            .lock()
            .await
            .entry(user.to_string())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, user: &str) -> Option<SessionSlot> {
        self.sessions.lock().await.get(user).cloned()
    }

    /// Anonymous callers are let in while authentication is disabled. A
    /// presented token must belong to an admin service to act on sessions.
    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(());
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("token "))
            .ok_or_else(|| ApiError::forbidden("malformed Authorization header"))?;

        match self.service_tokens.get(token) {
            Some(true) => Ok(()),
            Some(false) => Err(ApiError::forbidden(
                "service is not allowed to manage sessions",
            )),
            None => Err(ApiError::forbidden("unknown service token")),
        }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/hub/health", get(health))
        .route("/hub/api/services", get(list_services))
        .route(
            "/hub/api/users/{user}/server",
            get(session_status).post(start_session).delete(stop_session),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub engine: String,
    pub public_url: String,
    pub default_url: String,
}

async fn health(State(state): State<HubState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: state.config.spawn.engine.to_string(),
        public_url: state.config.public_url(),
        default_url: state.config.default_url.clone(),
    })
}

async fn list_services(State(state): State<HubState>) -> Json<Vec<ServiceDescriptor>> {
    Json(state.config.services.clone())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub image: String,
}

/// A user's session as reported by the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user: String,
    pub image: String,
    pub container: String,
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub status: SessionStatus,
}

impl SessionInfo {
    fn new(config: &HubConfig, handle: &SessionHandle, status: SessionStatus) -> Self {
        Self {
            user: handle.user.clone(),
            image: handle.image.clone(),
            container: handle.container_name.clone(),
            url: handle.host_port.map(|port| config.session_url(port)),
            token: None,
            status,
        }
    }
}

#[instrument(skip(state, headers, body))]
async fn start_session(
    State(state): State<HubState>,
    Path(user): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    state.authorize(&headers)?;
    validate_user_name(&user)?;

    let slot = state.slot(&user).await;
    let mut current = slot.lock().await;

    let stale = match current.as_ref() {
        Some(existing) => match state.spawner.status(existing).await? {
            SessionStatus::Running => {
                return Err(ApiError::conflict(format!(
                    "user {user} already has a running session"
                )));
            }
            _ => true,
        },
        None => false,
    };
    if stale {
        *current = None;
    }

    let token = Uuid::new_v4().simple().to_string();
    let request = SessionRequest::new(&user, &body.image, state.config.session_port)
        .env("JUPYTER_TOKEN", &token)
        .env("JUPYTERHUB_USER", &user)
        .env(API_URL_VAR, state.config.api_url())
        .env(SERVICE_PREFIX_VAR, format!("/user/{user}/"));

    let handle = state.spawner.start(&request).await?;
    info!(user = %user, image = %body.image, "session started");

    let mut info = SessionInfo::new(&state.config, &handle, SessionStatus::Running);
    info.token = Some(token);
    *current = Some(handle);

    Ok((StatusCode::CREATED, Json(info)))
}

async fn session_status(
    State(state): State<HubState>,
    Path(user): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let not_found = || ApiError::not_found(format!("session for {user}"));
    let slot = state.existing_slot(&user).await.ok_or_else(not_found)?;
    let current = slot.lock().await;
    let handle = current.as_ref().ok_or_else(not_found)?;

    let status = state.spawner.status(handle).await?;
    Ok(Json(SessionInfo::new(&state.config, handle, status)))
}

#[instrument(skip(state, headers))]
async fn stop_session(
    State(state): State<HubState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state.authorize(&headers)?;

    let not_found = || ApiError::not_found(format!("session for {user}"));
    let slot = state.existing_slot(&user).await.ok_or_else(not_found)?;
    let mut current = slot.lock().await;
    let handle = current.take().ok_or_else(not_found)?;

    state.spawner.stop(&handle).await?;
    info!(user = %user, "session stopped");
    Ok(StatusCode::NO_CONTENT)
}
