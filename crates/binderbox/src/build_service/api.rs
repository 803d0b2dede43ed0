//! Build-service HTTP API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use super::BuildServiceConfig;
use super::hub_client::SessionLauncher;
use crate::api_error::ApiError;
use crate::build::{ImageBuilder, ImageSpec};
use crate::container::{ImageRegistry, validate_user_name};

/// Shared state behind the build-service routes.
#[derive(Clone)]
pub struct BuildServiceState {
    config: Arc<BuildServiceConfig>,
    builder: Arc<dyn ImageBuilder>,
    registry: Arc<dyn ImageRegistry>,
    launcher: Arc<dyn SessionLauncher>,
}

impl BuildServiceState {
    pub fn new(
        config: Arc<BuildServiceConfig>,
        builder: Arc<dyn ImageBuilder>,
        registry: Arc<dyn ImageRegistry>,
        launcher: Arc<dyn SessionLauncher>,
    ) -> Self {
        Self {
            config,
            builder,
            registry,
            launcher,
        }
    }
}

/// Routes mounted under the service's base URL.
pub fn router(state: BuildServiceState) -> Router {
    let base = state.config.base_url.trim_end_matches('/').to_string();
    let routes = Router::new()
        .route("/health", get(health))
        .route("/build", post(build))
        .with_state(state);

    let app = if base.is_empty() {
        routes
    } else {
        Router::new().nest(&base, routes)
    };
    app.layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub engine: String,
    pub use_registry: bool,
    pub about: String,
    pub banner: String,
}

async fn health(State(state): State<BuildServiceState>) -> Json<HealthResponse> {
    let config = &state.config;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: config.engine.to_string(),
        use_registry: config.use_registry,
        about: config.about_message.clone(),
        banner: config.banner_message.clone(),
    })
}

fn default_ref() -> String {
    "HEAD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repo: String,
    #[serde(rename = "ref", default = "default_ref")]
    pub git_ref: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    /// Image reference the session runs.
    pub image: String,
    /// False when the registry already had the image.
    pub rebuilt: bool,
    pub session_url: Option<String>,
    pub token: Option<String>,
    pub hub_url: String,
}

#[instrument(skip(state, req), fields(repo = %req.repo, user = %req.user))]
async fn build(
    State(state): State<BuildServiceState>,
    Json(req): Json<BuildRequest>,
) -> Result<Json<BuildResponse>, ApiError> {
    if req.repo.trim().is_empty() {
        return Err(ApiError::bad_request("repo must not be empty"));
    }
    validate_user_name(&req.user)?;

    let config = &state.config;
    let spec = ImageSpec::for_repo(&config.build.image_prefix, &req.repo, &req.git_ref)?;

    let present = state.registry.image_exists(&spec.name, &spec.tag).await?;
    let image = if present {
        info!(image = %spec.reference(), "image already present, skipping build");
        spec.reference()
    } else {
        state
            .builder
            .build(&req.repo, &req.git_ref, &spec.reference())
            .await?
    };

    let session = state.launcher.launch(&req.user, &image).await?;
    info!(image = %image, "session requested");

    Ok(Json(BuildResponse {
        image,
        rebuilt: !present,
        session_url: session.url,
        token: session.token,
        hub_url: config.hub_url.clone(),
    }))
}
