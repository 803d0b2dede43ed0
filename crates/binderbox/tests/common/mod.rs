//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::Value;
use tower::ServiceExt;

use binderbox::build::{BuildConfig, BuilderInvocation, ImageBuilder};
use binderbox::build_service::BuildServiceConfig;
use binderbox::container::{ContainerError, ContainerResult, Engine, RegistryKind};
use binderbox::hub::{AuthMode, HubConfig};
use binderbox::settings::EngineEndpoints;
use binderbox::spawner::{
    SessionHandle, SessionRequest, SessionSpawner, SessionStatus, SpawnConfig,
};

pub const HOST_PORT: u16 = 49153;

pub fn hub_config(engine: Engine) -> HubConfig {
    HubConfig {
        log_level: "DEBUG".to_string(),
        auth: AuthMode::Disabled,
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        connect_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        external_url: None,
        spawn: SpawnConfig::for_engine(engine),
        endpoints: EngineEndpoints::default(),
        services: Vec::new(),
        default_url: "/services/binder/".to_string(),
        session_port: 8888,
    }
}

pub fn build_service_config(engine: Engine, hub_url_local: &str) -> BuildServiceConfig {
    let build = BuildConfig::for_engine(
        engine,
        &BuilderInvocation::new("repo2docker", Vec::new()),
        "localhost/",
    );
    let registry = match engine {
        Engine::Docker => RegistryKind::AlwaysAbsent,
        Engine::Podman => RegistryKind::LocalCli {
            binary: "podman".to_string(),
        },
    };
    BuildServiceConfig {
        engine,
        debug: true,
        use_registry: build.use_registry,
        builder_required: false,
        build,
        registry,
        push_secret: None,
        about_message: "BinderHub-in-a-Box".to_string(),
        banner_message: String::new(),
        hub_url_local: hub_url_local.to_string(),
        base_url: "/services/binder/".to_string(),
        hub_url: "https://binder.example.test".to_string(),
        listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        api_token: "service-token".to_string(),
    }
}

/// Session spawner that keeps containers in memory.
#[derive(Default)]
pub struct MemorySpawner {
    pub running: Mutex<HashMap<String, SessionRequest>>,
}

#[async_trait]
impl SessionSpawner for MemorySpawner {
    async fn start(&self, request: &SessionRequest) -> ContainerResult<SessionHandle> {
        request.validate()?;
        let name = request.container_name();
        self.running
            .lock()
            .unwrap()
            .insert(name.clone(), request.clone());
        Ok(SessionHandle {
            user: request.user.clone(),
            container_id: name.clone(),
            container_name: name,
            image: request.image.clone(),
            host_port: Some(HOST_PORT),
        })
    }

    async fn stop(&self, handle: &SessionHandle) -> ContainerResult<()> {
        self.running.lock().unwrap().remove(&handle.container_id);
        Ok(())
    }

    async fn status(&self, handle: &SessionHandle) -> ContainerResult<SessionStatus> {
        Ok(
            if self.running.lock().unwrap().contains_key(&handle.container_id) {
                SessionStatus::Running
            } else {
                SessionStatus::Missing
            },
        )
    }
}

/// Image builder that records what it was asked to build.
#[derive(Default)]
pub struct RecordingBuilder {
    pub built: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl ImageBuilder for RecordingBuilder {
    async fn build(&self, _repo: &str, _git_ref: &str, image: &str) -> ContainerResult<String> {
        if self.fail {
            return Err(ContainerError::CommandFailed {
                command: "build".to_string(),
                message: "repo2docker exited with 1".to_string(),
            });
        }
        self.built.lock().unwrap().push(image.to_string());
        Ok(image.to_string())
    }
}

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}
