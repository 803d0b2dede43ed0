//! File and environment configuration.
//!
//! Loaded from `config.toml` (written with defaults on first run) and layered
//! with `BINDERBOX__SECTION__KEY` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::docker_socket_path;
use crate::env::{DOCKER_HOST_VAR, ProcessEnv};

pub const APP_NAME: &str = "binderbox";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub engine: EngineSettings,
    pub hub: HubSettings,
    pub build: BuildSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Where the container engines live on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Docker API socket. Defaults to `DOCKER_HOST` (unix://) or /var/run/docker.sock.
    pub docker_socket: Option<String>,
    /// Podman binary name or path.
    pub podman_binary: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            docker_socket: None,
            podman_binary: "podman".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn endpoints(&self, env: &ProcessEnv) -> EngineEndpoints {
        let docker_socket = match self.docker_socket.as_deref() {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => docker_socket_path(env.get(DOCKER_HOST_VAR)),
        };
        EngineEndpoints {
            docker_socket,
            podman_binary: self.podman_binary.clone(),
        }
    }
}

/// Resolved engine locations, threaded into probes and spawners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoints {
    pub docker_socket: PathBuf,
    pub podman_binary: String,
}

impl Default for EngineEndpoints {
    fn default() -> Self {
        EngineSettings::default().endpoints(&ProcessEnv::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub bind_ip: String,
    pub port: u16,
    /// Name of the build service as a managed hub service.
    pub service_name: String,
    /// Where the build service listens.
    pub service_url: String,
    /// Port the session server listens on inside its container.
    pub session_port: u16,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port: 8000,
            service_name: "binder".to_string(),
            service_url: "http://localhost:8585".to_string(),
            session_port: 8888,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Image build tool.
    pub builder_binary: String,
    /// Arguments always passed to the build tool.
    pub builder_args: Vec<String>,
    pub about_message: String,
    pub banner_message: String,
    /// Image name prefix when images live in podman's local store.
    pub podman_image_prefix: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            builder_binary: "repo2docker".to_string(),
            builder_args: Vec::new(),
            about_message: "BinderHub-in-a-Box".to_string(),
            banner_message: "See <a href=\"https://github.com/jupyterhub/binderhub\">BinderHub on GitHub</a>"
                .to_string(),
            podman_image_prefix: "localhost/".to_string(),
        }
    }
}

/// Prefix for environment overrides, e.g. `BINDERBOX__HUB__PORT=9000`.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl AppConfig {
    /// Load configuration from `path` (optional) plus environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let prefix = env_prefix();
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(prefix.as_str())
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        built
            .try_deserialize()
            .with_context(|| format!("parsing config from {}", path.display()))
    }

    /// Write the default configuration to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }

        let toml = toml::to_string_pretty(&AppConfig::default())
            .context("serializing default config to TOML")?;
        let mut body = default_config_header(path);
        body.push_str(&toml);
        fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
    }
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n\n",
        APP_NAME,
        path.display()
    )
}
