//! Container engine abstraction.
//!
//! Resolves which engine (docker or podman) is usable on this host and
//! answers local image-existence questions on its behalf. The engine is
//! resolved once per process and then threaded into every strategy.

mod docker;
mod error;
mod probe;
mod registry;

pub use docker::DockerClient;
pub(crate) use docker::api_error;
pub use error::{ContainerError, ContainerResult};
pub use probe::{DEFAULT_DOCKER_SOCKET, EngineProbe, HostProbe, docker_socket_path, resolve};
pub use registry::{AlwaysAbsentRegistry, ImageExistenceOracle, ImageRegistry, RegistryKind};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Container engine in use for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Docker, reached through its local API socket.
    #[default]
    Docker,
    /// Podman, driven through its command line.
    Podman,
}

impl Engine {
    /// Name used on command lines and in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine as requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RequestedEngine {
    /// Probe the host: docker first, then podman.
    #[default]
    Auto,
    Docker,
    Podman,
}

impl RequestedEngine {
    /// The explicitly named engine, if any.
    pub fn explicit(&self) -> Option<Engine> {
        match self {
            RequestedEngine::Auto => None,
            RequestedEngine::Docker => Some(Engine::Docker),
            RequestedEngine::Podman => Some(Engine::Podman),
        }
    }
}

impl From<Engine> for RequestedEngine {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Docker => RequestedEngine::Docker,
            Engine::Podman => RequestedEngine::Podman,
        }
    }
}

/// Join an image name and tag into a single reference.
pub fn image_reference(image: &str, tag: &str) -> String {
    format!("{image}:{tag}")
}

/// Length and character-set rules for one kind of engine-facing name.
struct NameRule {
    what: &'static str,
    max_len: usize,
    first: fn(char) -> bool,
    rest: fn(char) -> bool,
}

impl NameRule {
    fn check(&self, value: &str) -> ContainerResult<()> {
        let reject = |why: String| -> ContainerResult<()> {
            Err(ContainerError::InvalidInput(format!(
                "{} '{value}' {why}",
                self.what
            )))
        };

        let Some(first) = value.chars().next() else {
            return Err(ContainerError::InvalidInput(format!(
                "{} cannot be empty",
                self.what
            )));
        };
        if value.len() > self.max_len {
            return reject(format!("is longer than {} characters", self.max_len));
        }
        if !(self.first)(first) {
            return reject(format!("cannot start with '{first}'"));
        }
        if let Some(bad) = value.chars().find(|c| !(self.rest)(*c)) {
            return reject(format!("contains '{bad}'"));
        }
        Ok(())
    }
}

fn alnum(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

fn alnum_or_underscore(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

const IMAGE_NAME: NameRule = NameRule {
    what: "image name",
    max_len: 256,
    first: alnum,
    rest: |c| name_char(c) || matches!(c, '.' | '/' | ':' | '@'),
};

const IMAGE_TAG: NameRule = NameRule {
    what: "image tag",
    max_len: 128,
    first: alnum_or_underscore,
    rest: |c| name_char(c) || c == '.',
};

const CONTAINER_NAME: NameRule = NameRule {
    what: "container name",
    max_len: 128,
    first: alnum_or_underscore,
    rest: name_char,
};

/// Session owners end up in container names and hub URL paths.
const USER_NAME: NameRule = NameRule {
    what: "user name",
    max_len: 64,
    first: alnum,
    rest: name_char,
};

const ENV_KEY: NameRule = NameRule {
    what: "environment variable key",
    max_len: 256,
    first: |c| c.is_ascii_alphabetic() || c == '_',
    rest: alnum_or_underscore,
};

/// Validate an image name (repository part, optionally with registry host).
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    IMAGE_NAME.check(image)?;
    if image.contains("..") {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains '..'"
        )));
    }
    Ok(())
}

pub fn validate_image_tag(tag: &str) -> ContainerResult<()> {
    IMAGE_TAG.check(tag)
}

pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    CONTAINER_NAME.check(name)
}

/// Validate the owner of a session as accepted by the hub and build APIs.
pub fn validate_user_name(user: &str) -> ContainerResult<()> {
    USER_NAME.check(user)
}

/// Validate an environment variable key passed into a container.
pub fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    ENV_KEY.check(key)
}
