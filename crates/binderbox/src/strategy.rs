//! Engine-keyed strategy table.
//!
//! Everything engine-specific is selected here from the resolved [`Engine`],
//! once, by lookup rather than by subclassing.

use crate::build::{BuildConfig, BuilderInvocation};
use crate::container::{Engine, RegistryKind};
use crate::settings::{AppConfig, EngineEndpoints};
use crate::spawner::SpawnConfig;

/// Maps an engine to its spawn, build and registry strategies.
pub trait StrategyTable {
    fn spawn(&self, engine: Engine) -> SpawnConfig;
    fn build(&self, engine: Engine) -> BuildConfig;
    fn registry(&self, engine: Engine) -> RegistryKind;
}

/// The production table, parameterized by the loaded settings.
#[derive(Debug, Clone)]
pub struct EngineStrategies {
    builder: BuilderInvocation,
    podman_image_prefix: String,
    endpoints: EngineEndpoints,
}

impl EngineStrategies {
    pub fn new(config: &AppConfig, endpoints: EngineEndpoints) -> Self {
        Self {
            builder: BuilderInvocation::new(
                config.build.builder_binary.clone(),
                config.build.builder_args.clone(),
            ),
            podman_image_prefix: config.build.podman_image_prefix.clone(),
            endpoints,
        }
    }
}

impl StrategyTable for EngineStrategies {
    fn spawn(&self, engine: Engine) -> SpawnConfig {
        SpawnConfig::for_engine(engine)
    }

    fn build(&self, engine: Engine) -> BuildConfig {
        BuildConfig::for_engine(engine, &self.builder, &self.podman_image_prefix)
    }

    fn registry(&self, engine: Engine) -> RegistryKind {
        match engine {
            Engine::Docker => RegistryKind::AlwaysAbsent,
            Engine::Podman => RegistryKind::LocalCli {
                binary: self.endpoints.podman_binary.clone(),
            },
        }
    }
}
