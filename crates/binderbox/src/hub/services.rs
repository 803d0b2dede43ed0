//! Managed services: child processes the hub launches and watches.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use futures::future::select_all;
use log::{error, info};
use tokio::process::{Child, Command};

use super::HubConfig;
use crate::env::{API_TOKEN_VAR, API_URL_VAR, BASE_URL_VAR, SERVICE_NAME_VAR, SERVICE_PREFIX_VAR};
use crate::supervisor::ServiceDescriptor;

/// Environment a managed service is launched with, on top of the hub's own.
pub fn service_env(
    descriptor: &ServiceDescriptor,
    config: &HubConfig,
    token: &str,
) -> BTreeMap<String, String> {
    let mut env = descriptor.environment.clone();
    env.insert(API_TOKEN_VAR.to_string(), token.to_string());
    env.insert(SERVICE_NAME_VAR.to_string(), descriptor.name.clone());
    env.insert(SERVICE_PREFIX_VAR.to_string(), descriptor.prefix());
    env.insert(BASE_URL_VAR.to_string(), config.public_url());
    env.insert(API_URL_VAR.to_string(), config.api_url());
    env
}

/// A running managed service.
#[derive(Debug)]
pub struct ManagedService {
    pub name: String,
    child: Child,
}

impl ManagedService {
    /// Start the service's command. The process is killed if the hub drops it.
    pub fn launch(descriptor: &ServiceDescriptor, config: &HubConfig, token: &str) -> Result<Self> {
        let (program, args) = descriptor
            .command
            .split_first()
            .ok_or_else(|| anyhow!("service {} has an empty command", descriptor.name))?;

        let child = Command::new(program)
            .args(args)
            .envs(service_env(descriptor, config, token))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching service {}", descriptor.name))?;

        info!(
            "launched service {} (pid {:?}) at {}",
            descriptor.name,
            child.id(),
            descriptor.url
        );

        Ok(Self {
            name: descriptor.name.clone(),
            child,
        })
    }
}

/// Wait until any managed service exits and report it as an error.
///
/// Never resolves when there is nothing to watch.
pub(super) async fn supervise(mut services: Vec<ManagedService>) -> Result<()> {
    if services.is_empty() {
        return std::future::pending().await;
    }

    let waits = services.iter_mut().map(|svc| {
        Box::pin(async move {
            let status = svc.child.wait().await;
            (svc.name.clone(), status)
        })
    });
    let ((name, status), _, _) = select_all(waits).await;

    let status = status.with_context(|| format!("waiting on service {name}"))?;
    error!("service {name} exited with {status}");
    Err(anyhow!("managed service {name} exited unexpectedly ({status})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Engine;
    use crate::env::EXTERNAL_URL_VAR;
    use crate::hub::tests::test_config;
    use std::path::Path;

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::build_service(
            "binder",
            "http://localhost:8585",
            Path::new("/usr/bin/binderbox"),
            Engine::Podman,
            Path::new("/etc/binderbox/config.toml"),
            None,
        )
    }

    #[test]
    fn env_carries_token_prefix_and_urls() {
        let env = service_env(&descriptor(), &test_config(), "t0k");
        assert_eq!(env[API_TOKEN_VAR], "t0k");
        assert_eq!(env[SERVICE_NAME_VAR], "binder");
        assert_eq!(env[SERVICE_PREFIX_VAR], "/services/binder/");
        assert_eq!(env[BASE_URL_VAR], "http://10.0.0.5:0/");
        assert_eq!(env[EXTERNAL_URL_VAR], "");
    }

    #[test]
    fn base_url_follows_external_override() {
        let mut config = test_config();
        config.external_url = Some("https://example.test".to_string());
        let env = service_env(&descriptor(), &config, "t0k");
        assert_eq!(env[BASE_URL_VAR], "https://example.test");
    }

    #[tokio::test]
    async fn exiting_service_is_reported() {
        let mut desc = descriptor();
        desc.command = vec!["true".to_string()];
        let svc = ManagedService::launch(&desc, &test_config(), "t0k").unwrap();
        let err = supervise(vec![svc]).await.unwrap_err();
        assert!(err.to_string().contains("binder"));
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut desc = descriptor();
        desc.command.clear();
        assert!(ManagedService::launch(&desc, &test_config(), "t0k").is_err());
    }
}
