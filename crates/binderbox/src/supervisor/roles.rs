//! Per-role configuration assembly.
//!
//! Both functions are pure: everything they read comes from the
//! [`RoleContext`] and the strategy table.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use log::debug;

use super::{ServiceDescriptor, SupervisorError};
use crate::build_service::BuildServiceConfig;
use crate::container::Engine;
use crate::env::{API_TOKEN_VAR, BASE_URL_VAR, ProcessEnv, SERVICE_PREFIX_VAR};
use crate::hub::{AuthMode, HubConfig};
use crate::settings::AppConfig;
use crate::strategy::StrategyTable;

/// Inputs shared by both roles, captured once at startup.
#[derive(Debug, Clone)]
pub struct RoleContext {
    pub engine: Engine,
    pub env: ProcessEnv,
    pub settings: AppConfig,
    /// Outward-facing address of this host.
    pub host: IpAddr,
    /// Path of the running executable, used to re-invoke it as a service.
    pub executable: PathBuf,
    /// Config file this process loaded; handed on to managed services.
    pub config_file: PathBuf,
}

/// Assemble the hub configuration for the resolved engine.
pub fn configure_hub(
    ctx: &RoleContext,
    strategies: &dyn StrategyTable,
) -> Result<HubConfig, SupervisorError> {
    let hub = &ctx.settings.hub;
    let bind_ip: IpAddr = hub.bind_ip.parse().map_err(|_| {
        SupervisorError::InvalidConfig(format!("hub.bind_ip '{}' is not an IP address", hub.bind_ip))
    })?;

    let external_url = ctx.env.external_url_override().map(str::to_string);
    let service = ServiceDescriptor::build_service(
        &hub.service_name,
        &hub.service_url,
        &ctx.executable,
        ctx.engine,
        &ctx.config_file,
        external_url.as_deref(),
    );
    let default_url = service.prefix();

    let config = HubConfig {
        log_level: "DEBUG".to_string(),
        auth: AuthMode::Disabled,
        bind_ip,
        port: hub.port,
        connect_ip: ctx.host,
        external_url,
        spawn: strategies.spawn(ctx.engine),
        endpoints: ctx.settings.engine.endpoints(&ctx.env),
        services: vec![service],
        default_url,
        session_port: hub.session_port,
    };
    debug!("hub configuration: {config:?}");
    Ok(config)
}

/// Assemble the build-service configuration for the resolved engine.
///
/// Fails with [`SupervisorError::MissingCredential`] before consulting any
/// strategy when the hub did not hand over an API token.
pub fn configure_build_service(
    ctx: &RoleContext,
    strategies: &dyn StrategyTable,
) -> Result<BuildServiceConfig, SupervisorError> {
    let api_token = ctx
        .env
        .api_token()
        .ok_or(SupervisorError::MissingCredential { var: API_TOKEN_VAR })?
        .to_string();

    let build = strategies.build(ctx.engine);
    let registry = strategies.registry(ctx.engine);
    if build.engine != ctx.engine || build.use_registry != registry.uses_registry() {
        return Err(SupervisorError::InvalidConfig(format!(
            "build strategy for {} disagrees with its registry strategy",
            ctx.engine
        )));
    }

    let port = ctx.settings.hub.port;
    let hub_url = ctx
        .env
        .external_url_override()
        .or_else(|| ctx.env.get_non_empty(BASE_URL_VAR))
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://{}:{port}", ctx.host));
    let base_url = ctx
        .env
        .get_non_empty(SERVICE_PREFIX_VAR)
        .unwrap_or("/")
        .to_string();

    let settings = &ctx.settings.build;
    let config = BuildServiceConfig {
        engine: ctx.engine,
        debug: true,
        use_registry: build.use_registry,
        builder_required: false,
        push_secret: None,
        about_message: settings.about_message.clone(),
        banner_message: settings.banner_message.clone(),
        hub_url_local: format!("http://localhost:{port}"),
        base_url,
        hub_url,
        listen: listen_addr(&ctx.settings.hub.service_url)?,
        api_token,
        build,
        registry,
    };
    debug!("build-service configuration for {}", config.engine);
    Ok(config)
}

/// Socket address a service URL such as `http://localhost:8585` listens on.
fn listen_addr(service_url: &str) -> Result<SocketAddr, SupervisorError> {
    let invalid = |why: &str| {
        SupervisorError::InvalidConfig(format!("hub.service_url '{service_url}': {why}"))
    };
    let url = reqwest::Url::parse(service_url).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("no port"))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(&e.to_string()))?
        .collect::<Vec<_>>();
    addrs.sort_by_key(|a| !a.is_ipv4());
    addrs.into_iter().next().ok_or_else(|| invalid("host does not resolve"))
}
