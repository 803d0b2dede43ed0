//! Process environment snapshot.
//!
//! Roles read the environment through a [`ProcessEnv`] captured once at
//! startup instead of calling `std::env` ad hoc, so configuration assembly
//! is a pure function of its inputs.

use std::collections::BTreeMap;

/// Overrides the externally reachable hub URL (NAT, tunnels, reverse proxies).
pub const EXTERNAL_URL_VAR: &str = "JUPYTERHUB_EXTERNAL_URL";
/// Token the hub hands to each managed service.
pub const API_TOKEN_VAR: &str = "JUPYTERHUB_API_TOKEN";
/// URL path prefix the hub assigns to a managed service.
pub const SERVICE_PREFIX_VAR: &str = "JUPYTERHUB_SERVICE_PREFIX";
/// Externally visible base address of the hub.
pub const BASE_URL_VAR: &str = "JUPYTERHUB_BASE_URL";
/// Name of the managed service.
pub const SERVICE_NAME_VAR: &str = "JUPYTERHUB_SERVICE_NAME";
/// Hub API endpoint for managed services and sessions.
pub const API_URL_VAR: &str = "JUPYTERHUB_API_URL";
/// Docker endpoint, as understood by the docker CLI.
pub const DOCKER_HOST_VAR: &str = "DOCKER_HOST";

/// Immutable copy of the environment variables a role cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnv {
    vars: BTreeMap<String, String>,
}

impl ProcessEnv {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Raw value, including empty strings.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Value only when set to something non-empty.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// The external-URL override, if the operator set one.
    pub fn external_url_override(&self) -> Option<&str> {
        self.get_non_empty(EXTERNAL_URL_VAR)
    }

    pub fn api_token(&self) -> Option<&str> {
        self.get_non_empty(API_TOKEN_VAR)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}
