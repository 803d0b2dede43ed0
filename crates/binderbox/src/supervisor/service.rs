//! Managed-service descriptors.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::container::Engine;
use crate::env::EXTERNAL_URL_VAR;

/// Hidden flag that switches the executable into the build-service role.
pub const BUILD_SERVICE_FLAG: &str = "--build-service";

/// A child service the hub launches and supervises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub admin: bool,
    /// Program and arguments, launched with the hub's environment.
    pub command: Vec<String>,
    /// Where the service listens.
    pub url: String,
    /// Extra environment on top of the inherited one.
    pub environment: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// Descriptor for the build service: this same executable re-invoked in
    /// the build-service role with the already-resolved engine and the hub's
    /// config file, so the child never probes and reads the same settings.
    pub fn build_service(
        name: &str,
        url: &str,
        executable: &Path,
        engine: Engine,
        config_file: &Path,
        external_url: Option<&str>,
    ) -> Self {
        let mut environment = BTreeMap::new();
        environment.insert(
            EXTERNAL_URL_VAR.to_string(),
            external_url.unwrap_or_default().to_string(),
        );

        Self {
            name: name.to_string(),
            admin: true,
            command: vec![
                executable.display().to_string(),
                BUILD_SERVICE_FLAG.to_string(),
                format!("--engine={engine}"),
                format!("--config={}", config_file.display()),
            ],
            url: url.to_string(),
            environment,
        }
    }

    /// URL path prefix the hub assigns to this service.
    pub fn prefix(&self) -> String {
        format!("/services/{}/", self.name)
    }
}
