//! Single-host platform that builds repositories into container images and
//! launches interactive sessions on them, on either docker or podman.
//!
//! One executable plays two roles: the hub (session orchestration, the
//! default) and the build service (launched by the hub as a managed child
//! with `--build-service --engine=<engine>`).

pub mod api_error;
pub mod build;
pub mod build_service;
pub mod cli;
pub mod container;
pub mod env;
pub mod hub;
pub mod net;
pub mod settings;
pub mod spawner;
pub mod strategy;
pub mod supervisor;
