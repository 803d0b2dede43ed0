//! Process supervision.
//!
//! One executable, two roles chosen once at startup: the hub, driven on a
//! single-threaded event loop until it finishes or the process is
//! interrupted, and the build service, which runs synchronously.

mod roles;
mod service;

pub use roles::{RoleContext, configure_build_service, configure_hub};
pub use service::{BUILD_SERVICE_FLAG, ServiceDescriptor};

use std::future::Future;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info, warn};
use thiserror::Error;

use crate::container::ContainerError;

/// Role this process plays for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hub,
    BuildService,
}

/// Fatal supervisor errors. Each ends the process with a non-zero status.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Engine(#[from] ContainerError),

    #[error(
        "{var} is not set; the build service must be launched by the hub as a managed service"
    )]
    MissingCredential { var: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("startup failed: {0:#}")]
    StartupFailure(anyhow::Error),

    #[error("could not create event loop: {0}")]
    Runtime(#[source] std::io::Error),
}

/// How a supervised run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Stopped by an operator interrupt before the unit finished.
    Interrupted,
}

/// Application driven by the hub role.
#[async_trait]
pub trait HubApplication: Send {
    async fn initialize(&mut self) -> anyhow::Result<()>;
    async fn start(&mut self) -> anyhow::Result<()>;
}

/// Application driven by the build-service role. `start` runs its own event
/// loop and returns when the service stops.
pub trait BuildServiceApplication {
    fn initialize(&mut self) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
}

/// Run `unit` to completion on a fresh single-threaded event loop, or until
/// `interrupt` resolves.
///
/// A failure of `unit` is always reported, even when it settles together
/// with the interrupt.
pub fn run_until_complete<F, I>(unit: F, interrupt: I) -> Result<RunOutcome, SupervisorError>
where
    F: Future<Output = anyhow::Result<()>>,
    I: Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(SupervisorError::Runtime)?;

    runtime.block_on(async move {
        tokio::pin!(unit);
        tokio::pin!(interrupt);

        tokio::select! {
            biased;
            result = &mut unit => result
                .map(|()| RunOutcome::Completed)
                .map_err(SupervisorError::StartupFailure),
            () = &mut interrupt => {
                info!("Interrupted");
                match unit.as_mut().now_or_never() {
                    Some(Err(e)) => Err(SupervisorError::StartupFailure(e)),
                    Some(Ok(())) => Ok(RunOutcome::Completed),
                    None => Ok(RunOutcome::Interrupted),
                }
            }
        }
    })
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Drive the hub: initialize and start as one unit of work on the event loop.
pub fn run_hub<A, I>(mut app: A, interrupt: I) -> Result<RunOutcome, SupervisorError>
where
    A: HubApplication,
    I: Future<Output = ()>,
{
    let unit = async move {
        app.initialize().await.context("initializing hub")?;
        app.start().await.context("starting hub")
    };

    let outcome = run_until_complete(unit, interrupt);
    match &outcome {
        Ok(RunOutcome::Completed) => info!("hub stopped"),
        Ok(RunOutcome::Interrupted) => info!("hub interrupted"),
        Err(e) => error!("{e}"),
    }
    outcome
}

/// Drive the build service synchronously. Any failure is fatal.
pub fn run_build_service<A: BuildServiceApplication>(mut app: A) -> Result<(), SupervisorError> {
    app.initialize()
        .context("initializing build service")
        .map_err(SupervisorError::StartupFailure)?;
    app.start()
        .context("running build service")
        .map_err(SupervisorError::StartupFailure)
        .inspect_err(|e| error!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, bail};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completed_unit() {
        let outcome = run_until_complete(async { Ok(()) }, std::future::pending()).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[test]
    fn failed_unit_is_startup_failure() {
        let err = run_until_complete(async { Err(anyhow!("bind failed")) }, std::future::pending())
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartupFailure(_)));
        assert!(err.to_string().contains("bind failed"));
    }

    #[test]
    fn interrupt_stops_a_pending_unit() {
        let outcome = run_until_complete(std::future::pending(), async {}).unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
    }

    #[test]
    fn failure_settling_with_interrupt_is_not_swallowed() {
        // The unit is still pending when the interrupt fires and fails right after.
        let unit = async {
            tokio::task::yield_now().await;
            Err(anyhow!("hub failed to start"))
        };
        let err = run_until_complete(unit, async {}).unwrap_err();
        assert!(matches!(err, SupervisorError::StartupFailure(_)));
        assert!(err.to_string().contains("hub failed to start"));
    }

    #[test]
    fn interrupt_during_timer_based_startup() {
        let unit = async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        };
        let interrupt = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert_eq!(
            run_until_complete(unit, interrupt).unwrap(),
            RunOutcome::Interrupted
        );
    }

    struct ScriptedHub {
        fail_initialize: bool,
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HubApplication for ScriptedHub {
        async fn initialize(&mut self) -> anyhow::Result<()> {
            if self.fail_initialize {
                tokio::task::yield_now().await;
                bail!("port already in use");
            }
            Ok(())
        }

        async fn start(&mut self) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[test]
    fn hub_failure_survives_interrupt() {
        let started = Arc::new(AtomicUsize::new(0));
        let hub = ScriptedHub {
            fail_initialize: true,
            started: started.clone(),
        };
        let err = run_hub(hub, async {}).unwrap_err();
        assert!(format!("{err}").contains("port already in use"));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hub_interrupted_while_serving() {
        let started = Arc::new(AtomicUsize::new(0));
        let hub = ScriptedHub {
            fail_initialize: false,
            started: started.clone(),
        };
        let interrupt = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert_eq!(run_hub(hub, interrupt).unwrap(), RunOutcome::Interrupted);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    struct ScriptedBuildService {
        fail_start: bool,
        calls: Vec<&'static str>,
    }

    impl BuildServiceApplication for &mut ScriptedBuildService {
        fn initialize(&mut self) -> anyhow::Result<()> {
            self.calls.push("initialize");
            Ok(())
        }

        fn start(&mut self) -> anyhow::Result<()> {
            self.calls.push("start");
            if self.fail_start {
                bail!("address in use");
            }
            Ok(())
        }
    }

    #[test]
    fn build_service_runs_initialize_then_start() {
        let mut svc = ScriptedBuildService {
            fail_start: false,
            calls: Vec::new(),
        };
        run_build_service(&mut svc).unwrap();
        assert_eq!(svc.calls, vec!["initialize", "start"]);
    }

    #[test]
    fn build_service_start_failure_is_fatal() {
        let mut svc = ScriptedBuildService {
            fail_start: true,
            calls: Vec::new(),
        };
        let err = run_build_service(&mut svc).unwrap_err();
        assert!(matches!(err, SupervisorError::StartupFailure(_)));
    }
}
