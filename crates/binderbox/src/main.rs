use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use log::{LevelFilter, debug, info};

use binderbox::build_service::BuildService;
use binderbox::cli::{Cli, ColorOption, Command, CommonOpts, ConfigCommand};
use binderbox::container::{HostProbe, RequestedEngine, resolve};
use binderbox::env::ProcessEnv;
use binderbox::hub::Hub;
use binderbox::net::host_address_or_loopback;
use binderbox::settings::{APP_NAME, AppConfig};
use binderbox::strategy::EngineStrategies;
use binderbox::supervisor::{
    Role, RoleContext, SupervisorError, configure_build_service, configure_hub, run_build_service,
    run_hub, shutdown_signal,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Some(Command::Config { command }) => handle_config(&ctx, command),
        Some(Command::Completions { shell }) => handle_completions(shell),
        None => run_role(&ctx, cli.engine, cli.role()),
    }
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match &common.config {
            Some(path) => expand_path(path)?,
            None => default_config_dir()?.join("config.toml"),
        };
        let config = load_or_init_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level_filter = self.effective_log_level();
        if level_filter == LevelFilter::Off {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = level_filter.as_str().to_ascii_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }

        // `try_init` also bridges the `log` macros used by the engine and
        // supervisor layers; they obey the same max level.
        log::set_max_level(level_filter);

        Ok(())
    }

    /// Command-line flags win; otherwise the configured level, else info.
    fn effective_log_level(&self) -> LevelFilter {
        self.common.requested_log_level().unwrap_or_else(|| {
            LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Info)
        })
    }
}

fn run_role(ctx: &RuntimeContext, requested: RequestedEngine, role: Role) -> Result<()> {
    let env = ProcessEnv::from_process();
    let endpoints = ctx.config.engine.endpoints(&env);

    let probe = HostProbe::new(
        endpoints.docker_socket.clone(),
        endpoints.podman_binary.clone(),
    );
    let engine = resolve(requested, &probe).map_err(SupervisorError::from)?;

    let role_ctx = RoleContext {
        engine,
        env,
        settings: ctx.config.clone(),
        host: host_address_or_loopback(),
        executable: env::current_exe().context("locating the running executable")?,
        config_file: ctx.config_file.clone(),
    };
    let strategies = EngineStrategies::new(&ctx.config, endpoints);

    match role {
        Role::Hub => {
            let config = configure_hub(&role_ctx, &strategies)?;
            info!("starting hub on {} with {engine}", config.bind_addr());
            run_hub(Hub::new(config), shutdown_signal())?;
        }
        Role::BuildService => {
            let config = configure_build_service(&role_ctx, &strategies)?;
            run_build_service(BuildService::new(config))?;
        }
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if ctx.config_file.exists() && !force {
                info!(
                    "config already exists at {} (use --force to overwrite)",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            AppConfig::write_default(&ctx.config_file)?;
            info!("wrote default config to {}", ctx.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        AppConfig::write_default(path)?;
    }

    let mut config = AppConfig::load(path)?;
    if let Some(socket) = config.engine.docker_socket.take() {
        config.engine.docker_socket = Some(expand_str_path(&socket)?.display().to_string());
    }
    Ok(config)
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path.to_path_buf()),
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
