//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;

use crate::container::RequestedEngine;
use crate::supervisor::Role;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Single-host repository build-and-launch platform on docker or podman.",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonOpts,
    /// Container engine to use; `auto` tries docker, then podman
    #[arg(long, value_enum, default_value_t = RequestedEngine::Auto)]
    pub engine: RequestedEngine,
    /// Run as the hub's managed build service
    #[arg(long = "build-service", hide = true)]
    pub build_service: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn role(&self) -> Role {
        if self.build_service {
            Role::BuildService
        } else {
            Role::Hub
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Enable debug logging (equivalent to -v)
    #[arg(long, global = true)]
    pub debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    pub trace: bool,
    /// Emit JSON log lines and JSON output
    #[arg(long, global = true, conflicts_with = "yaml")]
    pub json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    pub yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    pub no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    pub color: ColorOption,
}

impl CommonOpts {
    /// Log level requested on the command line, if any flag asked for one.
    pub fn requested_log_level(&self) -> Option<LevelFilter> {
        if self.quiet {
            Some(LevelFilter::Off)
        } else if self.trace {
            Some(LevelFilter::Trace)
        } else if self.debug {
            Some(LevelFilter::Debug)
        } else {
            match self.verbose {
                0 => None,
                1 => Some(LevelFilter::Debug),
                _ => Some(LevelFilter::Trace),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
