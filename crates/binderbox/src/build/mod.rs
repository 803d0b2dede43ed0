//! Image building.
//!
//! [`BuildConfig::for_engine`] decorates the base builder invocation for the
//! resolved engine; [`Repo2DockerBuilder`] runs it.

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::container::{
    ContainerError, ContainerResult, Engine, image_reference, validate_image_name,
    validate_image_tag,
};

/// The build tool and the arguments it always receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderInvocation {
    pub binary: String,
    pub args: Vec<String>,
}

impl BuilderInvocation {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }
}

/// How the build service invokes the image builder for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub engine: Engine,
    pub invocation: BuilderInvocation,
    /// Engine-specific flags appended after the base arguments.
    pub extra_args: Vec<String>,
    /// Built images are never pushed anywhere.
    pub push_secret_required: bool,
    /// Whether image existence is checked out-of-band before building.
    pub use_registry: bool,
    /// Prefix for image names in the engine's local store.
    pub image_prefix: String,
}

impl BuildConfig {
    /// Build configuration for `engine`, derived from (never mutating) `base`.
    pub fn for_engine(engine: Engine, base: &BuilderInvocation, podman_prefix: &str) -> Self {
        let mut config = Self {
            engine,
            invocation: base.clone(),
            extra_args: Vec::new(),
            push_secret_required: false,
            use_registry: false,
            image_prefix: String::new(),
        };

        if engine == Engine::Podman {
            config.extra_args = vec!["--engine".to_string(), Engine::Podman.to_string()];
            config.use_registry = true;
            config.image_prefix = podman_prefix.to_string();
        }

        config
    }

    /// Full argument list for building `repo` at `git_ref` into `image`.
    pub fn command_args(&self, repo: &str, git_ref: &str, image: &str) -> Vec<String> {
        let mut args = self.invocation.args.clone();
        args.extend(self.extra_args.iter().cloned());
        args.extend([
            "--ref".to_string(),
            git_ref.to_string(),
            "--image-name".to_string(),
            image.to_string(),
            "--no-run".to_string(),
            repo.to_string(),
        ]);
        args
    }
}

/// Name and tag of the image built from a repository reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub tag: String,
}

impl ImageSpec {
    /// Derive a stable image name from the repository and a tag from the ref.
    pub fn for_repo(prefix: &str, repo: &str, git_ref: &str) -> ContainerResult<Self> {
        let slug = slugify(repo, 200);
        if slug.is_empty() {
            return Err(ContainerError::InvalidInput(format!(
                "repository '{repo}' does not contain any usable characters"
            )));
        }
        let tag = slugify(git_ref, 128);

        let spec = Self {
            name: format!("{prefix}r2d-{slug}"),
            tag,
        };
        validate_image_name(&spec.name)?;
        validate_image_tag(&spec.tag)?;
        Ok(spec)
    }

    pub fn reference(&self) -> String {
        image_reference(&self.name, &self.tag)
    }
}

/// Lowercase, collapse runs of anything non-alphanumeric into '-', trim.
fn slugify(input: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    slug.truncate(max_len);
    slug.trim_end_matches('-').to_string()
}

/// Turns a repository reference into a runnable image.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, repo: &str, git_ref: &str, image: &str) -> ContainerResult<String>;
}

/// Runs the configured build tool (repo2docker by default) as a subprocess.
#[derive(Debug, Clone)]
pub struct Repo2DockerBuilder {
    config: BuildConfig,
}

impl Repo2DockerBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ImageBuilder for Repo2DockerBuilder {
    async fn build(&self, repo: &str, git_ref: &str, image: &str) -> ContainerResult<String> {
        validate_image_name(image)?;

        let binary = &self.config.invocation.binary;
        let args = self.config.command_args(repo, git_ref, image);
        debug!("{} {}", binary, args.join(" "));

        let output = Command::new(binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::command_failed("build", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::command_failed("build", stderr.trim()));
        }

        info!("built image {image} from {repo}@{git_ref}");
        Ok(image.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BuilderInvocation {
        BuilderInvocation::new("repo2docker", vec!["--user-id=1000".to_string()])
    }

    #[test]
    fn docker_keeps_the_base_invocation() {
        let cfg = BuildConfig::for_engine(Engine::Docker, &base(), "localhost/");
        assert_eq!(cfg.invocation, base());
        assert!(cfg.extra_args.is_empty());
        assert!(!cfg.use_registry);
        assert!(!cfg.push_secret_required);
        assert_eq!(cfg.image_prefix, "");
    }

    #[test]
    fn podman_names_the_engine() {
        let cfg = BuildConfig::for_engine(Engine::Podman, &base(), "localhost/");
        assert_eq!(cfg.extra_args, vec!["--engine", "podman"]);
        assert!(cfg.use_registry);
        assert!(!cfg.push_secret_required);
        assert_eq!(cfg.image_prefix, "localhost/");
    }

    #[test]
    fn repeated_selection_returns_independent_values() {
        let shared = base();
        let mut first = BuildConfig::for_engine(Engine::Podman, &shared, "localhost/");
        let second = BuildConfig::for_engine(Engine::Podman, &shared, "localhost/");

        first.extra_args.push("--no-cache".to_string());
        first.invocation.args.clear();

        assert_eq!(second.extra_args, vec!["--engine", "podman"]);
        assert_eq!(second.invocation, base());
        assert_eq!(shared, base());
    }

    #[test]
    fn command_args_order() {
        let cfg = BuildConfig::for_engine(Engine::Podman, &base(), "localhost/");
        let args = cfg.command_args("https://github.com/org/repo", "main", "localhost/r2d-x:main");
        assert_eq!(
            args,
            vec![
                "--user-id=1000",
                "--engine",
                "podman",
                "--ref",
                "main",
                "--image-name",
                "localhost/r2d-x:main",
                "--no-run",
                "https://github.com/org/repo",
            ]
        );
    }

    #[test]
    fn image_spec_from_repo() {
        let spec =
            ImageSpec::for_repo("localhost/", "https://github.com/Org/My_Repo.git", "v1.0").unwrap();
        assert_eq!(spec.name, "localhost/r2d-https-github-com-org-my-repo-git");
        assert_eq!(spec.tag, "v1-0");
        assert_eq!(spec.reference(), format!("{}:v1-0", spec.name));

        assert!(ImageSpec::for_repo("", "///", "main").is_err());
        assert!(ImageSpec::for_repo("", "org/repo", "").is_err());
    }

    #[tokio::test]
    async fn builder_success_returns_image() {
        let cfg = BuildConfig::for_engine(
            Engine::Docker,
            &BuilderInvocation::new("true", Vec::new()),
            "",
        );
        let image = Repo2DockerBuilder::new(cfg)
            .build("org/repo", "main", "r2d-org-repo:main")
            .await
            .unwrap();
        assert_eq!(image, "r2d-org-repo:main");
    }

    #[tokio::test]
    async fn builder_failure_is_reported() {
        let cfg = BuildConfig::for_engine(
            Engine::Docker,
            &BuilderInvocation::new("false", Vec::new()),
            "",
        );
        let err = Repo2DockerBuilder::new(cfg)
            .build("org/repo", "main", "r2d-org-repo:main")
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::CommandFailed { .. }));
    }
}
