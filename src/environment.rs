//! Isolated run environment (container) lifecycle.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EnvironmentSettings;
use crate::error::BenchError;
use crate::exec::CommandSpec;
use crate::retry::{Backoff, retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Missing,
    Running,
    Stopped,
}

/// Operations the manager needs from a container engine.
pub trait ContainerRuntime {
    fn inspect(&self, name: &str) -> Result<ContainerState>;
    fn image_present(&self, image: &str) -> Result<bool>;
    fn pull(&self, image: &str) -> Result<()>;
    fn create(&self, name: &str, image: &str, mounts: &[PathBuf], extra_args: &[String])
    -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    /// Run a probe inside the container; `true` when it exits 0.
    fn probe(&self, name: &str, args: &[&str]) -> Result<bool>;
    /// Run `spec` inside the container with inherited stdio, returning the
    /// exit code.
    fn exec(&self, name: &str, spec: &CommandSpec) -> Result<Option<i32>>;
}

/// `docker` (or a compatible CLI such as `podman`) driven as a subprocess.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn locate(runtime: &str) -> Result<Self> {
        let binary = which::which(runtime).map_err(|err| {
            BenchError::EnvironmentFault(format!("{runtime} binary not found: {err}"))
        })?;
        Ok(Self { binary })
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to execute {} {}", self.binary.display(), args.join(" ")))
    }

    fn check(&self, args: &[&str]) -> Result<()> {
        let output = self.output(args)?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary.display(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Command that runs `spec` inside container `name`.
    pub fn exec_spec(&self, name: &str, spec: &CommandSpec) -> CommandSpec {
        let mut args = vec!["exec".to_string()];
        for (key, value) in spec.env() {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(name.to_string());
        args.push(spec.binary().display().to_string());
        args.extend(spec.args().iter().cloned());
        CommandSpec::new(self.binary.clone(), args, Vec::new())
    }
}

impl ContainerRuntime for DockerCli {
    fn inspect(&self, name: &str) -> Result<ContainerState> {
        let output = self.output(&["inspect", "-f", "{{.State.Running}}", name])?;
        if !output.status.success() {
            return Ok(ContainerState::Missing);
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(if running {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        })
    }

    fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.output(&["image", "inspect", image])?.status.success())
    }

    fn pull(&self, image: &str) -> Result<()> {
        self.check(&["pull", image])
    }

    fn create(
        &self,
        name: &str,
        image: &str,
        mounts: &[PathBuf],
        extra_args: &[String],
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), name.into()];
        args.extend(extra_args.iter().cloned());
        for mount in mounts {
            let path = mount.display().to_string();
            args.push("-v".into());
            args.push(format!("{path}:{path}"));
        }
        args.extend([image.to_string(), "sleep".into(), "infinity".into()]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.check(&refs)
    }

    fn start(&self, name: &str) -> Result<()> {
        self.check(&["start", name])
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.check(&["stop", name])
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.check(&["rm", "-f", name])
    }

    fn probe(&self, name: &str, args: &[&str]) -> Result<bool> {
        let mut full = vec!["exec", name];
        full.extend_from_slice(args);
        Ok(self.output(&full)?.status.success())
    }

    fn exec(&self, name: &str, spec: &CommandSpec) -> Result<Option<i32>> {
        let remote = self.exec_spec(name, spec);
        info!(command = %remote.describe(), "executing inside environment");
        let status = remote
            .to_command()
            .status()
            .with_context(|| format!("failed to execute {}", remote.describe()))?;
        Ok(status.code())
    }
}

/// A provisioned environment the in-environment phase runs in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEnvironment {
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub mounts: Vec<PathBuf>,
}

/// Ensures exactly one valid environment per (image, tag).
pub struct EnvironmentManager<R: ContainerRuntime> {
    runtime: R,
    name_prefix: String,
    container_args: Vec<String>,
    pull_backoff: Backoff,
    canary: PathBuf,
}

impl<R: ContainerRuntime> EnvironmentManager<R> {
    /// `canary` must be readable inside a healthy environment; the driver
    /// passes its own executable.
    pub fn new(runtime: R, settings: &EnvironmentSettings, canary: PathBuf) -> Self {
        Self {
            runtime,
            name_prefix: settings.name_prefix.clone(),
            container_args: settings.container_args.clone(),
            pull_backoff: Backoff::from_secs(&settings.pull_backoff_secs),
            canary,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.pull_backoff = backoff;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn environment_name(&self, image: &str, tag: &str) -> String {
        let sanitize = |raw: &str| -> String {
            raw.chars()
                .map(|ch| match ch {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | '-' => ch,
                    _ => '-',
                })
                .collect()
        };
        format!("{}-{}-{}", self.name_prefix, sanitize(image), sanitize(tag))
    }

    /// Required mounts plus the directory holding the canary.
    fn mount_set(&self, mounts: &[PathBuf]) -> Vec<PathBuf> {
        let mut set: BTreeSet<PathBuf> = mounts.iter().cloned().collect();
        if let Some(parent) = self.canary.parent() {
            set.insert(parent.to_path_buf());
        }
        set.into_iter().collect()
    }

    pub fn ensure(&self, image: &str, tag: &str, mounts: &[PathBuf]) -> Result<RunEnvironment> {
        let name = self.environment_name(image, tag);
        let image_ref = format!("{image}:{tag}");
        let mounts = self.mount_set(mounts);

        match self.runtime.inspect(&name)? {
            ContainerState::Running => {
                let problems = self.validate(&name, &mounts)?;
                if problems.is_empty() {
                    info!(environment = %name, "reusing running environment");
                    return Ok(self.environment(name, image_ref, mounts));
                }
                warn!(environment = %name, problems = ?problems, "environment invalid; recreating");
                self.destroy(&name)?;
            }
            ContainerState::Stopped => {
                info!(environment = %name, "starting stopped environment");
                self.runtime.start(&name)?;
                let problems = self.validate(&name, &mounts)?;
                if problems.is_empty() {
                    return Ok(self.environment(name, image_ref, mounts));
                }
                warn!(environment = %name, problems = ?problems, "environment invalid; recreating");
                self.destroy(&name)?;
            }
            ContainerState::Missing => {}
        }

        self.resolve_image(&image_ref)?;
        info!(environment = %name, image = %image_ref, mounts = mounts.len(), "creating environment");
        self.runtime
            .create(&name, &image_ref, &mounts, &self.container_args)
            .map_err(|err| BenchError::EnvironmentFault(format!("create {name}: {err:#}")))?;

        let problems = self.validate(&name, &mounts)?;
        if !problems.is_empty() {
            self.destroy(&name)?;
            return Err(BenchError::EnvironmentFault(format!(
                "fresh environment {name} failed validation: {}",
                problems.join("; ")
            ))
            .into());
        }
        Ok(self.environment(name, image_ref, mounts))
    }

    fn environment(&self, name: String, image: String, mounts: Vec<PathBuf>) -> RunEnvironment {
        RunEnvironment {
            name,
            image,
            state: ContainerState::Running,
            mounts,
        }
    }

    fn resolve_image(&self, image_ref: &str) -> Result<()> {
        if self.runtime.image_present(image_ref)? {
            return Ok(());
        }
        retry(&self.pull_backoff, "image pull", |attempt| {
            info!(image = %image_ref, attempt = attempt + 1, "pulling image");
            self.runtime.pull(image_ref)
        })
        .map_err(|err| {
            BenchError::EnvironmentFault(format!(
                "image {image_ref} unresolvable after {} attempts: {err:#}",
                self.pull_backoff.attempts()
            ))
            .into()
        })
    }

    /// Problems found inside the environment; empty means valid.
    pub fn validate(&self, name: &str, mounts: &[PathBuf]) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        for mount in mounts {
            let path = mount.display().to_string();
            if !self.runtime.probe(name, &["test", "-e", &path])? {
                problems.push(format!("mount {path} not visible"));
            }
        }
        let canary = self.canary.display().to_string();
        if !self.runtime.probe(name, &["test", "-r", &canary])? {
            problems.push(format!("canary {canary} not readable"));
        }
        Ok(problems)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        if let Err(err) = self.runtime.stop(name) {
            warn!(environment = %name, error = %err, "stop failed; forcing removal");
        }
        self.runtime.remove(name)
    }

    /// Run a command inside the environment (the remote-invocation
    /// primitive).
    pub fn exec(&self, environment: &RunEnvironment, spec: &CommandSpec) -> Result<Option<i32>> {
        self.runtime.exec(&environment.name, spec)
    }

    pub fn teardown(&self, environment: &mut RunEnvironment) -> Result<()> {
        if environment.state == ContainerState::Missing {
            return Ok(());
        }
        info!(environment = %environment.name, "tearing down environment");
        self.destroy(&environment.name)?;
        environment.state = ContainerState::Missing;
        Ok(())
    }
}

/// Path of the running executable, used as the environment canary.
pub fn canary_path() -> Result<PathBuf> {
    std::env::current_exe().context("unable to resolve the fleetbench executable path")
}

pub fn is_within(path: &Path, mounts: &[PathBuf]) -> bool {
    mounts.iter().any(|mount| path.starts_with(mount))
}
