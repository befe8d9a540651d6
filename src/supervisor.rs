//! Inference server supervision.
//!
//! The server is an opaque process: its log text and a health endpoint are the
//! only signals. Everything that greps the log lives here, behind
//! [`ServerState`].

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::{Child, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use url::Url;

use crate::config::{ServerSettings, VariantSettings};
use crate::error::BenchError;
use crate::exec::{CommandSpec, Placeholders, kill_group, signal_group};
use crate::retry::{Poll, poll_until};
use crate::sweep::HealthGuard;

const INFO_LOG_LIMIT: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Ready,
    Crashed,
    ShutDown,
}

/// What to launch and where its combined output goes.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfig {
    pub command: CommandSpec,
    pub log_path: PathBuf,
    pub model_path: String,
    pub tensor_parallel: u32,
    pub mem_fraction: f64,
    pub features: Vec<String>,
}

impl LaunchConfig {
    /// Server command for one variant: the args template, then global feature
    /// flags, then the variant's own arguments.
    pub fn for_variant(
        server: &ServerSettings,
        variant: &VariantSettings,
        log_path: PathBuf,
        placeholders: &Placeholders,
    ) -> Self {
        let mut placeholders = placeholders.clone();
        placeholders.insert("model", &server.model_path);
        placeholders.insert("tp", server.tensor_parallel);
        placeholders.insert("mem_fraction", server.mem_fraction);
        placeholders.insert("host", &server.host);
        placeholders.insert("port", server.port);
        placeholders.insert("variant", &variant.name);

        let mut env = server.env.clone();
        env.extend(variant.env.iter().cloned());
        let features: Vec<String> = server
            .features
            .iter()
            .chain(variant.extra_args.iter())
            .map(|arg| placeholders.render(arg))
            .collect();
        let command = CommandSpec::from_template(&server.binary, &server.args, &env, &placeholders)
            .with_extra_args(features.clone());

        Self {
            command,
            log_path,
            model_path: server.model_path.clone(),
            tensor_parallel: server.tensor_parallel,
            mem_fraction: server.mem_fraction,
            features,
        }
    }
}

/// Limits and markers driving the readiness state machine.
#[derive(Debug, Clone)]
pub struct SupervisorLimits {
    pub ready_marker: String,
    pub fatal_markers: Vec<String>,
    pub fatal_tail_lines: usize,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub health_timeout: Duration,
    pub shutdown_grace: Duration,
    pub tail_dump_lines: usize,
    pub health_url: Option<String>,
    pub info_url: Option<String>,
}

impl SupervisorLimits {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        let base = settings.base_url();
        Self {
            ready_marker: settings.ready_marker.clone(),
            fatal_markers: settings.fatal_markers.clone(),
            fatal_tail_lines: settings.fatal_tail_lines,
            startup_timeout: Duration::from_secs(settings.startup_timeout_secs),
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            health_timeout: Duration::from_secs(settings.health_timeout_secs),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            tail_dump_lines: settings.tail_dump_lines,
            health_url: Some(join_url(&base, &settings.health_path)),
            info_url: settings
                .info_path
                .as_ref()
                .map(|path| join_url(&base, path)),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    match Url::parse(base).and_then(|url| url.join(path)) {
        Ok(url) => url.to_string(),
        Err(_) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ),
    }
}

/// A launched server process.
#[derive(Debug)]
pub struct ServerHandle {
    pub pid: u32,
    pub state: ServerState,
    pub log_path: PathBuf,
    pub config: LaunchConfig,
    /// Log length when this process started; earlier text belongs to a
    /// previous launch.
    log_offset: u64,
    launched_at: Instant,
    child: Child,
}

impl ServerHandle {
    fn exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(format!("process exited with {status}")),
            Ok(None) => None,
            Err(err) => Some(format!("process state unavailable: {err}")),
        }
    }

    fn log_text(&self) -> Result<String> {
        read_since(&self.log_path, self.log_offset)
    }
}

/// Owns the single server process of a run environment.
pub struct ServerSupervisor {
    limits: SupervisorLimits,
    client: Client,
    handle: Option<ServerHandle>,
    last_launch: Option<LaunchConfig>,
    restarts: u32,
}

impl ServerSupervisor {
    pub fn new(limits: SupervisorLimits) -> Result<Self> {
        let client = Client::builder()
            .user_agent("fleetbench/0.1 (supervisor)")
            .timeout(limits.health_timeout)
            .no_proxy()
            .build()
            .context("failed to build HTTP client for health checks")?;
        Ok(Self {
            limits,
            client,
            handle: None,
            last_launch: None,
            restarts: 0,
        })
    }

    pub fn state(&self) -> ServerState {
        self.handle
            .as_ref()
            .map(|handle| handle.state)
            .unwrap_or(ServerState::Stopped)
    }

    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|handle| handle.pid)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Start the server in the background with combined output appended to
    /// the configured log. Any previous process is stopped first.
    pub fn launch(&mut self, config: LaunchConfig) -> Result<()> {
        let span = info_span!("supervisor.launch", log = %config.log_path.display());
        let _guard = span.enter();

        if self.handle.is_some() {
            self.shutdown()?;
        }

        if let Some(parent) = config.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .with_context(|| format!("failed to open server log {}", config.log_path.display()))?;
        let log_offset = log.metadata().map(|meta| meta.len()).unwrap_or(0);
        let stdout = log.try_clone().context("failed to clone server log")?;

        let child = config
            .command
            .to_group_command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(log))
            .spawn()
            .with_context(|| format!("failed to spawn {}", config.command.binary().display()))?;
        let pid = child.id();
        info!(
            pid,
            model = %config.model_path,
            tp = config.tensor_parallel,
            mem_fraction = config.mem_fraction,
            command = %config.command.describe(),
            "server launched"
        );

        self.last_launch = Some(config.clone());
        self.handle = Some(ServerHandle {
            pid,
            state: ServerState::Starting,
            log_path: config.log_path.clone(),
            config,
            log_offset,
            launched_at: Instant::now(),
            child,
        });
        Ok(())
    }

    /// Block until the readiness marker appears, the process dies, a fatal
    /// marker shows up in the log tail, or the startup timeout elapses.
    pub fn wait_ready(&mut self) -> Result<()> {
        let limits = self.limits.clone();
        let Some(handle) = self.handle.as_mut() else {
            return Err(BenchError::StartupCrash {
                reason: "server was never launched".into(),
            }
            .into());
        };

        enum Startup {
            Ready,
            Crashed(String),
        }

        let resolved = poll_until(limits.poll_interval, limits.startup_timeout, || {
            let text = handle.log_text()?;
            if text.contains(limits.ready_marker.as_str()) {
                return Ok(Poll::Ready(Startup::Ready));
            }
            if let Some(reason) = handle.exited() {
                return Ok(Poll::Ready(Startup::Crashed(reason)));
            }
            let tail = tail_lines(&text, limits.fatal_tail_lines);
            if let Some(marker) = limits
                .fatal_markers
                .iter()
                .find(|marker| tail.contains(marker.as_str()))
            {
                return Ok(Poll::Ready(Startup::Crashed(format!(
                    "fatal marker '{marker}' in server log"
                ))));
            }
            Ok(Poll::Pending)
        })?;

        match resolved {
            Some(Startup::Ready) => {
                handle.state = ServerState::Ready;
                info!(
                    pid = handle.pid,
                    startup_s = handle.launched_at.elapsed().as_secs_f64(),
                    "server ready"
                );
                self.probe_info();
                Ok(())
            }
            Some(Startup::Crashed(reason)) => {
                error!(pid = handle.pid, reason = %reason, "server crashed during startup");
                dump_tail(handle, limits.tail_dump_lines);
                force_kill(handle);
                handle.state = ServerState::Crashed;
                Err(BenchError::StartupCrash { reason }.into())
            }
            None => {
                error!(
                    pid = handle.pid,
                    timeout_s = limits.startup_timeout.as_secs(),
                    "server did not become ready in time"
                );
                dump_tail(handle, limits.tail_dump_lines);
                force_kill(handle);
                handle.state = ServerState::ShutDown;
                Err(BenchError::StartupTimeout {
                    timeout_secs: limits.startup_timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// Ready, process alive, and the health endpoint answers 200.
    pub fn is_alive(&mut self) -> bool {
        let health_url = self.limits.health_url.clone();
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if handle.state != ServerState::Ready {
            return false;
        }
        if let Some(reason) = handle.exited() {
            warn!(pid = handle.pid, reason = %reason, "server process is gone");
            handle.state = ServerState::Crashed;
            return false;
        }
        let Some(url) = health_url else {
            return true;
        };
        match self.client.get(&url).send() {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "health check failed");
                false
            }
            Err(err) => {
                warn!(url = %url, error = %err, "health check failed");
                false
            }
        }
    }

    /// Kill whatever is left and try exactly one launch + readiness cycle.
    pub fn recover(&mut self) -> Result<()> {
        let Some(config) = self.last_launch.clone() else {
            return Err(BenchError::MidRunCrash {
                reason: "no previous launch to recover".into(),
            }
            .into());
        };
        if let Some(handle) = self.handle.as_mut() {
            warn!(pid = handle.pid, "restarting unhealthy server");
            force_kill(handle);
            handle.state = ServerState::Crashed;
        }
        self.restarts += 1;

        let attempt = self.launch(config).and_then(|_| self.wait_ready());
        match attempt {
            Ok(()) => {
                info!(pid = ?self.pid(), restarts = self.restarts, "server recovered");
                Ok(())
            }
            Err(err) => {
                if let Some(handle) = self.handle.as_mut() {
                    force_kill(handle);
                    handle.state = ServerState::Crashed;
                }
                Err(BenchError::MidRunCrash {
                    reason: format!("{err:#}"),
                }
                .into())
            }
        }
    }

    /// Terminate gracefully, escalating to a kill after the grace period.
    /// Returns how long shutdown took, or `None` when nothing was running.
    pub fn shutdown(&mut self) -> Result<Option<Duration>> {
        let grace = self.limits.shutdown_grace;
        let Some(handle) = self.handle.as_mut() else {
            return Ok(None);
        };
        if handle.state == ServerState::ShutDown {
            return Ok(None);
        }

        let started = Instant::now();
        if handle.exited().is_none() {
            if !signal_group(handle.pid, libc::SIGTERM) {
                debug!(pid = handle.pid, "server process group already gone");
            }
            let exited = poll_until(Duration::from_millis(100), grace, || {
                Ok(match handle.child.try_wait()? {
                    Some(_) => Poll::Ready(()),
                    None => Poll::Pending,
                })
            })?;
            if exited.is_none() {
                warn!(pid = handle.pid, grace_s = grace.as_secs(), "server ignored SIGTERM; killing");
            }
        }
        // Workers forked by the launcher hold the accelerator past its exit.
        force_kill(handle);
        handle.state = ServerState::ShutDown;
        let elapsed = started.elapsed();
        info!(pid = handle.pid, shutdown_s = elapsed.as_secs_f64(), "server shut down");
        Ok(Some(elapsed))
    }

    /// Log the info endpoint body once; failures are only logged.
    fn probe_info(&self) {
        let Some(url) = &self.limits.info_url else {
            return;
        };
        match self.client.get(url).send().and_then(|resp| resp.text()) {
            Ok(body) => {
                let body: String = body.chars().take(INFO_LOG_LIMIT).collect();
                info!(url = %url, body = %body, "server info");
            }
            Err(err) => debug!(url = %url, error = %err, "server info unavailable"),
        }
    }
}

impl HealthGuard for ServerSupervisor {
    fn ensure_healthy(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        warn!(pid = ?self.pid(), "server unhealthy between points");
        self.recover()
    }

    fn is_serving(&mut self) -> bool {
        self.is_alive()
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if handle.state != ServerState::ShutDown {
                force_kill(handle);
                handle.state = ServerState::ShutDown;
            }
        }
    }
}

fn force_kill(handle: &mut ServerHandle) {
    kill_group(&mut handle.child);
}

fn dump_tail(handle: &ServerHandle, lines: usize) {
    match handle.log_text() {
        Ok(text) => {
            let tail = tail_lines(&text, lines);
            error!(pid = handle.pid, lines, "last server log lines:\n{tail}");
        }
        Err(err) => warn!(error = %err, "could not read server log"),
    }
}

fn read_since(path: &Path, offset: u64) -> Result<String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let start = (offset as usize).min(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[start..]).into_owned())
}

pub fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
