use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Top-level configuration for a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchSettings {
    #[serde(default)]
    pub environment: EnvironmentSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub sweep: SweepSettings,
    #[serde(default)]
    pub metrics: MetricLabels,
    #[serde(default)]
    pub gating: GatingSettings,
    /// Compared server configurations; one result row each.
    #[serde(default = "BenchSettings::default_variants")]
    pub variants: Vec<VariantSettings>,
    /// Optional override for where artifacts and result tables are written.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub telemetry: TraceSettings,
}

impl BenchSettings {
    fn default_variants() -> Vec<VariantSettings> {
        vec![VariantSettings::named("baseline")]
    }

    /// Load settings from disk, writing defaults if missing.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as JSON.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        let parsed: Self = if is_toml(path) {
            toml::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Reject configurations that cannot describe a sweep.
    pub fn validate(&self) -> Result<()> {
        if self.sweep.dimensions.is_empty() {
            bail!("sweep.dimensions must name at least one dimension");
        }
        for dimension in &self.sweep.dimensions {
            if dimension.name.trim().is_empty() {
                bail!("sweep dimension with empty name");
            }
            if dimension.values.is_empty() {
                bail!("sweep dimension '{}' has no values", dimension.name);
            }
        }
        if self.sweep.repetitions == 0 {
            bail!("sweep.repetitions must be at least 1");
        }
        if self.variants.is_empty() {
            bail!("at least one variant must be configured");
        }
        let mut seen = std::collections::HashSet::new();
        for variant in &self.variants {
            if !seen.insert(variant.name.as_str()) {
                bail!("duplicate variant name '{}'", variant.name);
            }
            for dependency in &variant.requires_any_of {
                if !self.variants.iter().any(|v| &v.name == dependency) {
                    bail!(
                        "variant '{}' depends on unknown variant '{dependency}'",
                        variant.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Resolve the directory that holds artifacts, tables and the journal.
    pub fn resolve_output_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.output_dir {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("dev", "fleetbench", "fleetbench")
            .context("Unable to resolve platform data directory")?;
        Ok(dirs.data_dir().join("runs"))
    }

    pub fn variant(&self, name: &str) -> Option<&VariantSettings> {
        self.variants.iter().find(|variant| variant.name == name)
    }

    /// Replace (or append) the value list of a swept dimension.
    pub fn set_dimension(&mut self, dimension: DimensionSettings) {
        match self
            .sweep
            .dimensions
            .iter_mut()
            .find(|existing| existing.name == dimension.name)
        {
            Some(existing) => {
                existing.values = dimension.values;
            }
            None => self.sweep.dimensions.push(dimension),
        }
    }
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            environment: EnvironmentSettings::default(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            sweep: SweepSettings::default(),
            metrics: MetricLabels::default(),
            gating: GatingSettings::default(),
            variants: Self::default_variants(),
            output_dir: None,
            telemetry: TraceSettings::default(),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

/// Single environment variable passed to a spawned process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Isolated runtime (container) the server and sweep execute inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    /// Run the in-environment phase inside a container. When disabled the
    /// stage runs directly on the host.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Container CLI (`docker` or `podman`).
    #[serde(default = "EnvironmentSettings::default_runtime")]
    pub runtime: String,
    #[serde(default = "EnvironmentSettings::default_image")]
    pub image: String,
    #[serde(default = "EnvironmentSettings::default_tag")]
    pub tag: String,
    #[serde(default = "EnvironmentSettings::default_name_prefix")]
    pub name_prefix: String,
    /// Host paths bind-mounted at the same location inside the environment.
    #[serde(default)]
    pub mounts: Vec<PathBuf>,
    /// Extra arguments for container creation (device access, IPC, network).
    #[serde(default = "EnvironmentSettings::default_container_args")]
    pub container_args: Vec<String>,
    /// Delays between image pull attempts, in seconds.
    #[serde(default = "EnvironmentSettings::default_pull_backoff")]
    pub pull_backoff_secs: Vec<u64>,
    /// Leave the environment running after the top-level run finishes.
    #[serde(default)]
    pub keep_environment: bool,
}

impl EnvironmentSettings {
    fn default_runtime() -> String {
        "docker".into()
    }

    fn default_image() -> String {
        "lmsysorg/sglang".into()
    }

    fn default_tag() -> String {
        "latest".into()
    }

    fn default_name_prefix() -> String {
        "fleetbench".into()
    }

    fn default_container_args() -> Vec<String> {
        vec![
            "--gpus".into(),
            "all".into(),
            "--ipc=host".into(),
            "--network=host".into(),
            "--shm-size=32g".into(),
        ]
    }

    fn default_pull_backoff() -> Vec<u64> {
        vec![30, 60, 90]
    }
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime: Self::default_runtime(),
            image: Self::default_image(),
            tag: Self::default_tag(),
            name_prefix: Self::default_name_prefix(),
            mounts: Vec::new(),
            container_args: Self::default_container_args(),
            pull_backoff_secs: Self::default_pull_backoff(),
            keep_environment: false,
        }
    }
}

/// Launch configuration and supervision limits for the inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_binary")]
    pub binary: String,
    /// Argument template; `{model}`, `{tp}`, `{mem_fraction}`, `{host}`,
    /// `{port}` are substituted at launch.
    #[serde(default = "ServerSettings::default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "ServerSettings::default_tensor_parallel")]
    pub tensor_parallel: u32,
    #[serde(default = "ServerSettings::default_mem_fraction")]
    pub mem_fraction: f64,
    /// Feature flags appended verbatim to every launch.
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default = "ServerSettings::default_host")]
    pub host: String,
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    #[serde(default = "ServerSettings::default_health_path")]
    pub health_path: String,
    /// Endpoint whose body is logged once the server is ready.
    #[serde(default = "ServerSettings::default_info_path")]
    pub info_path: Option<String>,
    #[serde(default = "ServerSettings::default_ready_marker")]
    pub ready_marker: String,
    #[serde(default = "ServerSettings::default_fatal_markers")]
    pub fatal_markers: Vec<String>,
    #[serde(default = "ServerSettings::default_fatal_tail_lines")]
    pub fatal_tail_lines: usize,
    #[serde(default = "ServerSettings::default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "ServerSettings::default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "ServerSettings::default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "ServerSettings::default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "ServerSettings::default_tail_dump_lines")]
    pub tail_dump_lines: usize,
}

impl ServerSettings {
    fn default_binary() -> String {
        "python3".into()
    }

    fn default_args() -> Vec<String> {
        [
            "-m",
            "sglang.launch_server",
            "--model-path",
            "{model}",
            "--tp",
            "{tp}",
            "--mem-fraction-static",
            "{mem_fraction}",
            "--host",
            "{host}",
            "--port",
            "{port}",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    const fn default_tensor_parallel() -> u32 {
        1
    }

    const fn default_mem_fraction() -> f64 {
        0.85
    }

    fn default_host() -> String {
        "127.0.0.1".into()
    }

    const fn default_port() -> u16 {
        30000
    }

    fn default_health_path() -> String {
        "/health".into()
    }

    fn default_info_path() -> Option<String> {
        Some("/get_server_info".into())
    }

    fn default_ready_marker() -> String {
        "The server is fired up and ready to roll!".into()
    }

    fn default_fatal_markers() -> Vec<String> {
        [
            "CUDA out of memory",
            "torch.OutOfMemoryError",
            "HIP out of memory",
            "RuntimeError: CUDA error",
            "Fatal Python error",
            "Segmentation fault",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    const fn default_fatal_tail_lines() -> usize {
        200
    }

    const fn default_startup_timeout() -> u64 {
        600
    }

    const fn default_poll_interval() -> u64 {
        2
    }

    const fn default_health_timeout() -> u64 {
        5
    }

    const fn default_shutdown_grace() -> u64 {
        10
    }

    const fn default_tail_dump_lines() -> usize {
        50
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            args: Self::default_args(),
            env: Vec::new(),
            model_path: String::new(),
            tensor_parallel: Self::default_tensor_parallel(),
            mem_fraction: Self::default_mem_fraction(),
            features: Vec::new(),
            host: Self::default_host(),
            port: Self::default_port(),
            health_path: Self::default_health_path(),
            info_path: Self::default_info_path(),
            ready_marker: Self::default_ready_marker(),
            fatal_markers: Self::default_fatal_markers(),
            fatal_tail_lines: Self::default_fatal_tail_lines(),
            startup_timeout_secs: Self::default_startup_timeout(),
            poll_interval_secs: Self::default_poll_interval(),
            health_timeout_secs: Self::default_health_timeout(),
            shutdown_grace_secs: Self::default_shutdown_grace(),
            tail_dump_lines: Self::default_tail_dump_lines(),
        }
    }
}

/// External benchmark client invoked once per configuration point and run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "ClientSettings::default_binary")]
    pub binary: String,
    /// Argument template; every dimension name plus `{run}`, `{host}`,
    /// `{port}`, `{model}` is substituted per invocation.
    #[serde(default = "ClientSettings::default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default = "ClientSettings::default_timeout")]
    pub timeout_secs: u64,
}

impl ClientSettings {
    fn default_binary() -> String {
        "python3".into()
    }

    fn default_args() -> Vec<String> {
        [
            "-m",
            "sglang.bench_serving",
            "--backend",
            "sglang",
            "--host",
            "{host}",
            "--port",
            "{port}",
            "--dataset-name",
            "random",
            "--max-concurrency",
            "{concurrency}",
            "--seed",
            "{run}",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    const fn default_timeout() -> u64 {
        1800
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            args: Self::default_args(),
            env: Vec::new(),
            timeout_secs: Self::default_timeout(),
        }
    }
}

/// Enumeration order applied to one dimension's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DimensionOrder {
    #[default]
    AsGiven,
    Ascending,
    Descending,
}

/// One swept axis of the configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSettings {
    pub name: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub order: DimensionOrder,
}

impl DimensionSettings {
    /// Parse `name=v1,v2,v3`.
    pub fn parse(spec: &str) -> Result<Self> {
        let Some((name, values)) = spec.split_once('=') else {
            bail!("dimension '{spec}' must look like name=v1,v2");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("dimension '{spec}' has an empty name");
        }
        let values: Vec<String> = values
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(String::from)
            .collect();
        if values.is_empty() {
            bail!("dimension '{name}' has no values");
        }
        Ok(Self {
            name: name.to_string(),
            values,
            order: DimensionOrder::AsGiven,
        })
    }
}

/// Shape and pacing of the sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    #[serde(default = "SweepSettings::default_dimensions")]
    pub dimensions: Vec<DimensionSettings>,
    #[serde(default = "SweepSettings::default_repetitions")]
    pub repetitions: u32,
    /// Pause between runs and points.
    #[serde(default = "SweepSettings::default_cooldown")]
    pub cooldown_secs: u64,
    /// Pause used after points at or above `heavy_threshold`.
    #[serde(default = "SweepSettings::default_heavy_cooldown")]
    pub heavy_cooldown_secs: u64,
    /// Primary-dimension value from which a point counts as heavy.
    #[serde(default = "SweepSettings::default_heavy_threshold")]
    pub heavy_threshold: Option<f64>,
    #[serde(default = "SweepSettings::default_completion_marker")]
    pub completion_marker: String,
    #[serde(default = "SweepSettings::default_oom_markers")]
    pub oom_markers: Vec<String>,
}

impl SweepSettings {
    fn default_dimensions() -> Vec<DimensionSettings> {
        vec![DimensionSettings {
            name: "concurrency".into(),
            values: ["64", "16", "4", "1"].into_iter().map(String::from).collect(),
            order: DimensionOrder::Descending,
        }]
    }

    const fn default_repetitions() -> u32 {
        3
    }

    const fn default_cooldown() -> u64 {
        10
    }

    const fn default_heavy_cooldown() -> u64 {
        30
    }

    fn default_heavy_threshold() -> Option<f64> {
        Some(64.0)
    }

    fn default_completion_marker() -> String {
        "FLEETBENCH_RUN_COMPLETE".into()
    }

    fn default_oom_markers() -> Vec<String> {
        [
            "out of memory",
            "OutOfMemoryError",
            "CUDA_ERROR_OUT_OF_MEMORY",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            dimensions: Self::default_dimensions(),
            repetitions: Self::default_repetitions(),
            cooldown_secs: Self::default_cooldown(),
            heavy_cooldown_secs: Self::default_heavy_cooldown(),
            heavy_threshold: Self::default_heavy_threshold(),
            completion_marker: Self::default_completion_marker(),
            oom_markers: Self::default_oom_markers(),
        }
    }
}

/// Labels that anchor metric extraction in benchmark client output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricLabels {
    #[serde(default = "MetricLabels::default_e2e")]
    pub e2e_latency: String,
    #[serde(default = "MetricLabels::default_ttft")]
    pub first_token_latency: String,
    #[serde(default = "MetricLabels::default_itl")]
    pub inter_token_latency: String,
    #[serde(default = "MetricLabels::default_throughput")]
    pub throughput: String,
}

impl MetricLabels {
    fn default_e2e() -> String {
        "Median E2E Latency (ms)".into()
    }

    fn default_ttft() -> String {
        "Median TTFT (ms)".into()
    }

    fn default_itl() -> String {
        "Median ITL (ms)".into()
    }

    fn default_throughput() -> String {
        "Output token throughput (tok/s)".into()
    }
}

impl Default for MetricLabels {
    fn default() -> Self {
        Self {
            e2e_latency: Self::default_e2e(),
            first_token_latency: Self::default_ttft(),
            inter_token_latency: Self::default_itl(),
            throughput: Self::default_throughput(),
        }
    }
}

/// Accuracy gate evaluation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingSettings {
    /// Label preceding the measured accuracy in the accuracy artifact.
    #[serde(default = "GatingSettings::default_accuracy_label")]
    pub accuracy_label: String,
    /// Accuracies below this value mean the server crashed rather than
    /// merely scored poorly.
    #[serde(default = "GatingSettings::default_min_valid_accuracy")]
    pub min_valid_accuracy: f64,
    /// Treat any gate-skipped stage as a run failure (exit code 1).
    #[serde(default)]
    pub require_gate: bool,
}

impl GatingSettings {
    fn default_accuracy_label() -> String {
        "Accuracy".into()
    }

    const fn default_min_valid_accuracy() -> f64 {
        0.01
    }
}

impl Default for GatingSettings {
    fn default() -> Self {
        Self {
            accuracy_label: Self::default_accuracy_label(),
            min_valid_accuracy: Self::default_min_valid_accuracy(),
            require_gate: false,
        }
    }
}

/// Accuracy check executed against a ready server before its sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracySettings {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    pub threshold: f64,
    #[serde(default = "AccuracySettings::default_timeout")]
    pub timeout_secs: u64,
}

impl AccuracySettings {
    const fn default_timeout() -> u64 {
        3600
    }
}

/// A named server configuration compared against the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSettings {
    pub name: String,
    /// Arguments appended to the server launch for this variant only.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub accuracy: Option<AccuracySettings>,
    /// Skip this variant only when every listed variant failed its
    /// accuracy gate.
    #[serde(default)]
    pub requires_any_of: Vec<String>,
}

impl VariantSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_args: Vec::new(),
            env: Vec::new(),
            accuracy: None,
            requires_any_of: Vec::new(),
        }
    }
}

/// Controls structured tracing export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

fn bool_true() -> bool {
    true
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "fleetbench", "fleetbench")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("config.json"))
}
