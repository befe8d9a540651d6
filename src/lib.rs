pub mod artifact;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod exec;
pub mod gating;
pub mod journal;
pub mod metrics;
pub mod results;
pub mod retry;
pub mod supervisor;
pub mod sweep;
pub mod telemetry;

use std::{
    env, fmt,
    fs::{self, File},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactStore, ConfigurationPoint, RunOutcome};
use crate::config::{BenchSettings, VariantSettings};
use crate::environment::{DockerCli, EnvironmentManager, canary_path, is_within};
use crate::error::BenchError;
use crate::exec::{CommandSpec, Placeholders, run_captured};
use crate::gating::{GatingPolicy, accuracy_path, server_stage, sweep_stage};
use crate::journal::{JournalPhase, RunJournal};
use crate::metrics::MetricExtractor;
use crate::results::{ResultMatrix, ResultsAggregator};
use crate::supervisor::{LaunchConfig, ServerSupervisor, SupervisorLimits};
use crate::sweep::{CommandInvoker, Pacing, PointSink, SweepExecutor, SweepPlan};

pub const RESOLVED_CONFIG: &str = "resolved-config.json";
pub const SUMMARY_FILE: &str = "summary.json";
const RUN_STAGE: &str = "run";

/// Coordinates the two phases of a benchmark run.
///
/// The host phase only gates, provisions the environment and hands over to
/// the in-environment phase through a single remote invocation. The
/// in-environment phase owns the server and the sweeps.
pub struct Driver {
    settings: BenchSettings,
    output_dir: PathBuf,
    journal: RunJournal,
}

impl Driver {
    pub fn from_settings(mut settings: BenchSettings) -> Result<Self> {
        settings.validate()?;
        let output_dir = settings.resolve_output_dir()?;
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory {}", output_dir.display())
        })?;
        let output_dir = fs::canonicalize(&output_dir).with_context(|| {
            format!("Failed to resolve output directory {}", output_dir.display())
        })?;
        settings.output_dir = Some(output_dir.clone());
        let journal = RunJournal::new(&output_dir, Uuid::new_v4());
        Ok(Self {
            settings,
            output_dir,
            journal,
        })
    }

    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    pub fn plan(&self) -> SweepPlan {
        SweepPlan::from_settings(&self.settings.sweep)
    }

    pub fn gating(&self) -> Result<GatingPolicy> {
        GatingPolicy::from_settings(&self.settings, &self.output_dir)
    }

    pub fn store(&self, variant: &str) -> Result<ArtifactStore> {
        ArtifactStore::open(
            self.output_dir.join(variant).join("artifacts"),
            &self.settings.sweep.completion_marker,
            &self.settings.sweep.oom_markers,
        )
    }

    pub fn aggregator(&self) -> Result<ResultsAggregator> {
        let extractor = MetricExtractor::new(&self.settings.metrics)?;
        let mut aggregator = ResultsAggregator::new(extractor, self.plan(), &self.output_dir);
        for variant in &self.settings.variants {
            aggregator.add_series(&variant.name, self.store(&variant.name)?);
        }
        Ok(aggregator)
    }

    pub fn rebuild_matrix(&self) -> Result<ResultMatrix> {
        self.aggregator()?.rebuild()
    }

    /// Whether the variant's accuracy check already produced a complete
    /// artifact (or it has none configured).
    fn accuracy_settled(&self, variant: &VariantSettings) -> bool {
        if variant.accuracy.is_none() {
            return true;
        }
        fs::read(accuracy_path(&self.output_dir, &variant.name))
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .contains(self.settings.sweep.completion_marker.as_str())
            })
            .unwrap_or(false)
    }

    /// Whether any variant still needs a running server.
    pub fn needs_server(&self) -> Result<bool> {
        let gating = self.gating()?;
        for variant in &self.settings.variants {
            if !gating.should_run(&server_stage(&variant.name))?.allow {
                continue;
            }
            let executor = SweepExecutor::new(self.plan(), self.store(&variant.name)?, Pacing::none());
            if executor.pending_runs()? > 0 || !self.accuracy_settled(variant) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn placeholders(&self, variant: &VariantSettings) -> Placeholders {
        let server = &self.settings.server;
        Placeholders::new()
            .with("host", &server.host)
            .with("port", server.port)
            .with("model", &server.model_path)
            .with("tp", server.tensor_parallel)
            .with("mem_fraction", server.mem_fraction)
            .with("variant", &variant.name)
            .with("output", self.output_dir.display())
    }

    /// Host phase: gate, ensure the environment, then run the stage inside
    /// it with the resolved configuration.
    pub fn run(&self, verbose: bool) -> Result<RunSummary> {
        if !self.settings.environment.enabled {
            info!("environment disabled; running stage on the host");
            return self.run_stage();
        }
        if !self.needs_server()? {
            info!("every variant is complete or gated; skipping environment setup");
            return self.run_stage();
        }

        let resolved = self.output_dir.join(RESOLVED_CONFIG);
        self.settings.save(&resolved)?;

        let canary = canary_path()?;
        let mut mounts = self.settings.environment.mounts.clone();
        mounts.push(self.output_dir.clone());
        let model = PathBuf::from(&self.settings.server.model_path);
        if model.is_absolute() && model.exists() && !is_within(&model, &mounts) {
            mounts.push(model);
        }

        let runtime = DockerCli::locate(&self.settings.environment.runtime)?;
        let manager = EnvironmentManager::new(runtime, &self.settings.environment, canary.clone());
        let mut environment = manager.ensure(
            &self.settings.environment.image,
            &self.settings.environment.tag,
            &mounts,
        )?;
        self.journal.record(
            RUN_STAGE,
            JournalPhase::StageStarted,
            Some(format!("environment {}", environment.name)),
        )?;

        let mut args = vec![
            "stage".to_string(),
            "--config".to_string(),
            resolved.display().to_string(),
        ];
        if verbose {
            args.push("--verbose".into());
        }
        let forwarded: Vec<(String, String)> = env::var("RUST_LOG")
            .ok()
            .map(|value| ("RUST_LOG".to_string(), value))
            .into_iter()
            .collect();
        let stage = CommandSpec::new(canary, args, Vec::new()).with_env(forwarded);
        let outcome = manager.exec(&environment, &stage);

        if self.settings.environment.keep_environment {
            info!(environment = %environment.name, "keeping environment");
        } else if let Err(err) = manager.teardown(&mut environment) {
            warn!(environment = %environment.name, error = %err, "environment teardown failed");
        }

        match outcome? {
            Some(0) => RunSummary::load(&self.output_dir.join(SUMMARY_FILE)),
            code => bail!(
                "in-environment stage exited with {}",
                code.map(|code| code.to_string())
                    .unwrap_or_else(|| "a signal".into())
            ),
        }
    }

    /// In-environment phase: every variant's server, accuracy check and
    /// sweep, one variant at a time.
    pub fn run_stage(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let started_at = Utc::now();
        self.journal
            .record(RUN_STAGE, JournalPhase::StageStarted, None)?;

        let gating = self.gating()?;
        let aggregator = self.aggregator()?;
        let mut supervisor =
            ServerSupervisor::new(SupervisorLimits::from_settings(&self.settings.server))?;
        let mut stages = Vec::new();

        for variant in &self.settings.variants {
            let span = info_span!("driver.stage", variant = %variant.name);
            let _guard = span.enter();
            let result = self.run_variant(variant, &gating, &aggregator, &mut supervisor);
            if let Err(err) = supervisor.shutdown() {
                warn!(error = %err, "server shutdown failed");
            }
            match result {
                Ok(report) => stages.push(report),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "fatal error; aborting run");
                    self.journal.record(
                        &server_stage(&variant.name),
                        JournalPhase::StageAborted,
                        Some(format!("{err:#}")),
                    )?;
                    aggregator.refresh()?;
                    return Err(err.context(format!("variant {}", variant.name)));
                }
            }
        }

        aggregator.refresh()?;
        let summary = RunSummary {
            run_id: self.journal.run_id(),
            started_at,
            duration_secs: started.elapsed().as_secs_f64(),
            output_dir: self.output_dir.clone(),
            results_tsv: aggregator.tsv_path(),
            results_json: aggregator.json_path(),
            journal: self.journal.log_path().clone(),
            trace_file: telemetry::current_trace_file().cloned(),
            stages,
        };
        summary.save(&self.output_dir.join(SUMMARY_FILE))?;
        self.journal.record(
            RUN_STAGE,
            JournalPhase::StageFinished,
            Some(format!("{:.1}s", summary.duration_secs)),
        )?;
        Ok(summary)
    }

    fn run_variant(
        &self,
        variant: &VariantSettings,
        gating: &GatingPolicy,
        aggregator: &ResultsAggregator,
        supervisor: &mut ServerSupervisor,
    ) -> Result<StageReport> {
        let server = server_stage(&variant.name);
        let sweep = sweep_stage(&variant.name);

        let decision = gating.should_run(&server)?;
        if !decision.allow {
            return self.skip(variant, &server, decision.reason);
        }

        let store = self.store(&variant.name)?;
        let executor = SweepExecutor::new(
            self.plan(),
            store.clone(),
            Pacing::from_settings(&self.settings.sweep),
        );

        let pending = executor.pending_runs()?;
        if pending == 0 && self.accuracy_settled(variant) {
            let decision = gating.should_run(&sweep)?;
            if !decision.allow {
                return self.skip(variant, &sweep, decision.reason);
            }
            info!("all runs already complete; rebuilding results without a server");
            aggregator.refresh()?;
            self.journal
                .record(&sweep, JournalPhase::StageFinished, Some("resumed".into()))?;
            return Ok(StageReport::new(&variant.name, StageStatus::Resumed));
        }

        self.journal
            .record(&server, JournalPhase::StageStarted, None)?;
        let placeholders = self.placeholders(variant);
        let log_path = self
            .output_dir
            .join(&variant.name)
            .join(format!("server_{}.log", Utc::now().format("%Y%m%dT%H%M%SZ")));
        supervisor.launch(LaunchConfig::for_variant(
            &self.settings.server,
            variant,
            log_path,
            &placeholders,
        ))?;
        if let Err(err) = supervisor.wait_ready() {
            self.journal.record(
                &server,
                JournalPhase::ServerCrashed,
                Some(format!("{err:#}")),
            )?;
            return Err(err);
        }
        self.journal
            .record(&server, JournalPhase::ServerReady, supervisor.pid().map(|pid| pid.to_string()))?;

        self.run_accuracy(variant, &store, &placeholders)?;

        let decision = gating.should_run(&sweep)?;
        if !decision.allow {
            return self.skip(variant, &sweep, decision.reason);
        }

        self.journal
            .record(&sweep, JournalPhase::StageStarted, Some(format!("{pending} runs pending")))?;
        let restarts_before = supervisor.restarts();
        let mut invoker = CommandInvoker::new(&self.settings.client, placeholders);
        let mut sink = StageSink {
            aggregator,
            journal: &self.journal,
            stage: sweep.clone(),
        };
        let outcome = executor.run(&mut invoker, supervisor, &mut sink);
        for _ in restarts_before..supervisor.restarts() {
            self.journal
                .record(&server, JournalPhase::ServerRestarted, None)?;
        }

        match outcome {
            Ok(report) => {
                self.journal.record(
                    &sweep,
                    JournalPhase::StageFinished,
                    Some(format!(
                        "executed={} reused={} failed={}",
                        report.executed,
                        report.skipped,
                        report.failed.len()
                    )),
                )?;
                Ok(StageReport {
                    executed: report.executed,
                    reused: report.skipped,
                    failed: report.failed.len(),
                    ..StageReport::new(&variant.name, StageStatus::Completed)
                })
            }
            Err(err) => match BenchError::find(&err) {
                Some(fault) if !fault.is_fatal() => {
                    let reason = format!("{err:#}");
                    warn!(reason = %reason, "sweep aborted; completed points are kept");
                    self.journal.record(
                        &sweep,
                        JournalPhase::StageAborted,
                        Some(reason.clone()),
                    )?;
                    aggregator.refresh()?;
                    Ok(StageReport {
                        reason: Some(reason),
                        ..StageReport::new(&variant.name, StageStatus::Aborted)
                    })
                }
                _ => Err(err),
            },
        }
    }

    fn skip(&self, variant: &VariantSettings, stage: &str, reason: String) -> Result<StageReport> {
        warn!(stage, reason = %reason, "stage skipped by gate");
        self.journal
            .record(stage, JournalPhase::StageSkipped, Some(reason.clone()))?;
        Ok(StageReport {
            reason: Some(reason),
            ..StageReport::new(&variant.name, StageStatus::Skipped)
        })
    }

    /// Run the variant's accuracy check against the ready server unless a
    /// complete accuracy artifact already exists.
    fn run_accuracy(
        &self,
        variant: &VariantSettings,
        store: &ArtifactStore,
        placeholders: &Placeholders,
    ) -> Result<()> {
        let Some(accuracy) = &variant.accuracy else {
            return Ok(());
        };
        let stage = format!("{}/accuracy", variant.name);
        if self.accuracy_settled(variant) {
            info!("accuracy already evaluated");
            return Ok(());
        }

        let path = accuracy_path(&self.output_dir, &variant.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create accuracy log {}", path.display()))?;
        let spec = CommandSpec::from_template(
            &accuracy.binary,
            &accuracy.args,
            &accuracy.env,
            placeholders,
        );
        info!(command = %spec.describe(), "running accuracy check");
        self.journal
            .record(&stage, JournalPhase::StageStarted, None)?;

        let outcome = run_captured(&spec, &file, Duration::from_secs(accuracy.timeout_secs))?;
        drop(file);
        let run_outcome = if outcome.timed_out {
            RunOutcome::Timeout
        } else if outcome.success {
            RunOutcome::Ok
        } else {
            RunOutcome::Failed
        };
        store.finish(&path, run_outcome, outcome.exit_code, outcome.elapsed)?;
        self.journal.record(
            &stage,
            JournalPhase::StageFinished,
            Some(format!("{run_outcome:?}").to_lowercase()),
        )?;
        Ok(())
    }
}

/// Rebuilds and persists the matrix after every point and journals it.
struct StageSink<'a> {
    aggregator: &'a ResultsAggregator,
    journal: &'a RunJournal,
    stage: String,
}

impl PointSink for StageSink<'_> {
    fn point_finished(&mut self, point: &ConfigurationPoint) -> Result<()> {
        self.aggregator.refresh()?;
        self.journal
            .record(&self.stage, JournalPhase::PointCompleted, Some(point.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Every run was already complete; the server was not launched.
    Resumed,
    Skipped,
    Aborted,
}

/// What happened to one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub variant: String,
    pub status: StageStatus,
    pub reason: Option<String>,
    pub executed: usize,
    pub reused: usize,
    pub failed: usize,
}

impl StageReport {
    fn new(variant: &str, status: StageStatus) -> Self {
        Self {
            variant: variant.to_string(),
            status,
            reason: None,
            executed: 0,
            reused: 0,
            failed: 0,
        }
    }
}

/// Final summary: duration, output locations and per-variant outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub output_dir: PathBuf,
    pub results_tsv: PathBuf,
    pub results_json: PathBuf,
    pub journal: PathBuf,
    pub trace_file: Option<PathBuf>,
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    pub fn skipped(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|stage| stage.status == StageStatus::Skipped)
    }

    pub fn aborted(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|stage| stage.status == StageStatus::Aborted)
    }

    /// `require_gate` turns any gate skip into a failed run.
    pub fn gate_failed(&self, require_gate: bool) -> bool {
        require_gate && self.skipped().next().is_some()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        fs::write(path, json)
            .with_context(|| format!("Failed to write run summary {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read run summary {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Malformed run summary {}", path.display()))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} finished in {:.1}s", self.run_id, self.duration_secs)?;
        writeln!(f, "  results: {}", self.results_tsv.display())?;
        writeln!(f, "  results (json): {}", self.results_json.display())?;
        writeln!(f, "  journal: {}", self.journal.display())?;
        if let Some(trace) = &self.trace_file {
            writeln!(f, "  trace: {}", trace.display())?;
        }
        for stage in &self.stages {
            let status = match stage.status {
                StageStatus::Completed => "completed",
                StageStatus::Resumed => "resumed",
                StageStatus::Skipped => "skipped",
                StageStatus::Aborted => "aborted",
            };
            write!(
                f,
                "  {}: {status} (executed {}, reused {}, failed {})",
                stage.variant, stage.executed, stage.reused, stage.failed
            )?;
            if let Some(reason) = &stage.reason {
                write!(f, ": {reason}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
