//! Idempotent sweep execution over a Cartesian configuration space.

use std::{
    cmp::Ordering,
    fs::File,
    io::Write,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, info, info_span, warn};

use crate::artifact::{ArtifactStore, ConfigurationPoint, RunArtifact, RunOutcome};
use crate::config::{ClientSettings, DimensionOrder, DimensionSettings, EnvVar, SweepSettings};
use crate::error::BenchError;
use crate::exec::{CommandSpec, Placeholders, ProcessOutcome, run_captured};

/// Deterministic enumeration of configuration points.
///
/// The first dimension is the outermost loop; each dimension's values are
/// ordered according to its [`DimensionOrder`].
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    dimensions: Vec<DimensionSettings>,
    repetitions: u32,
}

impl SweepPlan {
    pub fn new(dimensions: Vec<DimensionSettings>, repetitions: u32) -> Self {
        Self {
            dimensions,
            repetitions,
        }
    }

    pub fn from_settings(settings: &SweepSettings) -> Self {
        Self::new(settings.dimensions.clone(), settings.repetitions)
    }

    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    pub fn dimension_names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|dimension| dimension.name.clone())
            .collect()
    }

    pub fn points(&self) -> Vec<ConfigurationPoint> {
        let mut combos: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for dimension in &self.dimensions {
            let values = ordered_values(dimension);
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for prefix in &combos {
                for value in &values {
                    let mut combo = prefix.clone();
                    combo.push((dimension.name.clone(), value.clone()));
                    next.push(combo);
                }
            }
            combos = next;
        }
        if self.dimensions.is_empty() {
            return Vec::new();
        }
        combos.into_iter().map(ConfigurationPoint::new).collect()
    }

    /// Points × repetitions, known before anything runs.
    pub fn total_runs(&self) -> usize {
        self.points().len() * self.repetitions as usize
    }
}

fn ordered_values(dimension: &DimensionSettings) -> Vec<String> {
    let mut values = dimension.values.clone();
    match dimension.order {
        DimensionOrder::AsGiven => {}
        DimensionOrder::Ascending => values.sort_by(|a, b| compare_values(a, b)),
        DimensionOrder::Descending => values.sort_by(|a, b| compare_values(b, a)),
    }
    values
}

/// Numeric where both sides parse, lexical otherwise; numbers sort first.
fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.total_cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Runs the external benchmark client for one (point, repetition) pair,
/// writing its combined output into `sink`.
pub trait BenchmarkInvoker {
    fn invoke(
        &mut self,
        point: &ConfigurationPoint,
        repetition: u32,
        sink: &File,
    ) -> Result<ProcessOutcome>;
}

/// Health contract consulted between points and after failed runs.
pub trait HealthGuard {
    /// Leave a usable server behind or fail; an error aborts the sweep.
    fn ensure_healthy(&mut self) -> Result<()>;

    /// Liveness only, no recovery.
    fn is_serving(&mut self) -> bool;
}

/// Notified after every point so results can be rebuilt and persisted.
pub trait PointSink {
    fn point_finished(&mut self, point: &ConfigurationPoint) -> Result<()>;
}

/// Invokes the configured client binary with point-derived placeholders.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    binary: String,
    args: Vec<String>,
    env: Vec<EnvVar>,
    placeholders: Placeholders,
    timeout: Duration,
}

impl CommandInvoker {
    pub fn new(client: &ClientSettings, placeholders: Placeholders) -> Self {
        Self {
            binary: client.binary.clone(),
            args: client.args.clone(),
            env: client.env.clone(),
            placeholders,
            timeout: Duration::from_secs(client.timeout_secs),
        }
    }

    pub fn command_for(&self, point: &ConfigurationPoint, repetition: u32) -> CommandSpec {
        let mut placeholders = self.placeholders.clone();
        for (name, value) in point.values() {
            placeholders.insert(name.clone(), value);
        }
        placeholders.insert("run", repetition);
        CommandSpec::from_template(&self.binary, &self.args, &self.env, &placeholders)
    }
}

impl BenchmarkInvoker for CommandInvoker {
    fn invoke(
        &mut self,
        point: &ConfigurationPoint,
        repetition: u32,
        sink: &File,
    ) -> Result<ProcessOutcome> {
        let spec = self.command_for(point, repetition);
        let mut header = sink;
        writeln!(header, "# command: {}", spec.describe())?;
        run_captured(&spec, sink, self.timeout)
    }
}

/// Cooldowns inserted between runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    pub cooldown: Duration,
    pub heavy_cooldown: Duration,
    pub heavy_threshold: Option<f64>,
}

impl Pacing {
    pub fn from_settings(settings: &SweepSettings) -> Self {
        Self {
            cooldown: Duration::from_secs(settings.cooldown_secs),
            heavy_cooldown: Duration::from_secs(settings.heavy_cooldown_secs),
            heavy_threshold: settings.heavy_threshold,
        }
    }

    pub fn none() -> Self {
        Self {
            cooldown: Duration::ZERO,
            heavy_cooldown: Duration::ZERO,
            heavy_threshold: None,
        }
    }

    pub fn cooldown_after(&self, point: &ConfigurationPoint) -> Duration {
        let heavy = match (self.heavy_threshold, point.primary_numeric()) {
            (Some(threshold), Some(value)) => value >= threshold,
            _ => false,
        };
        if heavy {
            self.heavy_cooldown
        } else {
            self.cooldown
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
    /// `(point key, repetition)` pairs recorded as failed in this pass.
    pub failed: Vec<(String, u32)>,
    pub artifacts: Vec<RunArtifact>,
    pub elapsed: Duration,
}

impl SweepReport {
    pub fn completed(&self) -> usize {
        self.executed + self.skipped
    }
}

pub struct SweepExecutor {
    plan: SweepPlan,
    store: ArtifactStore,
    pacing: Pacing,
}

impl SweepExecutor {
    pub fn new(plan: SweepPlan, store: ArtifactStore, pacing: Pacing) -> Self {
        Self {
            plan,
            store,
            pacing,
        }
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Runs without a complete artifact yet.
    pub fn pending_runs(&self) -> Result<usize> {
        let mut pending = 0;
        for point in self.plan.points() {
            for repetition in 1..=self.plan.repetitions() {
                if self.store.latest_complete(&point, repetition)?.is_none() {
                    pending += 1;
                }
            }
        }
        Ok(pending)
    }

    /// Execute every pending run in plan order.
    ///
    /// Complete artifacts are never re-executed. A failing invocation is
    /// recorded and the sweep moves on, unless the server went down with it:
    /// that run stays incomplete and is retried once after recovery. Only a
    /// failed health guard stops the sweep, after the sink has seen every
    /// finished point.
    pub fn run(
        &self,
        invoker: &mut dyn BenchmarkInvoker,
        health: &mut dyn HealthGuard,
        sink: &mut dyn PointSink,
    ) -> Result<SweepReport> {
        let started = Instant::now();
        let points = self.plan.points();
        let repetitions = self.plan.repetitions();
        let mut report = SweepReport {
            total: points.len() * repetitions as usize,
            ..SweepReport::default()
        };
        let mut last_executed: Option<ConfigurationPoint> = None;

        for point in &points {
            let span = info_span!("sweep.point", point = %point);
            let _guard = span.enter();

            let mut checked = false;
            for repetition in 1..=repetitions {
                if let Some(artifact) = self.store.latest_complete(point, repetition)? {
                    report.skipped += 1;
                    debug!(repetition, path = %artifact.path.display(), "run already complete; skipping");
                    report.artifacts.push(artifact);
                    progress(&report);
                    continue;
                }

                if !checked {
                    if last_executed.is_some() {
                        health
                            .ensure_healthy()
                            .with_context(|| format!("health check before point {point}"))?;
                    }
                    checked = true;
                }
                if let Some(previous) = &last_executed {
                    pause(self.pacing.cooldown_after(previous));
                }

                let artifact = match self.execute(invoker, health, point, repetition, &mut report)? {
                    Some(artifact) => artifact,
                    None => {
                        health
                            .ensure_healthy()
                            .with_context(|| format!("server lost during point {point}"))?;
                        self.execute(invoker, health, point, repetition, &mut report)?
                            .ok_or_else(|| BenchError::MidRunCrash {
                                reason: format!("server lost again during point {point} after a restart"),
                            })?
                    }
                };
                last_executed = Some(point.clone());
                report.executed += 1;
                report.artifacts.push(artifact);
                progress(&report);
            }

            sink.point_finished(point)
                .with_context(|| format!("failed to persist results after point {point}"))?;
        }

        report.elapsed = started.elapsed();
        info!(
            executed = report.executed,
            skipped = report.skipped,
            failed = report.failed.len(),
            elapsed_s = report.elapsed.as_secs(),
            "sweep finished"
        );
        Ok(report)
    }

    /// `None` when the run failed because the server is gone. Its artifact
    /// keeps no trailer, so a resumed sweep runs it again.
    fn execute(
        &self,
        invoker: &mut dyn BenchmarkInvoker,
        health: &mut dyn HealthGuard,
        point: &ConfigurationPoint,
        repetition: u32,
        report: &mut SweepReport,
    ) -> Result<Option<RunArtifact>> {
        let (path, file) = self.store.begin(point, repetition)?;
        let started = Instant::now();
        {
            let mut header = &file;
            writeln!(header, "# point: {point} run: {repetition}")?;
        }

        let (outcome, exit_code) = match invoker.invoke(point, repetition, &file) {
            Ok(result) => {
                let text = self.store.read_text(&path)?;
                let outcome = if result.timed_out {
                    RunOutcome::Timeout
                } else if !result.success || self.store.contains_oom(&text) {
                    RunOutcome::Failed
                } else {
                    RunOutcome::Ok
                };
                (outcome, result.exit_code)
            }
            Err(err) => {
                let mut writer = &file;
                writeln!(writer, "benchmark invocation failed: {err:#}")?;
                (RunOutcome::Failed, None)
            }
        };
        drop(file);

        if outcome != RunOutcome::Ok && !health.is_serving() {
            warn!(
                repetition,
                ?outcome,
                path = %path.display(),
                "server went down during the run; leaving it incomplete"
            );
            return Ok(None);
        }

        self.store
            .finish(&path, outcome, exit_code, started.elapsed())?;
        if outcome != RunOutcome::Ok {
            warn!(
                repetition,
                ?outcome,
                exit_code = ?exit_code,
                path = %path.display(),
                "benchmark run failed; recording NA"
            );
            report.failed.push((point.key().to_string(), repetition));
        }

        self.store
            .latest_complete(point, repetition)?
            .with_context(|| format!("artifact {} lost its completion marker", path.display()))
            .map(Some)
    }
}

fn progress(report: &SweepReport) {
    info!(
        completed = report.completed(),
        total = report.total,
        "progress {}/{}",
        report.completed(),
        report.total
    );
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        debug!(cooldown_s = duration.as_secs_f64(), "cooling down");
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricLabels;
    use crate::error::BenchError;
    use crate::metrics::{MetricExtractor, MetricKind};
    use crate::results::ResultsAggregator;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::tempdir;

    const MARKER: &str = "FLEETBENCH_RUN_COMPLETE";

    fn concurrency(values: &[&str], order: DimensionOrder) -> DimensionSettings {
        DimensionSettings {
            name: "concurrency".into(),
            values: values.iter().map(|v| v.to_string()).collect(),
            order,
        }
    }

    /// Scripted client: output per `(concurrency, run)` or a default report.
    #[derive(Default)]
    struct ScriptedInvoker {
        calls: Vec<(String, u32)>,
        scripted: HashMap<(String, u32), (String, i32)>,
    }

    impl ScriptedInvoker {
        fn script(&mut self, value: &str, run: u32, output: &str, exit: i32) {
            self.scripted
                .insert((value.to_string(), run), (output.to_string(), exit));
        }
    }

    impl BenchmarkInvoker for ScriptedInvoker {
        fn invoke(
            &mut self,
            point: &ConfigurationPoint,
            repetition: u32,
            sink: &File,
        ) -> Result<ProcessOutcome> {
            let value = point.value("concurrency").unwrap_or("?").to_string();
            self.calls.push((value.clone(), repetition));
            let (output, exit) = self
                .scripted
                .remove(&(value.clone(), repetition))
                .unwrap_or_else(|| {
                    let latency = 100.0 + value.parse::<f64>().unwrap_or(0.0);
                    (
                        format!(
                            "Median E2E Latency (ms): {latency}\nOutput token throughput (tok/s): 10\n"
                        ),
                        0,
                    )
                });
            let mut writer = sink;
            write!(writer, "{output}")?;
            Ok(ProcessOutcome {
                exit_code: Some(exit),
                success: exit == 0,
                timed_out: false,
                elapsed: Duration::from_millis(1),
            })
        }
    }

    struct Healthy;

    impl HealthGuard for Healthy {
        fn ensure_healthy(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_serving(&mut self) -> bool {
            true
        }
    }

    /// Fails (unrecoverably) on the given check number, 1-based.
    struct CrashOnCheck {
        checks: usize,
        crash_at: usize,
    }

    impl HealthGuard for CrashOnCheck {
        fn ensure_healthy(&mut self) -> Result<()> {
            self.checks += 1;
            if self.checks >= self.crash_at {
                return Err(BenchError::MidRunCrash {
                    reason: "server process exited".into(),
                }
                .into());
            }
            Ok(())
        }

        fn is_serving(&mut self) -> bool {
            true
        }
    }

    /// Up until a failed run asks; the server is gone from then on.
    #[derive(Default)]
    struct DiesMidRun {
        lost: bool,
    }

    impl HealthGuard for DiesMidRun {
        fn ensure_healthy(&mut self) -> Result<()> {
            if self.lost {
                return Err(BenchError::MidRunCrash {
                    reason: "server process exited".into(),
                }
                .into());
            }
            Ok(())
        }

        fn is_serving(&mut self) -> bool {
            self.lost = true;
            false
        }
    }

    /// Reports the server down after every failed run and restarts it.
    #[derive(Default)]
    struct Restarts {
        restarts: usize,
        liveness_checks: usize,
        lost: bool,
    }

    impl HealthGuard for Restarts {
        fn ensure_healthy(&mut self) -> Result<()> {
            if self.lost {
                self.lost = false;
                self.restarts += 1;
            }
            Ok(())
        }

        fn is_serving(&mut self) -> bool {
            self.liveness_checks += 1;
            self.lost = true;
            false
        }
    }

    fn setup(dir: &Path, plan: &SweepPlan) -> (SweepExecutor, ResultsAggregator) {
        let store = ArtifactStore::open(
            dir.join("baseline/artifacts"),
            MARKER,
            &["out of memory".to_string()],
        )
        .expect("store");
        let extractor = MetricExtractor::new(&MetricLabels::default()).expect("extractor");
        let mut aggregator = ResultsAggregator::new(extractor, plan.clone(), dir);
        aggregator.add_series("baseline", store.clone());
        (
            SweepExecutor::new(plan.clone(), store, Pacing::none()),
            aggregator,
        )
    }

    #[test]
    fn plan_orders_points_deterministically() {
        let plan = SweepPlan::new(
            vec![concurrency(&["4", "16", "1"], DimensionOrder::Descending)],
            2,
        );
        let labels: Vec<String> = plan.points().iter().map(|p| p.label()).collect();
        assert_eq!(labels, vec!["16", "4", "1"]);
        assert_eq!(plan.total_runs(), 6);

        let plan = SweepPlan::new(
            vec![
                DimensionSettings {
                    name: "tp".into(),
                    values: vec!["8".into(), "2".into()],
                    order: DimensionOrder::Ascending,
                },
                DimensionSettings {
                    name: "input_len".into(),
                    values: vec!["1024".into(), "128".into()],
                    order: DimensionOrder::AsGiven,
                },
            ],
            1,
        );
        let keys: Vec<String> = plan.points().iter().map(|p| p.key().to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "tp2_input-len1024",
                "tp2_input-len128",
                "tp8_input-len1024",
                "tp8_input-len128"
            ]
        );
    }

    #[test]
    fn non_numeric_values_sort_lexically() {
        let plan = SweepPlan::new(
            vec![DimensionSettings {
                name: "dataset".into(),
                values: vec!["sharegpt".into(), "random".into()],
                order: DimensionOrder::Ascending,
            }],
            1,
        );
        let labels: Vec<String> = plan.points().iter().map(|p| p.label()).collect();
        assert_eq!(labels, vec!["random", "sharegpt"]);
    }

    #[test]
    fn resume_skips_completed_runs() {
        let dir = tempdir().expect("tempdir");
        let plan = SweepPlan::new(
            vec![concurrency(&["1", "4", "16"], DimensionOrder::Descending)],
            2,
        );
        let (executor, mut aggregator) = setup(dir.path(), &plan);

        let mut first = ScriptedInvoker::default();
        let report = executor
            .run(&mut first, &mut Healthy, &mut aggregator)
            .expect("first pass");
        assert_eq!(first.calls.len(), 6);
        assert_eq!(report.executed, 6);
        assert_eq!(executor.pending_runs().expect("pending"), 0);
        let before = aggregator.rebuild().expect("matrix");

        let mut second = ScriptedInvoker::default();
        let report = executor
            .run(&mut second, &mut Healthy, &mut aggregator)
            .expect("second pass");
        assert!(second.calls.is_empty());
        assert_eq!(report.skipped, 6);
        assert_eq!(report.completed(), report.total);
        assert_eq!(aggregator.rebuild().expect("matrix"), before);
    }

    #[test]
    fn crash_preserves_completed_points_and_resumes_the_rest() {
        let dir = tempdir().expect("tempdir");
        let plan = SweepPlan::new(
            vec![concurrency(
                &["1", "2", "3", "4", "5"],
                DimensionOrder::Ascending,
            )],
            1,
        );
        let (executor, mut aggregator) = setup(dir.path(), &plan);

        // Checks run before points 2..=5; the third check guards point 4.
        let mut invoker = ScriptedInvoker::default();
        let mut guard = CrashOnCheck {
            checks: 0,
            crash_at: 3,
        };
        let err = executor
            .run(&mut invoker, &mut guard, &mut aggregator)
            .expect_err("sweep aborted");
        assert!(matches!(
            BenchError::find(&err),
            Some(BenchError::MidRunCrash { .. })
        ));
        assert_eq!(invoker.calls.len(), 3);

        let persisted: crate::results::ResultMatrix = serde_json::from_str(
            &std::fs::read_to_string(aggregator.json_path()).expect("results.json"),
        )
        .expect("parse");
        assert_eq!(persisted.columns, vec!["1", "2", "3"]);

        let mut resumed = ScriptedInvoker::default();
        executor
            .run(&mut resumed, &mut Healthy, &mut aggregator)
            .expect("resume");
        assert_eq!(
            resumed.calls,
            vec![("4".to_string(), 1), ("5".to_string(), 1)]
        );
    }

    #[test]
    fn run_lost_with_the_server_stays_pending() {
        let dir = tempdir().expect("tempdir");
        let plan = SweepPlan::new(
            vec![concurrency(
                &["1", "2", "3", "4", "5"],
                DimensionOrder::Ascending,
            )],
            1,
        );
        let (executor, mut aggregator) = setup(dir.path(), &plan);

        let mut invoker = ScriptedInvoker::default();
        invoker.script("4", 1, "Connection refused (os error 111)\n", 1);
        let mut guard = DiesMidRun::default();
        let err = executor
            .run(&mut invoker, &mut guard, &mut aggregator)
            .expect_err("sweep aborted");
        assert!(matches!(
            BenchError::find(&err),
            Some(BenchError::MidRunCrash { .. })
        ));
        assert_eq!(invoker.calls.len(), 4);
        assert_eq!(executor.pending_runs().expect("pending"), 2);

        let persisted: crate::results::ResultMatrix = serde_json::from_str(
            &std::fs::read_to_string(aggregator.json_path()).expect("results.json"),
        )
        .expect("parse");
        assert_eq!(persisted.columns, vec!["1", "2", "3"]);

        let mut resumed = ScriptedInvoker::default();
        let report = executor
            .run(&mut resumed, &mut Healthy, &mut aggregator)
            .expect("resume");
        assert_eq!(
            resumed.calls,
            vec![("4".to_string(), 1), ("5".to_string(), 1)]
        );
        assert!(report.failed.is_empty());
        assert_eq!(
            aggregator.rebuild().expect("matrix").columns,
            vec!["1", "2", "3", "4", "5"]
        );
    }

    #[test]
    fn recovered_server_reruns_the_lost_repetition() {
        let dir = tempdir().expect("tempdir");
        let plan = SweepPlan::new(vec![concurrency(&["1", "2"], DimensionOrder::Ascending)], 1);
        let (executor, mut aggregator) = setup(dir.path(), &plan);

        let mut invoker = ScriptedInvoker::default();
        invoker.script("2", 1, "Connection reset by peer\n", 1);
        let mut guard = Restarts::default();
        let report = executor
            .run(&mut invoker, &mut guard, &mut aggregator)
            .expect("sweep");

        assert_eq!(
            invoker.calls,
            vec![
                ("1".to_string(), 1),
                ("2".to_string(), 1),
                ("2".to_string(), 1)
            ]
        );
        assert_eq!(guard.liveness_checks, 1);
        assert_eq!(guard.restarts, 1);
        assert_eq!(report.executed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(executor.pending_runs().expect("pending"), 0);
    }

    #[test]
    fn oom_run_is_recorded_and_excluded_from_best_of() {
        let dir = tempdir().expect("tempdir");
        let plan = SweepPlan::new(
            vec![concurrency(&["1", "4", "16"], DimensionOrder::Descending)],
            2,
        );
        let (executor, mut aggregator) = setup(dir.path(), &plan);

        let mut invoker = ScriptedInvoker::default();
        invoker.script(
            "16",
            1,
            "Median E2E Latency (ms): 10\nOutput token throughput (tok/s): 999\nCUDA out of memory\n",
            0,
        );
        invoker.script(
            "16",
            2,
            "Median E2E Latency (ms): 300\nOutput token throughput (tok/s): 50\n",
            0,
        );
        invoker.script("4", 2, "Traceback: connection refused\n", 1);

        let report = executor
            .run(&mut invoker, &mut Healthy, &mut aggregator)
            .expect("sweep");
        assert_eq!(report.executed, 6);
        assert_eq!(
            report.failed,
            vec![
                ("concurrency16".to_string(), 1),
                ("concurrency4".to_string(), 2)
            ]
        );

        let matrix = aggregator.rebuild().expect("matrix");
        assert_eq!(matrix.columns, vec!["16", "4", "1"]);
        assert_eq!(
            matrix.value(MetricKind::E2eLatencyMs, "baseline", "16"),
            Some(300.0)
        );
        assert_eq!(
            matrix.value(MetricKind::Throughput, "baseline", "16"),
            Some(50.0)
        );
        assert_eq!(
            matrix.value(MetricKind::E2eLatencyMs, "baseline", "4"),
            Some(104.0)
        );

        // Failed runs are complete: a resume does not retry them.
        let mut resumed = ScriptedInvoker::default();
        executor
            .run(&mut resumed, &mut Healthy, &mut aggregator)
            .expect("resume");
        assert!(resumed.calls.is_empty());
    }

    #[test]
    fn invoker_errors_become_failed_artifacts() {
        struct Broken;
        impl BenchmarkInvoker for Broken {
            fn invoke(
                &mut self,
                _point: &ConfigurationPoint,
                _repetition: u32,
                _sink: &File,
            ) -> Result<ProcessOutcome> {
                anyhow::bail!("client binary not found")
            }
        }

        let dir = tempdir().expect("tempdir");
        let plan = SweepPlan::new(vec![concurrency(&["1"], DimensionOrder::AsGiven)], 1);
        let (executor, mut aggregator) = setup(dir.path(), &plan);
        let report = executor
            .run(&mut Broken, &mut Healthy, &mut aggregator)
            .expect("sweep continues");
        assert_eq!(report.failed.len(), 1);
        assert!(!report.artifacts[0].succeeded());
        assert!(report.artifacts[0].output.contains("client binary not found"));
        let matrix = aggregator.rebuild().expect("matrix");
        let sample = matrix.sample("baseline", "1").expect("NA cell kept");
        assert!(sample.is_na());
    }

    #[test]
    fn heavy_points_use_longer_cooldown() {
        let pacing = Pacing {
            cooldown: Duration::from_secs(10),
            heavy_cooldown: Duration::from_secs(30),
            heavy_threshold: Some(64.0),
        };
        let heavy = ConfigurationPoint::new(vec![("concurrency".into(), "128".into())]);
        let light = ConfigurationPoint::new(vec![("concurrency".into(), "16".into())]);
        assert_eq!(pacing.cooldown_after(&heavy), Duration::from_secs(30));
        assert_eq!(pacing.cooldown_after(&light), Duration::from_secs(10));
    }

    #[test]
    fn command_invoker_substitutes_point_values() {
        let client = ClientSettings {
            binary: "bench".into(),
            args: vec![
                "--max-concurrency".into(),
                "{concurrency}".into(),
                "--seed".into(),
                "{run}".into(),
                "--port".into(),
                "{port}".into(),
            ],
            env: Vec::new(),
            timeout_secs: 5,
        };
        let invoker = CommandInvoker::new(&client, Placeholders::new().with("port", 30000));
        let point = ConfigurationPoint::new(vec![("concurrency".into(), "16".into())]);
        assert_eq!(
            invoker.command_for(&point, 2).describe(),
            "bench --max-concurrency 16 --seed 2 --port 30000"
        );
    }
}
