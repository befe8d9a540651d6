//! Stage gating from prerequisite artifacts.
//!
//! Decisions are recomputed from disk every time they are needed. A
//! prerequisite that has not produced a complete artifact yet never blocks a
//! stage.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

use crate::config::{BenchSettings, GatingSettings};
use crate::metrics::{label_pattern, last_match};

pub const ACCURACY_LOG: &str = "accuracy.log";

pub fn accuracy_path(output_dir: &Path, variant: &str) -> PathBuf {
    output_dir.join(variant).join(ACCURACY_LOG)
}

/// Stage that brings up a variant's server (and runs its accuracy check).
pub fn server_stage(variant: &str) -> String {
    format!("{variant}/server")
}

/// Stage that sweeps a variant's configuration points.
pub fn sweep_stage(variant: &str) -> String {
    format!("{variant}/sweep")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatingDecision {
    pub allow: bool,
    pub reason: String,
}

impl GatingDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for GatingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allow { "run" } else { "skip" };
        write!(f, "{verdict}: {}", self.reason)
    }
}

/// Accuracy check whose artifact decides whether later stages run.
#[derive(Debug, Clone, PartialEq)]
pub struct Prerequisite {
    pub name: String,
    pub path: PathBuf,
    pub threshold: f64,
}

/// Evaluated state of one prerequisite.
#[derive(Debug, Clone, PartialEq)]
pub enum PrerequisiteState {
    NotEvaluated,
    Passed { accuracy: f64 },
    Failed { reason: String },
    /// Accuracy below the minimum valid value: the server crashed rather
    /// than scoring poorly.
    Crashed { accuracy: f64 },
}

impl PrerequisiteState {
    pub fn failed(&self) -> bool {
        matches!(
            self,
            PrerequisiteState::Failed { .. } | PrerequisiteState::Crashed { .. }
        )
    }

    fn describe(&self, prerequisite: &Prerequisite) -> String {
        match self {
            PrerequisiteState::NotEvaluated => {
                format!("{} not yet evaluated", prerequisite.name)
            }
            PrerequisiteState::Passed { accuracy } => format!(
                "{} accuracy {accuracy:.4} >= {:.4}",
                prerequisite.name, prerequisite.threshold
            ),
            PrerequisiteState::Failed { reason } => format!("{} {reason}", prerequisite.name),
            PrerequisiteState::Crashed { accuracy } => format!(
                "{} accuracy {accuracy:.4} indicates a crashed server",
                prerequisite.name
            ),
        }
    }
}

/// `requires`: every one must not have failed. `any_of`: at least one must
/// not have failed (skip only when all failed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateRule {
    pub requires: Vec<Prerequisite>,
    pub any_of: Vec<Prerequisite>,
}

#[derive(Debug, Clone)]
pub struct GatingPolicy {
    accuracy: Regex,
    min_valid_accuracy: f64,
    completion_marker: String,
    stages: BTreeMap<String, GateRule>,
}

impl GatingPolicy {
    pub fn new(settings: &GatingSettings, completion_marker: &str) -> Result<Self> {
        let accuracy = label_pattern(&settings.accuracy_label)
            .context("invalid accuracy label")?;
        Ok(Self {
            accuracy,
            min_valid_accuracy: settings.min_valid_accuracy,
            completion_marker: completion_marker.to_string(),
            stages: BTreeMap::new(),
        })
    }

    /// Register server and sweep stages for every configured variant.
    pub fn from_settings(settings: &BenchSettings, output_dir: &Path) -> Result<Self> {
        let mut policy = Self::new(&settings.gating, &settings.sweep.completion_marker)?;
        let prerequisite = |name: &str| {
            settings.variant(name).and_then(|variant| {
                variant.accuracy.as_ref().map(|accuracy| Prerequisite {
                    name: format!("{name} accuracy"),
                    path: accuracy_path(output_dir, name),
                    threshold: accuracy.threshold,
                })
            })
        };

        for variant in &settings.variants {
            let any_of: Vec<Prerequisite> = variant
                .requires_any_of
                .iter()
                .filter_map(|dependency| prerequisite(dependency))
                .collect();
            policy.register(
                server_stage(&variant.name),
                GateRule {
                    requires: Vec::new(),
                    any_of: any_of.clone(),
                },
            );
            policy.register(
                sweep_stage(&variant.name),
                GateRule {
                    requires: prerequisite(&variant.name).into_iter().collect(),
                    any_of,
                },
            );
        }
        Ok(policy)
    }

    pub fn register(&mut self, stage: impl Into<String>, rule: GateRule) {
        self.stages.insert(stage.into(), rule);
    }

    pub fn rule(&self, stage: &str) -> Option<&GateRule> {
        self.stages.get(stage)
    }

    /// Parse the last labelled accuracy from complete accuracy output.
    pub fn parse_accuracy(&self, text: &str) -> Option<f64> {
        last_match(&self.accuracy, text)
    }

    pub fn evaluate(&self, prerequisite: &Prerequisite) -> Result<PrerequisiteState> {
        if !prerequisite.path.exists() {
            return Ok(PrerequisiteState::NotEvaluated);
        }
        let bytes = fs::read(&prerequisite.path).with_context(|| {
            format!(
                "failed to read prerequisite {}",
                prerequisite.path.display()
            )
        })?;
        let text = String::from_utf8_lossy(&bytes);
        if !text.contains(self.completion_marker.as_str()) {
            return Ok(PrerequisiteState::NotEvaluated);
        }
        let state = match self.parse_accuracy(&text) {
            None => PrerequisiteState::Failed {
                reason: "reported no accuracy".into(),
            },
            Some(accuracy) if accuracy < self.min_valid_accuracy => {
                PrerequisiteState::Crashed { accuracy }
            }
            Some(accuracy) if accuracy < prerequisite.threshold => PrerequisiteState::Failed {
                reason: format!(
                    "accuracy {accuracy:.4} below threshold {:.4}",
                    prerequisite.threshold
                ),
            },
            Some(accuracy) => PrerequisiteState::Passed { accuracy },
        };
        Ok(state)
    }

    /// Decide whether `stage` runs. Unknown stages and stages without
    /// prerequisites always run.
    pub fn should_run(&self, stage: &str) -> Result<GatingDecision> {
        let Some(rule) = self.stages.get(stage) else {
            return Ok(GatingDecision::allow("no prerequisites"));
        };

        let mut reasons = Vec::new();
        for prerequisite in &rule.requires {
            let state = self.evaluate(prerequisite)?;
            if state.failed() {
                return Ok(GatingDecision::deny(state.describe(prerequisite)));
            }
            reasons.push(state.describe(prerequisite));
        }

        if !rule.any_of.is_empty() {
            let mut failures = Vec::new();
            let mut survivor = None;
            for prerequisite in &rule.any_of {
                let state = self.evaluate(prerequisite)?;
                if state.failed() {
                    failures.push(state.describe(prerequisite));
                } else {
                    survivor = Some(state.describe(prerequisite));
                    break;
                }
            }
            match survivor {
                Some(reason) => reasons.push(reason),
                None => {
                    return Ok(GatingDecision::deny(format!(
                        "every prerequisite failed: {}",
                        failures.join("; ")
                    )));
                }
            }
        }

        if reasons.is_empty() {
            return Ok(GatingDecision::allow("no prerequisites"));
        }
        Ok(GatingDecision::allow(reasons.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccuracySettings, VariantSettings};
    use tempfile::tempdir;

    const MARKER: &str = "FLEETBENCH_RUN_COMPLETE";

    fn policy() -> GatingPolicy {
        GatingPolicy::new(&GatingSettings::default(), MARKER).expect("policy")
    }

    fn write_accuracy(path: &Path, accuracy: f64) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(
            path,
            format!("Accuracy: {accuracy}\n{MARKER} outcome=ok exit_code=0 elapsed_secs=1.0\n"),
        )
        .expect("write");
    }

    fn prerequisite(dir: &Path, name: &str) -> Prerequisite {
        Prerequisite {
            name: name.into(),
            path: dir.join(name).join(ACCURACY_LOG),
            threshold: 0.6,
        }
    }

    #[test]
    fn accuracy_uses_the_metric_label_grammar() {
        let policy = policy();
        assert_eq!(policy.parse_accuracy("Accuracy= 0.75\n"), Some(0.75));
        assert_eq!(
            policy.parse_accuracy("  Accuracy 8.1e-1\nAccuracy: 0.83\n"),
            Some(0.83)
        );
        assert_eq!(policy.parse_accuracy("Mean Accuracy: 0.9\n"), None);
        assert_eq!(policy.parse_accuracy("Accuracy: NaN\n"), None);
    }

    #[test]
    fn missing_prerequisite_allows() {
        let dir = tempdir().expect("tempdir");
        let mut policy = policy();
        policy.register(
            "baseline/sweep",
            GateRule {
                requires: vec![prerequisite(dir.path(), "baseline")],
                any_of: Vec::new(),
            },
        );
        let decision = policy.should_run("baseline/sweep").expect("decision");
        assert!(decision.allow);
        assert!(decision.reason.contains("not yet evaluated"));
        assert!(policy.should_run("unregistered").expect("decision").allow);
    }

    #[test]
    fn incomplete_artifact_is_not_evaluated() {
        let dir = tempdir().expect("tempdir");
        let prerequisite = prerequisite(dir.path(), "baseline");
        fs::create_dir_all(prerequisite.path.parent().expect("parent")).expect("mkdir");
        fs::write(&prerequisite.path, "Accuracy: 0.1\n").expect("write");
        assert_eq!(
            policy().evaluate(&prerequisite).expect("state"),
            PrerequisiteState::NotEvaluated
        );
    }

    #[test]
    fn threshold_and_crash_sentinel() {
        let dir = tempdir().expect("tempdir");
        let policy = policy();
        let prerequisite = prerequisite(dir.path(), "baseline");

        write_accuracy(&prerequisite.path, 0.72);
        assert_eq!(
            policy.evaluate(&prerequisite).expect("state"),
            PrerequisiteState::Passed { accuracy: 0.72 }
        );

        write_accuracy(&prerequisite.path, 0.4);
        assert!(matches!(
            policy.evaluate(&prerequisite).expect("state"),
            PrerequisiteState::Failed { .. }
        ));

        write_accuracy(&prerequisite.path, 0.001);
        assert_eq!(
            policy.evaluate(&prerequisite).expect("state"),
            PrerequisiteState::Crashed { accuracy: 0.001 }
        );
    }

    #[test]
    fn failed_requirement_skips_with_reason() {
        let dir = tempdir().expect("tempdir");
        let mut policy = policy();
        let prerequisite = prerequisite(dir.path(), "baseline");
        write_accuracy(&prerequisite.path, 0.3);
        policy.register(
            "baseline/sweep",
            GateRule {
                requires: vec![prerequisite],
                any_of: Vec::new(),
            },
        );
        let decision = policy.should_run("baseline/sweep").expect("decision");
        assert!(!decision.allow);
        assert!(decision.reason.contains("below threshold"));
    }

    #[test]
    fn double_gate_skips_only_when_every_prerequisite_failed() {
        let dir = tempdir().expect("tempdir");
        let mut policy = policy();
        let eagle = prerequisite(dir.path(), "eagle");
        let fp8 = prerequisite(dir.path(), "fp8");
        policy.register(
            "combined/sweep",
            GateRule {
                requires: Vec::new(),
                any_of: vec![eagle.clone(), fp8.clone()],
            },
        );

        write_accuracy(&eagle.path, 0.2);
        write_accuracy(&fp8.path, 0.3);
        let decision = policy.should_run("combined/sweep").expect("decision");
        assert!(!decision.allow);
        assert!(decision.reason.starts_with("every prerequisite failed"));

        write_accuracy(&fp8.path, 0.9);
        assert!(policy.should_run("combined/sweep").expect("decision").allow);
    }

    #[test]
    fn from_settings_wires_variant_stages() {
        let dir = tempdir().expect("tempdir");
        let mut settings = BenchSettings::default();
        let accuracy = AccuracySettings {
            binary: "eval".into(),
            args: Vec::new(),
            env: Vec::new(),
            threshold: 0.6,
            timeout_secs: 60,
        };
        let mut eagle = VariantSettings::named("eagle");
        eagle.accuracy = Some(accuracy.clone());
        let mut fp8 = VariantSettings::named("fp8");
        fp8.accuracy = Some(accuracy);
        let mut combined = VariantSettings::named("combined");
        combined.requires_any_of = vec!["eagle".into(), "fp8".into()];
        settings.variants.extend([eagle, fp8, combined]);

        let policy = GatingPolicy::from_settings(&settings, dir.path()).expect("policy");
        assert_eq!(
            policy.rule(&server_stage("combined")).expect("rule").any_of.len(),
            2
        );
        assert_eq!(
            policy.rule(&sweep_stage("eagle")).expect("rule").requires.len(),
            1
        );

        write_accuracy(&accuracy_path(dir.path(), "eagle"), 0.1);
        write_accuracy(&accuracy_path(dir.path(), "fp8"), 0.2);
        assert!(!policy.should_run(&sweep_stage("eagle")).expect("d").allow);
        assert!(!policy.should_run(&server_stage("combined")).expect("d").allow);
        assert!(policy.should_run(&sweep_stage("baseline")).expect("d").allow);
    }
}
