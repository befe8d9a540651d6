use std::{cmp::Ordering, fmt};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::artifact::RunArtifact;
use crate::config::MetricLabels;

/// Sentinel rendered for absent values.
pub const NA: &str = "NA";

/// Metric kinds extracted from benchmark output; one result-table block each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    E2eLatencyMs,
    FirstTokenLatencyMs,
    InterTokenLatencyMs,
    Throughput,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::E2eLatencyMs,
        MetricKind::FirstTokenLatencyMs,
        MetricKind::InterTokenLatencyMs,
        MetricKind::Throughput,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::E2eLatencyMs => "e2e_latency_ms",
            MetricKind::FirstTokenLatencyMs => "first_token_latency_ms",
            MetricKind::InterTokenLatencyMs => "inter_token_latency_ms",
            MetricKind::Throughput => "throughput",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Numeric fields parsed from one artifact. `None` renders as `NA`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSample {
    /// Repetition the values came from; `None` for an all-`NA` sample.
    pub repetition: Option<u32>,
    pub e2e_latency_ms: Option<f64>,
    pub first_token_latency_ms: Option<f64>,
    pub inter_token_latency_ms: Option<f64>,
    pub throughput: Option<f64>,
}

impl MetricSample {
    pub fn na() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::E2eLatencyMs => self.e2e_latency_ms,
            MetricKind::FirstTokenLatencyMs => self.first_token_latency_ms,
            MetricKind::InterTokenLatencyMs => self.inter_token_latency_ms,
            MetricKind::Throughput => self.throughput,
        }
    }

    pub fn is_na(&self) -> bool {
        MetricKind::ALL.iter().all(|kind| self.get(*kind).is_none())
    }
}

pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.2}"),
        None => NA.to_string(),
    }
}

/// Label-anchored extraction of latency/throughput fields.
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    e2e: Regex,
    ttft: Regex,
    itl: Regex,
    throughput: Regex,
}

impl MetricExtractor {
    pub fn new(labels: &MetricLabels) -> Result<Self> {
        Ok(Self {
            e2e: label_pattern(&labels.e2e_latency)?,
            ttft: label_pattern(&labels.first_token_latency)?,
            itl: label_pattern(&labels.inter_token_latency)?,
            throughput: label_pattern(&labels.throughput)?,
        })
    }

    /// Parse every labelled field; absent labels yield `None`, never an error.
    /// When a label occurs several times the last occurrence wins.
    pub fn extract(&self, text: &str) -> MetricSample {
        MetricSample {
            repetition: None,
            e2e_latency_ms: last_match(&self.e2e, text),
            first_token_latency_ms: last_match(&self.ttft, text),
            inter_token_latency_ms: last_match(&self.itl, text),
            throughput: last_match(&self.throughput, text),
        }
    }

    /// Select the lowest end-to-end latency among successful runs.
    ///
    /// Returns `None` only for an empty input. Failed runs are ignored; if no
    /// successful run carries a parseable latency the point is reported as
    /// all-`NA`. Equal latencies keep the lower repetition index. All fields of
    /// the result come from the same run.
    pub fn best_of(&self, artifacts: &[RunArtifact]) -> Option<MetricSample> {
        if artifacts.is_empty() {
            return None;
        }
        let best = artifacts
            .iter()
            .filter(|artifact| artifact.succeeded())
            .filter_map(|artifact| {
                let mut sample = self.extract(&artifact.output);
                sample.repetition = Some(artifact.repetition);
                sample.e2e_latency_ms.map(|latency| (latency, sample))
            })
            .min_by(|(a, sample_a), (b, sample_b)| {
                a.total_cmp(b)
                    .then_with(|| compare_repetition(sample_a, sample_b))
            })
            .map(|(_, sample)| sample);
        Some(best.unwrap_or_else(MetricSample::na))
    }
}

fn compare_repetition(a: &MetricSample, b: &MetricSample) -> Ordering {
    a.repetition.cmp(&b.repetition)
}

/// Matches `<label>` at a line start, then an optional `:` or `=`, then a number.
pub(crate) fn label_pattern(label: &str) -> Result<Regex> {
    let pattern = format!(
        r"(?m)^\s*{}\s*[:=]?\s*(-?[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)",
        regex::escape(label.trim())
    );
    Regex::new(&pattern).with_context(|| format!("invalid metric label '{label}'"))
}

pub(crate) fn last_match(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .filter_map(|value| value.as_str().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactStatus, CompletionTrailer, RunOutcome};
    use std::path::PathBuf;

    fn extractor() -> MetricExtractor {
        MetricExtractor::new(&MetricLabels::default()).expect("extractor")
    }

    fn report(e2e: Option<f64>, throughput: Option<f64>) -> String {
        let mut text = String::from("============ Serving Benchmark Result ============\n");
        text.push_str("Successful requests:                     200\n");
        if let Some(value) = e2e {
            text.push_str(&format!("Median E2E Latency (ms):                 {value}\n"));
        }
        text.push_str("Median TTFT (ms):                        41.07\n");
        text.push_str("Median ITL (ms):                         7.5\n");
        if let Some(value) = throughput {
            text.push_str(&format!("Output token throughput (tok/s):         {value}\n"));
        }
        text
    }

    fn artifact(repetition: u32, output: String, outcome: RunOutcome) -> RunArtifact {
        RunArtifact {
            point_key: "concurrency16".into(),
            repetition,
            path: PathBuf::from(format!("concurrency16_run{repetition}_x.log")),
            status: ArtifactStatus::Complete,
            trailer: Some(CompletionTrailer {
                outcome,
                exit_code: Some(0),
                elapsed_secs: Some(1.0),
            }),
            output,
        }
    }

    #[test]
    fn extracts_labelled_fields() {
        let sample = extractor().extract(&report(Some(1234.56), Some(987.0)));
        assert_eq!(sample.e2e_latency_ms, Some(1234.56));
        assert_eq!(sample.first_token_latency_ms, Some(41.07));
        assert_eq!(sample.inter_token_latency_ms, Some(7.5));
        assert_eq!(sample.throughput, Some(987.0));
    }

    #[test]
    fn missing_labels_become_na() {
        let sample = extractor().extract("Traceback (most recent call last):\n");
        assert!(sample.is_na());
        assert_eq!(format_value(sample.throughput), "NA");
        assert_eq!(format_value(Some(95.0)), "95.00");
    }

    #[test]
    fn best_of_picks_lowest_latency_from_one_run() {
        let artifacts = vec![
            artifact(1, report(Some(120.0), Some(10.0)), RunOutcome::Ok),
            artifact(2, report(Some(95.0), Some(20.0)), RunOutcome::Ok),
            artifact(3, report(Some(140.0), Some(30.0)), RunOutcome::Ok),
        ];
        let best = extractor().best_of(&artifacts).expect("sample");
        assert_eq!(best.e2e_latency_ms, Some(95.0));
        assert_eq!(best.throughput, Some(20.0));
        assert_eq!(best.repetition, Some(2));
    }

    #[test]
    fn fractional_latencies_are_not_truncated() {
        let artifacts = vec![
            artifact(1, report(Some(95.7), Some(1.0)), RunOutcome::Ok),
            artifact(2, report(Some(95.2), Some(2.0)), RunOutcome::Ok),
        ];
        let best = extractor().best_of(&artifacts).expect("sample");
        assert_eq!(best.repetition, Some(2));
    }

    #[test]
    fn partial_fields_remain_selectable() {
        let artifacts = vec![
            artifact(1, report(Some(200.0), Some(50.0)), RunOutcome::Ok),
            artifact(2, report(Some(150.0), None), RunOutcome::Ok),
        ];
        let best = extractor().best_of(&artifacts).expect("sample");
        assert_eq!(best.e2e_latency_ms, Some(150.0));
        assert_eq!(best.throughput, None);
    }

    #[test]
    fn failed_runs_are_ignored() {
        let artifacts = vec![
            artifact(1, report(Some(10.0), Some(999.0)), RunOutcome::Failed),
            artifact(2, report(Some(300.0), Some(50.0)), RunOutcome::Ok),
        ];
        let best = extractor().best_of(&artifacts).expect("sample");
        assert_eq!(best.e2e_latency_ms, Some(300.0));
        assert_eq!(best.throughput, Some(50.0));
    }

    #[test]
    fn no_parseable_latency_yields_na_point() {
        let extractor = extractor();
        assert!(extractor.best_of(&[]).is_none());
        let artifacts = vec![artifact(1, report(None, Some(50.0)), RunOutcome::Ok)];
        let sample = extractor.best_of(&artifacts).expect("point kept");
        assert!(sample.is_na());
    }

    #[test]
    fn ties_keep_the_earlier_repetition() {
        let artifacts = vec![
            artifact(3, report(Some(100.0), Some(3.0)), RunOutcome::Ok),
            artifact(1, report(Some(100.0), Some(1.0)), RunOutcome::Ok),
        ];
        let best = extractor().best_of(&artifacts).expect("sample");
        assert_eq!(best.repetition, Some(1));
    }
}
