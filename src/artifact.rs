//! On-disk run artifacts.
//!
//! Every (configuration point, repetition) pair owns one or more log files
//! named `<point-key>_run<repetition>_<timestamp>.log`. A file is complete iff
//! it contains the completion marker, which is only appended after the
//! benchmark invocation returned. Status is always derived from disk so it
//! survives restarts.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Immutable combination of swept dimension values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationPoint {
    values: Vec<(String, String)>,
    key: String,
}

impl ConfigurationPoint {
    pub fn new(values: Vec<(String, String)>) -> Self {
        let key = values
            .iter()
            .map(|(name, value)| format!("{}{}", sanitize(name), sanitize(value)))
            .collect::<Vec<_>>()
            .join("_");
        Self { values, key }
    }

    /// Canonical artifact key, e.g. `concurrency16` or `tp8_bs64_in1024`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn values(&self) -> &[(String, String)] {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(dimension, _)| dimension == name)
            .map(|(_, value)| value.as_str())
    }

    /// Column label used by result tables: the values joined by `/`.
    pub fn label(&self) -> String {
        self.values
            .iter()
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn primary_value(&self) -> Option<&str> {
        self.values.first().map(|(_, value)| value.as_str())
    }

    pub fn primary_numeric(&self) -> Option<f64> {
        self.primary_value()
            .and_then(|value| value.trim().parse::<f64>().ok())
    }
}

impl fmt::Display for ConfigurationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .values
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => ch,
            _ => '-',
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Missing,
    Incomplete,
    Complete,
}

/// How the benchmark invocation behind a complete artifact ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Ok,
    Failed,
    Timeout,
}

impl RunOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Ok => "ok",
            RunOutcome::Failed => "failed",
            RunOutcome::Timeout => "timeout",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(RunOutcome::Ok),
            "failed" => Some(RunOutcome::Failed),
            "timeout" => Some(RunOutcome::Timeout),
            _ => None,
        }
    }
}

/// Trailer appended after the invocation returned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionTrailer {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub elapsed_secs: Option<f64>,
}

impl CompletionTrailer {
    fn render(&self, marker: &str) -> String {
        let exit_code = self
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".into());
        let elapsed = self
            .elapsed_secs
            .map(|secs| format!("{secs:.3}"))
            .unwrap_or_else(|| "none".into());
        format!(
            "{marker} outcome={} exit_code={exit_code} elapsed_secs={elapsed}",
            self.outcome.as_str()
        )
    }

    /// Parse the `key=value` tokens following the marker. Unknown or missing
    /// tokens fall back to a successful outcome with no timing.
    fn parse(line: &str, marker: &str) -> Self {
        let mut trailer = CompletionTrailer {
            outcome: RunOutcome::Ok,
            exit_code: None,
            elapsed_secs: None,
        };
        let rest = line
            .find(marker)
            .map(|idx| &line[idx + marker.len()..])
            .unwrap_or_default();
        for token in rest.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "outcome" => {
                    if let Some(outcome) = RunOutcome::parse(value) {
                        trailer.outcome = outcome;
                    }
                }
                "exit_code" => trailer.exit_code = value.parse().ok(),
                "elapsed_secs" => trailer.elapsed_secs = value.parse().ok(),
                _ => {}
            }
        }
        trailer
    }
}

/// One captured benchmark invocation for a configuration point.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifact {
    pub point_key: String,
    pub repetition: u32,
    pub path: PathBuf,
    pub status: ArtifactStatus,
    pub trailer: Option<CompletionTrailer>,
    pub output: String,
}

impl RunArtifact {
    pub fn is_complete(&self) -> bool {
        self.status == ArtifactStatus::Complete
    }

    /// Complete, and the invocation itself reported success.
    pub fn succeeded(&self) -> bool {
        self.is_complete()
            && self
                .trailer
                .map(|trailer| trailer.outcome == RunOutcome::Ok)
                .unwrap_or(false)
    }
}

/// Directory of artifacts for one compared configuration.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    marker: String,
    oom_markers: Vec<String>,
}

impl ArtifactStore {
    pub fn open(dir: impl Into<PathBuf>, marker: &str, oom_markers: &[String]) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create artifact directory {}", dir.display()))?;
        Ok(Self {
            dir,
            marker: marker.to_string(),
            oom_markers: oom_markers.iter().map(|m| m.to_lowercase()).collect(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn prefix(point: &ConfigurationPoint, repetition: u32) -> String {
        format!("{}_run{}_", point.key(), repetition)
    }

    /// Existing files for the pair, oldest first (timestamps sort lexically).
    fn candidates(&self, point: &ConfigurationPoint, repetition: u32) -> Result<Vec<PathBuf>> {
        let prefix = Self::prefix(point, repetition);
        let mut found = Vec::new();
        if !self.dir.exists() {
            return Ok(found);
        }
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list artifacts in {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".log") && path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    fn load(&self, path: &Path, point: &ConfigurationPoint, repetition: u32) -> Result<RunArtifact> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read artifact {}", path.display()))?;
        let output = String::from_utf8_lossy(&bytes).into_owned();
        let trailer_line = output
            .lines()
            .rev()
            .find(|line| line.contains(self.marker.as_str()));
        let (status, trailer) = match trailer_line {
            Some(line) => (
                ArtifactStatus::Complete,
                Some(CompletionTrailer::parse(line, &self.marker)),
            ),
            None => (ArtifactStatus::Incomplete, None),
        };
        Ok(RunArtifact {
            point_key: point.key().to_string(),
            repetition,
            path: path.to_path_buf(),
            status,
            trailer,
            output,
        })
    }

    pub fn status(&self, point: &ConfigurationPoint, repetition: u32) -> Result<ArtifactStatus> {
        let candidates = self.candidates(point, repetition)?;
        if candidates.is_empty() {
            return Ok(ArtifactStatus::Missing);
        }
        for path in candidates.iter().rev() {
            if self.load(path, point, repetition)?.is_complete() {
                return Ok(ArtifactStatus::Complete);
            }
        }
        Ok(ArtifactStatus::Incomplete)
    }

    /// Most recent complete artifact for the pair, if any.
    pub fn latest_complete(
        &self,
        point: &ConfigurationPoint,
        repetition: u32,
    ) -> Result<Option<RunArtifact>> {
        for path in self.candidates(point, repetition)?.iter().rev() {
            let artifact = self.load(path, point, repetition)?;
            if artifact.is_complete() {
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    /// Complete artifacts for every repetition of `point`, in repetition order.
    pub fn complete_for_point(
        &self,
        point: &ConfigurationPoint,
        repetitions: u32,
    ) -> Result<Vec<RunArtifact>> {
        let mut artifacts = Vec::new();
        for repetition in 1..=repetitions {
            if let Some(artifact) = self.latest_complete(point, repetition)? {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }

    /// Create a fresh artifact file for the pair.
    pub fn begin(&self, point: &ConfigurationPoint, repetition: u32) -> Result<(PathBuf, File)> {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let prefix = Self::prefix(point, repetition);
        let mut candidate = self.dir.join(format!("{prefix}{timestamp}.log"));
        let mut counter = 0;
        while candidate.exists() {
            counter += 1;
            candidate = self.dir.join(format!("{prefix}{timestamp}-{counter}.log"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&candidate)
            .with_context(|| format!("failed to create artifact {}", candidate.display()))?;
        Ok((candidate, file))
    }

    /// Append the completion trailer; only call once the invocation returned.
    pub fn finish(
        &self,
        path: &Path,
        outcome: RunOutcome,
        exit_code: Option<i32>,
        elapsed: Duration,
    ) -> Result<CompletionTrailer> {
        let trailer = CompletionTrailer {
            outcome,
            exit_code,
            elapsed_secs: Some(elapsed.as_secs_f64()),
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("failed to reopen artifact {}", path.display()))?;
        writeln!(file)?;
        writeln!(file, "{}", trailer.render(&self.marker))
            .with_context(|| format!("failed to finalise artifact {}", path.display()))?;
        file.sync_all().ok();
        Ok(trailer)
    }

    /// Whether captured output carries an out-of-memory marker.
    pub fn contains_oom(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.oom_markers
            .iter()
            .any(|marker| lowered.contains(marker.as_str()))
    }

    pub fn read_text(&self, path: &Path) -> Result<String> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read artifact {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
