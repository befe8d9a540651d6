//! Result matrix rebuilt from complete artifacts and persisted after every
//! point.
//!
//! The matrix is never patched in place: [`ResultsAggregator::rebuild`]
//! recomputes every cell from the artifacts on disk, so the persisted tables
//! are a pure function of the set of complete artifacts.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::{ArtifactStore, ConfigurationPoint, RunArtifact};
use crate::metrics::{MetricExtractor, MetricKind, MetricSample, format_value};
use crate::sweep::{PointSink, SweepPlan};

pub const RESULTS_TSV: &str = "results.tsv";
pub const RESULTS_JSON: &str = "results.json";

/// One compared configuration's best samples, keyed by column label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    pub series: String,
    pub cells: BTreeMap<String, MetricSample>,
}

/// Rows = compared configurations, columns = swept point labels, one block per
/// metric kind when rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMatrix {
    pub dimensions: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<MatrixRow>,
}

impl ResultMatrix {
    /// Build from already-loaded complete artifacts, grouped per series.
    ///
    /// Columns keep plan order and only appear once at least one series has a
    /// complete artifact for them.
    pub fn from_artifacts(
        extractor: &MetricExtractor,
        plan: &SweepPlan,
        series: &[(String, Vec<RunArtifact>)],
    ) -> Self {
        let points = plan.points();
        let mut rows = Vec::new();
        let mut populated = vec![false; points.len()];

        for (label, artifacts) in series {
            let mut cells = BTreeMap::new();
            for (index, point) in points.iter().enumerate() {
                let for_point: Vec<RunArtifact> = artifacts
                    .iter()
                    .filter(|artifact| artifact.point_key == point.key() && artifact.is_complete())
                    .cloned()
                    .collect();
                if let Some(sample) = extractor.best_of(&for_point) {
                    populated[index] = true;
                    cells.insert(point.label(), sample);
                }
            }
            if !cells.is_empty() {
                rows.push(MatrixRow {
                    series: label.clone(),
                    cells,
                });
            }
        }

        let columns = points
            .iter()
            .zip(populated)
            .filter(|(_, populated)| *populated)
            .map(|(point, _)| point.label())
            .collect();

        Self {
            dimensions: plan.dimension_names(),
            columns,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn sample(&self, series: &str, column: &str) -> Option<&MetricSample> {
        self.rows
            .iter()
            .find(|row| row.series == series)
            .and_then(|row| row.cells.get(column))
    }

    pub fn value(&self, kind: MetricKind, series: &str, column: &str) -> Option<f64> {
        self.sample(series, column).and_then(|sample| sample.get(kind))
    }

    /// Tab-separated rendering: per metric a `# <metric>` line, a header of
    /// column labels, then one row per series.
    pub fn render_tsv(&self) -> String {
        let header_label = self.dimensions.join("/");
        let mut out = String::new();
        for (index, kind) in MetricKind::ALL.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            out.push_str(&format!("# {kind}\n"));
            out.push_str(&header_label);
            for column in &self.columns {
                out.push('\t');
                out.push_str(column);
            }
            out.push('\n');
            for row in &self.rows {
                out.push_str(&row.series);
                for column in &self.columns {
                    out.push('\t');
                    let value = row.cells.get(column).and_then(|sample| sample.get(*kind));
                    out.push_str(&format_value(value));
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Rebuilds and persists the matrix for every compared configuration.
#[derive(Debug, Clone)]
pub struct ResultsAggregator {
    extractor: MetricExtractor,
    plan: SweepPlan,
    series: Vec<(String, ArtifactStore)>,
    output_dir: PathBuf,
}

impl ResultsAggregator {
    pub fn new(extractor: MetricExtractor, plan: SweepPlan, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            extractor,
            plan,
            series: Vec::new(),
            output_dir: output_dir.into(),
        }
    }

    pub fn add_series(&mut self, label: impl Into<String>, store: ArtifactStore) {
        self.series.push((label.into(), store));
    }

    pub fn tsv_path(&self) -> PathBuf {
        self.output_dir.join(RESULTS_TSV)
    }

    pub fn json_path(&self) -> PathBuf {
        self.output_dir.join(RESULTS_JSON)
    }

    /// Recompute the whole matrix from the artifacts currently on disk.
    pub fn rebuild(&self) -> Result<ResultMatrix> {
        let points: Vec<ConfigurationPoint> = self.plan.points();
        let mut loaded = Vec::with_capacity(self.series.len());
        for (label, store) in &self.series {
            let mut artifacts = Vec::new();
            for point in &points {
                artifacts.extend(store.complete_for_point(point, self.plan.repetitions())?);
            }
            loaded.push((label.clone(), artifacts));
        }
        Ok(ResultMatrix::from_artifacts(
            &self.extractor,
            &self.plan,
            &loaded,
        ))
    }

    /// Write `results.tsv` and `results.json` via temp file + rename.
    pub fn persist(&self, matrix: &ResultMatrix) -> Result<()> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "failed to create results directory {}",
                self.output_dir.display()
            )
        })?;
        write_atomic(&self.tsv_path(), &matrix.render_tsv())?;
        let mut json = serde_json::to_string_pretty(matrix)?;
        json.push('\n');
        write_atomic(&self.json_path(), &json)?;
        debug!(
            path = %self.tsv_path().display(),
            columns = matrix.columns.len(),
            rows = matrix.rows.len(),
            "persisted result matrix"
        );
        Ok(())
    }

    pub fn refresh(&self) -> Result<ResultMatrix> {
        let matrix = self.rebuild()?;
        self.persist(&matrix)?;
        Ok(matrix)
    }
}

impl PointSink for ResultsAggregator {
    fn point_finished(&mut self, _point: &ConfigurationPoint) -> Result<()> {
        self.refresh().map(|_| ())
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))
}
