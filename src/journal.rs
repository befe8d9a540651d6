use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const JOURNAL_FILE: &str = "journal.jsonl";

/// Append-only JSON-L record of what a run did, one object per line.
#[derive(Debug, Clone)]
pub struct RunJournal {
    log_path: PathBuf,
    run_id: Uuid,
}

impl RunJournal {
    pub fn new(output_dir: &Path, run_id: Uuid) -> Self {
        Self {
            log_path: output_dir.join(JOURNAL_FILE),
            run_id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Record `phase` for `stage`, optionally with a free-form detail.
    pub fn record(&self, stage: &str, phase: JournalPhase, detail: Option<String>) -> Result<()> {
        self.append(JournalEvent {
            timestamp: Utc::now(),
            run_id: self.run_id,
            stage: stage.to_string(),
            phase,
            detail,
        })
    }

    pub fn append(&self, event: JournalEvent) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Unable to create journal directory {}", parent.display())
            })?;
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open journal {}", self.log_path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// The most recent `limit` events, across every run sharing the file.
    pub fn read_events(&self, limit: usize) -> Result<Vec<JournalEvent>> {
        if limit == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .with_context(|| format!("Failed to open journal {}", self.log_path.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<JournalEvent> = VecDeque::with_capacity(limit);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: JournalEvent = serde_json::from_str(&line)?;
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }

        Ok(buffer.into_iter().collect())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JournalEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub stage: String,
    pub phase: JournalPhase,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalPhase {
    StageStarted,
    StageSkipped,
    StageFinished,
    StageAborted,
    ServerReady,
    ServerCrashed,
    ServerRestarted,
    PointCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn events_round_trip_in_order() {
        let temp = tempdir().expect("tempdir");
        let journal = RunJournal::new(temp.path(), Uuid::new_v4());
        journal
            .record("baseline/sweep", JournalPhase::StageStarted, None)
            .expect("append");
        for point in ["concurrency16", "concurrency4", "concurrency1"] {
            journal
                .record(
                    "baseline/sweep",
                    JournalPhase::PointCompleted,
                    Some(point.into()),
                )
                .expect("append");
        }

        let recent = journal.read_events(2).expect("read");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].detail.as_deref(), Some("concurrency4"));
        assert_eq!(recent[1].detail.as_deref(), Some("concurrency1"));
        assert!(recent.iter().all(|event| event.run_id == journal.run_id()));

        let all = journal.read_events(10).expect("read");
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].phase, JournalPhase::StageStarted);
        assert!(journal.read_events(0).expect("read").is_empty());
    }

    #[test]
    fn missing_journal_reads_empty() {
        let temp = tempdir().expect("tempdir");
        let journal = RunJournal::new(&temp.path().join("absent"), Uuid::nil());
        assert!(journal.read_events(5).expect("read").is_empty());
    }

    #[test]
    fn phases_serialise_snake_case() {
        let line = serde_json::to_string(&JournalPhase::ServerRestarted).expect("json");
        assert_eq!(line, "\"server_restarted\"");
    }
}
