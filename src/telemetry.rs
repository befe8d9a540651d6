use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::{Subscriber, debug, subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::TraceSettings;

const TRACE_SUFFIX: &str = ".trace.jsonl";

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_TRACE_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the tracing subscriber: human-readable stderr output filtered by
/// `RUST_LOG` (default `fleetbench=info`, `fleetbench=debug` when verbose),
/// plus an optional JSON trace file capturing everything. Trace files land
/// in `traces.directory`, or `<output_dir>/traces` next to the results.
pub fn init_tracing(
    service: &str,
    verbose: bool,
    traces: &TraceSettings,
    output_dir: &Path,
) -> Result<()> {
    let default_level = if verbose {
        "fleetbench=debug"
    } else {
        "fleetbench=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    match build_trace_file_layer(service, traces, output_dir)? {
        Some((writer, guard, path)) => {
            let subscriber = tracing_subscriber::registry().with(console).with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_writer(writer)
                    .with_filter(LevelFilter::TRACE),
            );
            let _ = TRACE_GUARD.set(guard);
            let _ = ACTIVE_TRACE_FILE.set(path);
            install_subscriber(subscriber)
        }
        None => install_subscriber(tracing_subscriber::registry().with(console)),
    }
}

/// Trace file written by this process, if export is enabled.
pub fn current_trace_file() -> Option<&'static PathBuf> {
    ACTIVE_TRACE_FILE.get()
}

fn build_trace_file_layer(
    service: &str,
    settings: &TraceSettings,
    output_dir: &Path,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = trace_directory(settings, output_dir);
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let (file, path) = create_trace_file(service, &directory)?;
    prune_old_traces(&directory, service, settings.max_files)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn trace_directory(settings: &TraceSettings, output_dir: &Path) -> PathBuf {
    settings
        .directory
        .clone()
        .unwrap_or_else(|| output_dir.join("traces"))
}

/// `<service>-<utc timestamp>-<pid>.trace.jsonl`. The host and the
/// in-environment stage process share a directory, hence the pid.
fn create_trace_file(service: &str, directory: &Path) -> Result<(File, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let path = directory.join(format!("{service}-{timestamp}-{}{TRACE_SUFFIX}", process::id()));
    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to create trace file {}", path.display()))?;
    Ok((file, path))
}

/// Service and timestamp of a trace file name, if it is one.
fn parse_trace_name(name: &str) -> Option<(&str, &str)> {
    let stem = name.strip_suffix(TRACE_SUFFIX)?;
    let mut parts = stem.rsplitn(3, '-');
    let pid = parts.next()?;
    let timestamp = parts.next()?;
    let service = parts.next()?;
    if pid.is_empty() || !pid.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some((service, timestamp))
}

/// Keep the `max_files` newest traces of `service`, by the timestamp in
/// their names. Other services' traces are left alone.
fn prune_old_traces(directory: &Path, service: &str, max_files: usize) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }

    let mut traces: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("Failed to read trace directory {}", directory.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        let Some((owner, timestamp)) = parse_trace_name(name) else {
            continue;
        };
        if owner == service && path.is_file() {
            traces.push((timestamp.to_string(), path));
        }
    }

    traces.sort_by(|a, b| b.cmp(a));
    for (_, path) in traces.into_iter().skip(max_files) {
        if let Err(err) = fs::remove_file(&path) {
            debug!(path = %path.display(), error = %err, "failed to prune trace file");
        }
    }
    Ok(())
}
