use std::{
    collections::{BTreeMap, HashSet},
    fs::File,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::EnvVar;
use crate::retry::{Poll, poll_until};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Materialised command specification ready to be spawned or logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self {
            binary: binary.into(),
            args,
            env: merge_env(env),
        }
    }

    /// Build a command from a binary, an argument template and env vars,
    /// substituting `{placeholder}` tokens everywhere.
    pub fn from_template(
        binary: &str,
        args: &[String],
        env: &[EnvVar],
        placeholders: &Placeholders,
    ) -> Self {
        let args = args.iter().map(|arg| placeholders.render(arg)).collect();
        let env = env
            .iter()
            .map(|pair| (pair.key.clone(), placeholders.render(&pair.value)))
            .collect();
        Self::new(placeholders.render(binary), args, env)
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn with_extra_args(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(extra);
        self
    }

    pub fn with_env(mut self, extra: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut pairs = std::mem::take(&mut self.env);
        pairs.extend(extra);
        self.env = merge_env(pairs);
        self
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    /// Like [`to_command`](Self::to_command), but the child leads a fresh
    /// process group so everything it forks can be signalled with it.
    pub fn to_group_command(&self) -> Command {
        let mut command = self.to_command();
        command.process_group(0);
        command
    }

    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            return self.binary.display().to_string();
        }
        format!("{} {}", self.binary.display(), self.args.join(" "))
    }
}

/// Later entries win; first-seen order is otherwise preserved.
fn merge_env(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for (key, value) in pairs.into_iter().rev() {
        if seen.insert(key.clone()) {
            merged.push((key, value));
        }
    }
    merged.reverse();
    merged
}

/// `{name}` substitutions applied to argument templates.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Single pass over `template`: substituted values are never expanded
    /// again, and unknown placeholders are left untouched.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let known = after
                .find('}')
                .map(|close| &after[..close])
                .and_then(|key| self.values.get(key).map(|value| (key.len(), value)));
            match known {
                Some((key_len, value)) => {
                    rendered.push_str(value);
                    rest = &after[key_len + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }
}

/// How a captured process run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Send `signal` to every process in the group led by `leader`.
/// Returns false once the group is empty.
pub fn signal_group(leader: u32, signal: libc::c_int) -> bool {
    let pgid = match libc::pid_t::try_from(leader) {
        Ok(pgid) if pgid > 0 => pgid,
        _ => return false,
    };
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    unsafe { libc::killpg(pgid, signal) == 0 }
}

/// SIGKILL the group `child` leads, then reap `child` itself.
pub fn kill_group(child: &mut Child) {
    let pid = child.id();
    if !signal_group(pid, libc::SIGKILL) {
        if let Ok(None) = child.try_wait() {
            if let Err(err) = child.kill() {
                warn!(pid, error = %err, "failed to kill process");
            }
        }
    }
    let _ = child.wait();
}

/// Spawn `spec` in its own process group with stdout and stderr appended to
/// `sink`, and wait at most `timeout`. An overrunning group is killed, and
/// so are stragglers left behind by a child that exited on time.
pub fn run_captured(spec: &CommandSpec, sink: &File, timeout: Duration) -> Result<ProcessOutcome> {
    let stdout = sink
        .try_clone()
        .context("failed to clone capture file for stdout")?;
    let stderr = sink
        .try_clone()
        .context("failed to clone capture file for stderr")?;

    let started = Instant::now();
    let mut child = spec
        .to_group_command()
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.binary().display()))?;
    debug!(pid = child.id(), command = %spec.describe(), "spawned captured process");

    let status = poll_until(CHILD_POLL_INTERVAL, timeout, || {
        Ok(match child.try_wait()? {
            Some(status) => Poll::Ready(status),
            None => Poll::Pending,
        })
    })?;

    match status {
        Some(status) => {
            if signal_group(child.id(), libc::SIGKILL) {
                debug!(pid = child.id(), "killed processes left behind by captured command");
            }
            Ok(ProcessOutcome {
                exit_code: status.code(),
                success: status.success(),
                timed_out: false,
                elapsed: started.elapsed(),
            })
        }
        None => {
            warn!(
                pid = child.id(),
                timeout_s = timeout.as_secs(),
                command = %spec.describe(),
                "process exceeded its timeout; killing"
            );
            kill_group(&mut child);
            Ok(ProcessOutcome {
                exit_code: None,
                success: false,
                timed_out: true,
                elapsed: started.elapsed(),
            })
        }
    }
}

/// Waits until `pid` is gone or a zombie nobody reaps. Linux only.
#[cfg(test)]
pub(crate) fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let running = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit_once(')')?.1.trim_start().chars().next()?;
                Some(state != 'Z' && state != 'X')
            })
            .unwrap_or(false);
        if !running {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".into(), script.into()], vec![])
    }

    #[test]
    fn placeholders_render_known_keys_only() {
        let placeholders = Placeholders::new()
            .with("concurrency", 16)
            .with("host", "127.0.0.1");
        assert_eq!(
            placeholders.render("--max-concurrency={concurrency}"),
            "--max-concurrency=16"
        );
        assert_eq!(placeholders.render("{host}:{port}"), "127.0.0.1:{port}");
        assert_eq!(placeholders.render("plain"), "plain");
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let placeholders = Placeholders::new()
            .with("model", "{port}")
            .with("port", 30000);
        assert_eq!(
            placeholders.render("--model-path={model} --port={port}"),
            "--model-path={port} --port=30000"
        );
        assert_eq!(placeholders.render("{{port}}"), "{30000}");
        assert_eq!(placeholders.render("json={\"a\": 1}"), "json={\"a\": 1}");
        assert_eq!(placeholders.render("trailing {"), "trailing {");
    }

    #[test]
    fn from_template_substitutes_args_and_env() {
        let placeholders = Placeholders::new().with("port", 30000).with("run", 2);
        let spec = CommandSpec::from_template(
            "bench",
            &["--port".into(), "{port}".into()],
            &[EnvVar {
                key: "SEED".into(),
                value: "{run}".into(),
            }],
            &placeholders,
        );
        assert_eq!(spec.args(), &["--port".to_string(), "30000".to_string()]);
        assert_eq!(spec.env(), &[("SEED".to_string(), "2".to_string())]);
        assert_eq!(spec.describe(), "bench --port 30000");
    }

    #[test]
    fn later_env_entries_override_earlier_ones() {
        let spec = CommandSpec::new(
            "server",
            vec![],
            vec![("A".into(), "1".into()), ("B".into(), "2".into())],
        )
        .with_env([("A".to_string(), "3".to_string())]);
        assert_eq!(
            spec.env(),
            &[
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "3".to_string())
            ]
        );
    }

    #[test]
    fn run_captured_records_output_and_exit_code() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.log");
        let file = File::create(&path).expect("create");
        let outcome = run_captured(
            &sh("echo hello; echo oops >&2; exit 3"),
            &file,
            Duration::from_secs(10),
        )
        .expect("run");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("hello"));
        assert!(contents.contains("oops"));
    }

    #[test]
    fn run_captured_kills_on_timeout() {
        let dir = tempdir().expect("tempdir");
        let file = File::create(dir.path().join("slow.log")).expect("create");
        let outcome = run_captured(&sh("sleep 30"), &file, Duration::from_millis(300)).expect("run");
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_background_workers_too() {
        let dir = tempdir().expect("tempdir");
        let pid_file = dir.path().join("worker.pid");
        let file = File::create(dir.path().join("client.log")).expect("create");
        let script = format!("sleep 300 & echo $! > '{}'; wait", pid_file.display());
        let outcome = run_captured(&sh(&script), &file, Duration::from_millis(500)).expect("run");
        assert!(outcome.timed_out);

        let worker: u32 = fs::read_to_string(&pid_file)
            .expect("worker pid")
            .trim()
            .parse()
            .expect("numeric pid");
        assert!(
            wait_for_exit(worker, Duration::from_secs(5)),
            "worker {worker} outlived the timed-out client"
        );
    }

    #[test]
    fn workers_left_behind_by_a_finished_command_are_killed() {
        let dir = tempdir().expect("tempdir");
        let pid_file = dir.path().join("worker.pid");
        let file = File::create(dir.path().join("client.log")).expect("create");
        let script = format!(
            "sleep 300 >/dev/null 2>&1 & echo $! > '{}'; exit 0",
            pid_file.display()
        );
        let outcome = run_captured(&sh(&script), &file, Duration::from_secs(10)).expect("run");
        assert!(outcome.success);

        let worker: u32 = fs::read_to_string(&pid_file)
            .expect("worker pid")
            .trim()
            .parse()
            .expect("numeric pid");
        assert!(wait_for_exit(worker, Duration::from_secs(5)));
    }
}
