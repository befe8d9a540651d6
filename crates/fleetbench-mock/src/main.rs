mod profiles;

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, bail};
use axum::{Json, Router, extract::State, routing::get};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::profiles::{LatencyProfile, default_profile, find_profile, profiles};

const READY_BANNER: &str = "The server is fired up and ready to roll!";

#[derive(Parser, Debug)]
#[command(name = "fleetbench-mock", version, about = "Simulated inference server and benchmark client", long_about = None)]
struct MockCli {
    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: MockCommand,
}

#[derive(Subcommand, Debug)]
enum MockCommand {
    /// Serve `/health` and `/get_server_info` like an inference server.
    Server(ServerCommand),
    /// Print benchmark metrics for one configuration point.
    Client(ClientCommand),
    /// Print an accuracy score for the server's profile.
    Accuracy(AccuracyCommand),
    /// List the built-in latency profiles.
    Profiles,
}

#[derive(Args, Debug)]
struct ServerCommand {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 30000)]
    port: u16,

    #[arg(long = "model-path", default_value = "mock-model")]
    model_path: String,

    #[arg(long, default_value_t = 1)]
    tp: u32,

    /// Latency profile reported to clients.
    #[arg(long, default_value = "baseline")]
    profile: String,

    /// Seconds to wait before announcing readiness.
    #[arg(long, default_value_t = 1)]
    startup_delay: u64,

    /// Die with a fatal error instead of becoming ready.
    #[arg(long, action = ArgAction::SetTrue)]
    fail_startup: bool,

    /// Exit after this many seconds of being ready.
    #[arg(long)]
    crash_after: Option<u64>,

    /// Flags after `--` are accepted and reported as-is.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<String>,
}

#[derive(Args, Debug)]
struct ClientCommand {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 30000)]
    port: u16,

    #[arg(long = "max-concurrency", default_value_t = 1)]
    concurrency: u32,

    #[arg(long = "input-len", default_value_t = 1024)]
    input_len: u32,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Simulate an out-of-memory failure above this concurrency.
    #[arg(long)]
    oom_above: Option<u32>,
}

#[derive(Args, Debug)]
struct AccuracyCommand {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 30000)]
    port: u16,
}

#[derive(Debug, Clone, Serialize)]
struct ServerInfo {
    model_path: String,
    tp_size: u32,
    profile: String,
    started_at: String,
    extra_args: Vec<String>,
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        "fleetbench_mock=debug"
    } else {
        "fleetbench_mock=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MockCli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        MockCommand::Server(cmd) => run_server(cmd).await,
        MockCommand::Client(cmd) => run_client(cmd).await,
        MockCommand::Accuracy(cmd) => run_accuracy(cmd).await,
        MockCommand::Profiles => {
            for profile in profiles() {
                println!("{:<12} {}", profile.name, profile.description);
            }
            Ok(())
        }
    }
}

async fn run_server(cmd: ServerCommand) -> Result<()> {
    let profile = find_profile(&cmd.profile)
        .with_context(|| format!("unknown profile '{}'", cmd.profile))?;
    let addr: SocketAddr = format!("{}:{}", cmd.host, cmd.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cmd.host, cmd.port))?;

    println!("loading {} (tp={}, profile={})", cmd.model_path, cmd.tp, profile.name);
    tokio::time::sleep(Duration::from_secs(cmd.startup_delay)).await;
    if cmd.fail_startup {
        println!("RuntimeError: CUDA error: an illegal memory access was encountered");
        bail!("simulated startup failure");
    }

    let info = ServerInfo {
        model_path: cmd.model_path.clone(),
        tp_size: cmd.tp,
        profile: profile.name.to_string(),
        started_at: Utc::now().to_rfc3339(),
        extra_args: cmd.extra.clone(),
    };
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/get_server_info", get(server_info_handler))
        .with_state(info);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind mock server at {addr}"))?;
    info!(addr = %addr, "mock server listening");
    println!("{READY_BANNER}");

    let crash_after = cmd.crash_after;
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        match crash_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    });
    serve
        .await
        .context("mock server terminated unexpectedly")?;

    if crash_after.is_some() {
        println!("Segmentation fault");
        bail!("simulated mid-run crash");
    }
    Ok(())
}

async fn server_info_handler(State(info): State<ServerInfo>) -> Json<ServerInfo> {
    Json(info)
}

/// Fetch the profile the server was started with.
async fn server_profile(host: &str, port: u16) -> Result<&'static LatencyProfile> {
    let client = reqwest::Client::builder()
        .user_agent("fleetbench-mock")
        .timeout(Duration::from_secs(5))
        .build()?;
    let url = format!("http://{host}:{port}/get_server_info");
    let body: serde_json::Value = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("server at {url} unreachable"))?
        .error_for_status()?
        .json()
        .await?;
    let name = body
        .get("profile")
        .and_then(|value| value.as_str())
        .unwrap_or(default_profile().name);
    Ok(find_profile(name).unwrap_or_else(default_profile))
}

async fn run_client(cmd: ClientCommand) -> Result<()> {
    let profile = server_profile(&cmd.host, cmd.port).await?;
    if cmd.oom_above.is_some_and(|limit| cmd.concurrency > limit) {
        println!("torch.OutOfMemoryError: CUDA out of memory. Tried to allocate 2.00 GiB");
        warn!(concurrency = cmd.concurrency, "simulated out-of-memory");
        std::process::exit(1);
    }

    let measurement = profile.measure(cmd.concurrency, cmd.input_len, cmd.seed);
    println!("============ Serving Benchmark Result ============");
    println!("{:<40}{}", "Max request concurrency:", cmd.concurrency);
    println!("{:<40}{}", "Input length:", cmd.input_len);
    println!("{:<40}{:.2}", "Output token throughput (tok/s):", measurement.throughput);
    println!("{:<40}{:.2}", "Median E2E Latency (ms):", measurement.e2e_ms);
    println!("{:<40}{:.2}", "Median TTFT (ms):", measurement.first_token_ms);
    println!("{:<40}{:.2}", "Median ITL (ms):", measurement.inter_token_ms);
    println!("==================================================");
    Ok(())
}

async fn run_accuracy(cmd: AccuracyCommand) -> Result<()> {
    let profile = server_profile(&cmd.host, cmd.port).await?;
    println!("Accuracy: {:.3}", profile.accuracy);
    Ok(())
}
