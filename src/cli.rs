use std::path::PathBuf;

use crate::{
    Driver,
    config::{BenchSettings, DimensionSettings, default_config_path},
    gating::{server_stage, sweep_stage},
    telemetry,
};
use anyhow::{Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fleetbench", version, about = "Resumable inference server benchmark runner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub overrides: Overrides,

    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Custom config path (`.toml` or `.json`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Provision the environment and run every variant's stages.
    Run,
    /// In-environment phase; invoked by `run` inside the container.
    #[command(hide = true)]
    Stage,
    /// Print the ordered configuration points without running anything.
    Plan,
    /// Rebuild the result matrix from existing artifacts and print it.
    Matrix,
    /// Show the gate decision for every variant stage.
    Gate,
}

/// Command-line overrides applied on top of the loaded config.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    /// Environment image name.
    #[arg(long, global = true)]
    pub image: Option<String>,

    /// Environment image tag.
    #[arg(long, global = true)]
    pub tag: Option<String>,

    /// Model path passed to the server.
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Swept dimension as `name=v1,v2` (can be repeated).
    #[arg(long = "dimension", value_name = "NAME=VALUES", global = true)]
    pub dimensions: Vec<String>,

    /// Benchmark repetitions per configuration point.
    #[arg(long, global = true)]
    pub repetitions: Option<u32>,

    /// Accuracy threshold applied to every variant with an accuracy check.
    #[arg(long, global = true)]
    pub accuracy_threshold: Option<f64>,

    /// Directory for artifacts, result tables and the journal.
    #[arg(long, global = true)]
    pub output: Option<PathBuf>,

    /// Seconds to wait for the server's readiness marker.
    #[arg(long, global = true)]
    pub startup_timeout: Option<u64>,

    /// Leave the environment running afterwards.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub keep_environment: bool,

    /// Run the stage directly on the host instead of in a container.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub no_environment: bool,

    /// Exit non-zero when any stage is skipped by its gate.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub require_gate: bool,

    /// Export a JSON trace file for this run.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub trace: bool,
}

impl Overrides {
    pub fn apply(&self, settings: &mut BenchSettings) -> Result<()> {
        if let Some(image) = &self.image {
            settings.environment.image = image.clone();
        }
        if let Some(tag) = &self.tag {
            settings.environment.tag = tag.clone();
        }
        if let Some(model) = &self.model {
            settings.server.model_path = model.clone();
        }
        for spec in &self.dimensions {
            settings.set_dimension(DimensionSettings::parse(spec)?);
        }
        if let Some(repetitions) = self.repetitions {
            settings.sweep.repetitions = repetitions;
        }
        if let Some(threshold) = self.accuracy_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                bail!("accuracy threshold {threshold} must be within 0..=1");
            }
            for accuracy in settings
                .variants
                .iter_mut()
                .filter_map(|variant| variant.accuracy.as_mut())
            {
                accuracy.threshold = threshold;
            }
        }
        if let Some(output) = &self.output {
            settings.output_dir = Some(output.clone());
        }
        if let Some(timeout) = self.startup_timeout {
            settings.server.startup_timeout_secs = timeout;
        }
        if self.keep_environment {
            settings.environment.keep_environment = true;
        }
        if self.no_environment {
            settings.environment.enabled = false;
        }
        if self.require_gate {
            settings.gating.require_gate = true;
        }
        if self.trace {
            settings.telemetry.enabled = true;
        }
        settings.validate()
    }
}

fn load_settings(cli: &Cli) -> Result<BenchSettings> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut settings = BenchSettings::load_or_default(&path)?;
    cli.overrides.apply(&mut settings)?;
    Ok(settings)
}

/// Parse arguments, run the selected command and return the exit code.
pub fn run() -> Result<u8> {
    execute(Cli::parse())
}

pub fn execute(cli: Cli) -> Result<u8> {
    let settings = load_settings(&cli)?;
    let service = match cli.command {
        Command::Stage => "fleetbench-stage",
        _ => "fleetbench",
    };
    let output_dir = settings.resolve_output_dir()?;
    telemetry::init_tracing(service, cli.verbose, &settings.telemetry, &output_dir)?;

    let require_gate = settings.gating.require_gate;
    let driver = Driver::from_settings(settings)?;
    info!(output = %driver.output_dir().display(), run_id = %driver.journal().run_id(), "fleetbench starting");

    match cli.command {
        Command::Run | Command::Stage => {
            let summary = if cli.command == Command::Run {
                driver.run(cli.verbose)?
            } else {
                driver.run_stage()?
            };
            print!("{summary}");
            if summary.gate_failed(require_gate) {
                return Ok(1);
            }
            Ok(0)
        }
        Command::Plan => {
            let plan = driver.plan();
            let points = plan.points();
            for (index, point) in points.iter().enumerate() {
                println!("{:>4}  {:<32} {}", index + 1, point.key(), point);
            }
            println!(
                "{} points x {} repetitions = {} runs per variant ({} variants)",
                points.len(),
                plan.repetitions(),
                plan.total_runs(),
                driver.settings().variants.len()
            );
            Ok(0)
        }
        Command::Matrix => {
            let aggregator = driver.aggregator()?;
            let matrix = aggregator.refresh()?;
            if matrix.is_empty() {
                println!("No complete artifacts under {}", driver.output_dir().display());
            } else {
                print!("{}", matrix.render_tsv());
            }
            Ok(0)
        }
        Command::Gate => {
            let gating = driver.gating()?;
            let mut denied = false;
            for variant in &driver.settings().variants {
                for stage in [server_stage(&variant.name), sweep_stage(&variant.name)] {
                    let decision = gating.should_run(&stage)?;
                    denied |= !decision.allow;
                    println!("{stage:<32} {decision}");
                }
            }
            Ok(if denied && require_gate { 1 } else { 0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccuracySettings, VariantSettings};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fleetbench").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn parses_subcommand_with_global_overrides() {
        let cli = parse(&[
            "run",
            "--image",
            "lmsysorg/sglang",
            "--tag",
            "v0.4",
            "--dimension",
            "concurrency=1,8",
            "--dimension",
            "input_len=1024",
            "--repetitions",
            "2",
            "--require-gate",
            "--verbose",
        ]);
        assert_eq!(cli.command, Command::Run);
        assert!(cli.verbose);
        assert_eq!(cli.overrides.tag.as_deref(), Some("v0.4"));
        assert_eq!(cli.overrides.dimensions.len(), 2);
        assert_eq!(cli.overrides.repetitions, Some(2));
        assert!(cli.overrides.require_gate);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["fleetbench"]).is_err());
    }

    #[test]
    fn overrides_update_settings() {
        let mut settings = BenchSettings::default();
        let mut gated = VariantSettings::named("eagle");
        gated.accuracy = Some(AccuracySettings {
            binary: "eval".into(),
            args: Vec::new(),
            env: Vec::new(),
            threshold: 0.5,
            timeout_secs: 10,
        });
        settings.variants.push(gated);

        let cli = parse(&[
            "plan",
            "--dimension",
            "concurrency=2,32",
            "--dimension",
            "input_len=512",
            "--accuracy-threshold",
            "0.7",
            "--startup-timeout",
            "60",
            "--no-environment",
            "--output",
            "/tmp/fleetbench-runs",
        ]);
        cli.overrides.apply(&mut settings).expect("apply");

        assert_eq!(settings.sweep.dimensions.len(), 2);
        assert_eq!(settings.sweep.dimensions[0].values, vec!["2", "32"]);
        assert_eq!(settings.sweep.dimensions[1].name, "input_len");
        let threshold = settings
            .variant("eagle")
            .and_then(|variant| variant.accuracy.as_ref())
            .map(|accuracy| accuracy.threshold);
        assert_eq!(threshold, Some(0.7));
        assert_eq!(settings.server.startup_timeout_secs, 60);
        assert!(!settings.environment.enabled);
        assert_eq!(
            settings.output_dir,
            Some(PathBuf::from("/tmp/fleetbench-runs"))
        );
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let mut settings = BenchSettings::default();
        let cli = parse(&["plan", "--accuracy-threshold", "1.5"]);
        assert!(cli.overrides.apply(&mut settings).is_err());

        let cli = parse(&["plan", "--dimension", "concurrency"]);
        assert!(cli.overrides.apply(&mut settings).is_err());

        let cli = parse(&["plan", "--repetitions", "0"]);
        assert!(cli.overrides.apply(&mut settings).is_err());
    }
}
