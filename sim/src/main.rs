//! PDR SIM: replay and analysis tool for pedestrian dead reckoning sessions.
//!
//! This program drives recorded (or synthesized) IMU sessions through the
//! estimation pipeline offline and writes the resulting trajectories out as
//! CSV for analysis or visualization.
//!
//! Three subcommands:
//!
//! - `replay`: Feed one session CSV (or every CSV in a directory) through a
//!   locator and write one trajectory CSV per session. Runs the classical
//!   step-length estimator; model-backed runs belong to the host application
//!   that owns the model artifact.
//! - `synth`: Generate a synthetic walking session with configurable
//!   cadence, turn rate, and noise, and write it as a session CSV.
//! - `config`: Write a template locator configuration file to tune pipeline
//!   parameters, selected by extension (.toml/.json/.yaml).

mod common;

use clap::{Args, Parser, Subcommand};
use common::{get_csv_files, init_logger, validate_output_dir};
use log::{error, info};
use pdr::locator::{Locator, LocatorConfig};
use pdr::replay::{ImuRecord, WalkProfile, replay, synthetic_walk};
use rayon::prelude::*;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Mutex;

const LONG_ABOUT: &str = "PDR SIM: replay and analysis tool for pedestrian dead reckoning.

Feeds recorded or synthesized IMU session files through the step-and-heading
estimation pipeline offline, exactly as the live pipeline would process them,
and writes the resulting trajectory tracks as CSV.

Session CSV columns: time, acc_x, acc_y, acc_z, gyro_x, gyro_y, gyro_z,
mag_x, mag_y, mag_z. Magnetometer columns may be zero when no magnetometer
was recorded.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay and analysis tool for pedestrian dead reckoning.", long_about = LONG_ABOUT)]
struct Cli {
    /// Command to execute
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        about = "Replay recorded sessions into trajectory tracks",
        long_about = "Replay one session CSV, or every CSV in a directory, through the \
estimation pipeline and write one trajectory CSV per session into the output directory."
    )]
    Replay(ReplayArgs),

    #[command(
        about = "Generate a synthetic walking session",
        long_about = "Generate a synthetic walking session (vertical bounce at the step \
cadence, optional constant turn rate, Gaussian sensor noise) and write it as a session CSV."
    )]
    Synth(SynthArgs),

    #[command(about = "Write a template locator configuration file")]
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Input session CSV file or directory containing session CSVs
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for trajectory CSVs
    #[arg(short, long)]
    output: PathBuf,

    /// Locator configuration file (.toml/.json/.yaml); defaults used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay multiple session files in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Args, Clone, Debug)]
struct SynthArgs {
    /// Output session CSV path
    #[arg(short, long)]
    output: PathBuf,

    /// Session length in seconds
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// Step cadence in Hz
    #[arg(long, default_value_t = 1.5)]
    cadence: f64,

    /// Constant turn rate in rad/s (0 walks straight)
    #[arg(long, default_value_t = 0.0)]
    turn_rate: f64,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 100.0)]
    sample_rate: f64,

    /// RNG seed for reproducible sessions
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Omit magnetometer columns (all zeros)
    #[arg(long)]
    no_mag: bool,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Where to write the template (.toml/.json/.yaml)
    #[arg(short, long, default_value = "locator.toml")]
    output: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("Failed to initialize logger: {e}");
    }
    let result = match cli.command {
        Command::Replay(args) => run_replay(args),
        Command::Synth(args) => run_synth(args),
        Command::Config(args) => run_config(args),
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run_replay(args: ReplayArgs) -> Result<(), Box<dyn Error>> {
    let files = get_csv_files(&args.input)?;
    validate_output_dir(&args.output)?;
    let config = match &args.config {
        Some(path) => LocatorConfig::from_file(path)?,
        None => LocatorConfig::default(),
    };
    info!("replaying {} session file(s)", files.len());

    let failures = Mutex::new(Vec::<String>::new());
    let process = |file: &PathBuf| {
        if let Err(e) = replay_one(file, &args.output, config) {
            let message = format!("{}: {e}", file.display());
            error!("{message}");
            if let Ok(mut failures) = failures.lock() {
                failures.push(message);
            }
        }
    };
    if args.parallel {
        files.par_iter().for_each(process);
    } else {
        files.iter().for_each(process);
    }

    let failures = failures.into_inner().unwrap_or_default();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(format!("{} of {} session(s) failed", failures.len(), files.len()).into())
    }
}

fn replay_one(
    file: &PathBuf,
    output_dir: &PathBuf,
    config: LocatorConfig,
) -> Result<(), Box<dyn Error>> {
    let name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("session");
    let records = ImuRecord::from_csv(file)?;
    if records.is_empty() {
        return Err("session file contains no records".into());
    }
    let locator = Locator::classical(config);
    let result = replay(&records, &locator, name);

    let pose = result.final_pose();
    info!(
        "{name}: {} samples, {} steps applied ({} detected, {} skipped), {:.1} m walked, final position [{:.2}, {:.2}] m",
        records.len(),
        result.poses.len(),
        result.metrics.steps_detected,
        result.metrics.steps_skipped,
        result.total_distance(),
        pose.position[0],
        pose.position[1],
    );
    if result.metrics.buffer_overflows > 0 || result.metrics.gap_resets > 0 {
        info!(
            "{name}: degraded conditions: {} buffer overflows, {} stream gaps, {} mag rejections",
            result.metrics.buffer_overflows,
            result.metrics.gap_resets,
            result.metrics.mag_rejections,
        );
    }

    let out = output_dir.join(format!("{name}_track.csv"));
    result.to_csv(&out)?;
    Ok(())
}

fn run_synth(args: SynthArgs) -> Result<(), Box<dyn Error>> {
    let profile = WalkProfile {
        sample_rate_hz: args.sample_rate,
        cadence_hz: args.cadence,
        duration_s: args.duration,
        turn_rate_rps: args.turn_rate,
        with_magnetometer: !args.no_mag,
        seed: args.seed,
        ..WalkProfile::default()
    };
    let records = synthetic_walk(&profile);
    ImuRecord::to_csv(&records, &args.output)?;
    info!(
        "wrote {} samples ({}s at {} Hz, cadence {} Hz) to {}",
        records.len(),
        args.duration,
        args.sample_rate,
        args.cadence,
        args.output.display()
    );
    Ok(())
}

fn run_config(args: ConfigArgs) -> Result<(), Box<dyn Error>> {
    LocatorConfig::default().to_file(&args.output)?;
    info!("wrote template configuration to {}", args.output.display());
    Ok(())
}
