use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use beat_keeper::clock::{list_output_ports, MidiPortSink};
use beat_keeper::engine::{bpm_from_tau, tau_from_bpm};
use beat_keeper::testing::SyntheticPerformance;
use beat_keeper::tracking::LayerDecayRule;
use beat_keeper::{
    init_logging, replay_recording, AppConfig, BeatTracker, Recording, ReplayReport, TrackerIo,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "beat_keeper_cli",
    about = "Acoustic drum beat tracker driving a MIDI clock"
)]
struct Cli {
    /// Debug-level logging
    #[arg(long, short, global = true)]
    verbose: bool,
    /// JSON configuration file (defaults apply when absent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track a recorded two-channel WAV (kick left, snare right)
    Replay {
        #[arg(long)]
        wav: PathBuf,
        #[arg(long)]
        bpm: f64,
        /// Time of the first beat in the recording
        #[arg(long, default_value_t = 0)]
        first_beat_ms: i64,
        #[arg(long, value_enum, default_value_t = DecayArg::Equal)]
        decay_rule: DecayArg,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Track a generated performance
    Synth {
        #[arg(long, default_value_t = 120.0)]
        bpm: f64,
        /// Tempo change over the performance, in percent
        #[arg(long, default_value_t = 0.0)]
        drift: f64,
        #[arg(long, default_value_t = 8)]
        bars: usize,
        #[arg(long, default_value_t = 0)]
        jitter_us: i64,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum, default_value_t = DecayArg::Equal)]
        decay_rule: DecayArg,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Track the live input and drive a MIDI output port until Enter is pressed
    Live {
        #[arg(long)]
        bpm: f64,
        /// Substring of the MIDI output port name
        #[arg(long)]
        midi_port: Option<String>,
        /// Substring of the audio input device name
        #[arg(long)]
        input_device: Option<String>,
        /// Delay from launch to the first beat
        #[arg(long, default_value_t = 1_000)]
        first_beat_ms: i64,
    },
    /// List MIDI output ports
    Ports,
    /// Print the effective configuration as JSON
    DumpConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DecayArg {
    Equal,
    AtLeast,
}

impl From<DecayArg> for LayerDecayRule {
    fn from(arg: DecayArg) -> Self {
        match arg {
            DecayArg::Equal => LayerDecayRule::Equal,
            DecayArg::AtLeast => LayerDecayRule::AtLeast,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay {
            wav,
            bpm,
            first_beat_ms,
            decay_rule,
            output,
        } => run_replay(config, &wav, bpm, first_beat_ms, decay_rule, output),
        Commands::Synth {
            bpm,
            drift,
            bars,
            jitter_us,
            seed,
            decay_rule,
            output,
        } => {
            let defaults = SyntheticPerformance::default();
            let performance = SyntheticPerformance {
                bpm,
                drift_percent: drift,
                bars,
                jitter_us,
                seed: seed.unwrap_or(defaults.seed),
                ..defaults
            };
            run_synth(config, &performance, decay_rule, output)
        }
        Commands::Live {
            bpm,
            midi_port,
            input_device,
            first_beat_ms,
        } => run_live(
            config,
            bpm,
            midi_port.as_deref(),
            input_device.as_deref(),
            first_beat_ms,
        ),
        Commands::Ports => run_ports(),
        Commands::DumpConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::from(0))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };
    let config = AppConfig::try_load(path)
        .with_context(|| format!("loading configuration {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating configuration {}", path.display()))?;
    Ok(config)
}

fn run_replay(
    config: AppConfig,
    wav: &Path,
    bpm: f64,
    first_beat_ms: i64,
    decay_rule: DecayArg,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let recording = Recording::from_wav(wav, config.audio.oversampling)
        .with_context(|| format!("reading {}", wav.display()))?;
    let report = replay_recording(
        &recording,
        config,
        decay_rule.into(),
        tau_from_bpm(bpm),
        first_beat_ms * 1_000,
    )?;
    emit_report(&report, output)?;
    Ok(ExitCode::from(0))
}

fn run_synth(
    config: AppConfig,
    performance: &SyntheticPerformance,
    decay_rule: DecayArg,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let recording = performance.render(config.audio.frame_period_us());
    let report = replay_recording(
        &recording,
        config,
        decay_rule.into(),
        performance.initial_tau(),
        performance.first_beat_us(),
    )?;
    emit_report(&report, output)?;
    Ok(ExitCode::from(0))
}

fn run_live(
    config: AppConfig,
    bpm: f64,
    midi_port: Option<&str>,
    input_device: Option<&str>,
    first_beat_ms: i64,
) -> Result<ExitCode> {
    let midi = MidiPortSink::open(midi_port)?;
    let mut tracker = BeatTracker::start(config, TrackerIo::new(Box::new(midi)))?;
    let input = tracker.open_input(input_device)?;

    let first_beat = tracker.now_us() + first_beat_ms.max(0) * 1_000;
    tracker.begin_performance(tau_from_bpm(bpm), first_beat)?;
    eprintln!(
        "Tracking '{}' at {} Hz from {:.1} BPM. Press Enter to stop.",
        input.device_name(),
        input.sample_rate(),
        bpm
    );

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("waiting for Enter")?;

    tracker.stop_performance()?;
    input.pause()?;
    let final_bpm = bpm_from_tau(tracker.snapshot().tau);
    let telemetry = tracker.telemetry().snapshot();
    tracker.shutdown();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "final_bpm": final_bpm,
            "clamp_count": telemetry.clamp_count,
            "overrun_count": telemetry.overrun_count,
            "aborted_scans": telemetry.aborted_scans,
        }))?
    );
    Ok(ExitCode::from(0))
}

fn run_ports() -> Result<ExitCode> {
    let ports = list_output_ports()?;
    if ports.is_empty() {
        println!("No MIDI output ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(ExitCode::from(0))
}

fn emit_report(report: &ReplayReport, output_path: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    if let Some(path) = output_path {
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    } else {
        println!("{json}");
    }
    Ok(())
}
