//! FallWatch CLI Tool
//!
//! Command-line interface for fall history, calibration and offline evaluation.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fallwatch_link::{JsonlProvider, MotionSample, SampleProvider};
use fallwatch_monitor::detection::SampleHistory;
use fallwatch_monitor::history::HistorySink;
use fallwatch_monitor::{CalibrationModel, FallDetectionEngine, FallEvent, JsonlHistory, Severity};
use std::path::{Path, PathBuf};

mod config;

use config::{AppConfig, CALIBRATION_FILE};

#[derive(Parser)]
#[command(name = "fallwatch-cli")]
#[command(author = "FallWatch Team")]
#[command(version = "0.1.0")]
#[command(about = "FallWatch fall detection CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: standard locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (default: data_directory from the configuration)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recorded fall events
    Events {
        /// Minimum severity (low, medium, high, critical)
        #[arg(short, long)]
        severity: Option<Severity>,

        /// Only confirmed falls
        #[arg(long)]
        confirmed: bool,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Export fall history as one JSON document
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Calibrate from the first sample of a JSONL file
    Calibrate {
        /// Motion samples (JSONL)
        file: PathBuf,

        /// Output path (default: <data-dir>/calibration.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replay a JSONL sample file through the fall detector
    Evaluate {
        /// Motion samples (JSONL)
        file: PathBuf,

        /// Calibration to use instead of the first sample
        #[arg(short, long)]
        calibration: Option<PathBuf>,
    },

    /// Generate sample configuration
    Config {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.history_dir());

    match cli.command {
        Commands::Events { severity, confirmed, format } => {
            show_events(&data_dir, severity, confirmed, &format)?;
        }

        Commands::Export { output } => {
            let history = JsonlHistory::open(&data_dir)?;
            let count = history.export(&output)?;
            println!("{} events exported to: {:?}", count, output);
        }

        Commands::Calibrate { file, output } => {
            let output = output.unwrap_or_else(|| data_dir.join(CALIBRATION_FILE));
            calibrate(&config.detector(), &file, &output)?;
        }

        Commands::Evaluate { file, calibration } => {
            evaluate(&config.detector(), &file, calibration.as_deref())?;
        }

        Commands::Config { output } => {
            generate_config(output)?;
        }
    }

    Ok(())
}

fn show_events(data_dir: &Path, severity: Option<Severity>, confirmed_only: bool, format: &str) -> Result<()> {
    let history = JsonlHistory::open(data_dir)?;
    let mut events = history.load()?;

    // Apply filters
    if let Some(min) = severity {
        events.retain(|e| e.severity >= min);
    }

    if confirmed_only {
        events.retain(|e| e.confirmed);
    }

    if events.is_empty() {
        println!("No events found matching criteria.");
        return Ok(());
    }

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&events)?;
            println!("{}", json);
        }
        _ => {
            println!("╭──────────────────────────────────────────────────────────────────────────╮");
            println!("│                              Fall History                                │");
            println!("├──────────┬─────────────────────┬──────────┬────────┬─────────────┬───────┤");
            println!("│ Event    │ Time                │ Severity │ Source │ Outcome     │ Resp. │");
            println!("├──────────┼─────────────────────┼──────────┼────────┼─────────────┼───────┤");

            for event in &events {
                println!("│ {:8} │ {:19} │ {:8} │ {:6} │ {:11} │ {:>5} │",
                    truncate(&event.id, 8),
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.severity,
                    source_label(event),
                    outcome_label(event),
                    event.response_time_ms.map(|ms| format!("{}s", ms / 1000)).unwrap_or_else(|| "-".to_string()));
            }

            println!("╰──────────┴─────────────────────┴──────────┴────────┴─────────────┴───────╯");

            let confirmed = events.iter().filter(|e| e.confirmed).count();
            println!("\nTotal events: {} ({} confirmed, {} false alarms)",
                events.len(), confirmed, events.iter().filter(|e| e.false_alarm).count());
        }
    }

    Ok(())
}

fn calibrate(engine: &FallDetectionEngine, file: &Path, output: &Path) -> Result<()> {
    let mut provider = JsonlProvider::open(file)?;
    let sample = provider
        .next_sample()?
        .ok_or_else(|| anyhow::anyhow!("{:?} contains no motion samples", file))?;

    let model = engine.calibrate(&sample);
    model.save(output)?;

    println!("Calibration written to: {:?}", output);
    println!("  Baseline accel: ({:.2}, {:.2}, {:.2}) m/s²", model.baseline.accel.x, model.baseline.accel.y, model.baseline.accel.z);
    if let Some(bpm) = model.baseline.heart_rate {
        println!("  Baseline heart rate: {:.0} bpm", bpm);
    }
    println!("  Thresholds: impact > {:.1} m/s², rotation > {:.1} rad/s, confidence > {:.2}",
        model.thresholds.impact_magnitude, model.thresholds.rotation_magnitude, model.thresholds.min_confidence);
    Ok(())
}

fn evaluate(engine: &FallDetectionEngine, file: &Path, calibration: Option<&Path>) -> Result<()> {
    let mut provider = JsonlProvider::open(file)?;

    if let Some(path) = calibration {
        engine.restore_calibration(CalibrationModel::load(path)?);
    }

    let warmup = engine.config().warmup_samples;
    let mut history = SampleHistory::new(engine.config().history_limit);
    let mut all: Vec<MotionSample> = Vec::new();
    let mut index = 0usize;
    let mut falls = 0usize;

    while let Some(sample) = provider.next_sample()? {
        index += 1;

        if !engine.is_calibrated() {
            engine.calibrate(&sample);
            println!("Calibrated on sample #{}", index);
        }

        let prior = history.recent(FallEvent::WINDOW_LIMIT - 1);
        history.push(sample.clone());
        all.push(sample.clone());

        if history.len() <= warmup {
            continue;
        }

        let detection = engine.evaluate(&sample, &prior);
        if detection.is_fall {
            falls += 1;
            println!("#{:<6} {}  FALL {:8}  impact {:6.2} m/s²  rotation {:5.2} rad/s  Δhr {:+.0}",
                index,
                sample.timestamp.format("%H:%M:%S%.3f"),
                detection.severity,
                detection.impact_magnitude,
                detection.rotation_magnitude,
                detection.heart_rate_delta);
        }
    }

    println!("\n{} samples evaluated, {} falls detected", index, falls);
    println!("Fall risk (last {} samples): {:?}", engine.config().risk_window, engine.assess_risk(&all));

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let example = format!(
        "# FallWatch Configuration File\n\
         #\n\
         # Copy this file to /etc/fallwatch/config.toml or ~/.config/fallwatch/config.toml\n\
         # Every key is optional; missing keys use the values shown here.\n\n{}",
        AppConfig::example()
    );

    if let Some(path) = output {
        std::fs::write(&path, example)?;
        println!("Configuration written to: {:?}", path);
    } else {
        println!("{}", example);
    }

    Ok(())
}

fn source_label(event: &FallEvent) -> &'static str {
    match event.source {
        fallwatch_monitor::FallSource::Detected => "auto",
        fallwatch_monitor::FallSource::Manual => "manual",
    }
}

fn outcome_label(event: &FallEvent) -> &'static str {
    if event.confirmed {
        "confirmed"
    } else if event.false_alarm {
        "false alarm"
    } else {
        "unresolved"
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
