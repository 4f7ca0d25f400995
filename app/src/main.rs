//! FallWatch Monitor
//!
//! Main application entry point: keeps the live link up, watches motion
//! samples for falls and runs the emergency alert countdown.

use anyhow::Result;
use clap::Parser;
use fallwatch_link::{tcp::TcpConnector, JsonlProvider};
use fallwatch_monitor::{
    AlertChannel, AlertEvent, CalibrationModel, JsonlHistory, LoggingObserver, MonitorService, NotifyAction,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Shared with fallwatch-cli, which uses the rest of it
#[allow(dead_code)]
mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "fallwatch")]
#[command(version = "0.1.0")]
#[command(about = "FallWatch fall detection and emergency alerting", long_about = None)]
struct Args {
    /// Configuration file (default: standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay motion samples from a JSONL file
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    // Initialize logging
    init_logging(&config.log_format);

    tracing::info!("FallWatch Monitor v0.1.0");
    if config.config_path.as_os_str().is_empty() {
        tracing::warn!("No configuration file found, using defaults");
    } else {
        tracing::info!("Configuration loaded from {:?}", config.config_path);
    }

    // Fall history
    let history = JsonlHistory::open(&config.history_dir())?;
    tracing::info!("Fall history at {:?}", history.path());

    // Monitor service
    let connector = TcpConnector::new(&config.endpoint);
    let service = MonitorService::start(config.monitor_config(), Arc::new(connector), Arc::new(history));
    service.add_observer(Arc::new(LoggingObserver));

    // Calibration from the previous run
    let calibration_path = config.calibration_path();
    let mut loaded_at = None;
    if calibration_path.exists() {
        match CalibrationModel::load(&calibration_path) {
            Ok(model) => {
                let model = service.detector().restore_calibration(model);
                tracing::info!("Calibration from {} loaded", model.calibrated_at);
                loaded_at = Some(model.calibrated_at);
            }
            Err(e) => tracing::warn!("Ignoring calibration file: {}", e),
        }
    } else {
        tracing::warn!("Not calibrated, fall detection is disabled until calibration (fallwatch-cli calibrate)");
    }

    // Escalation for undeliverable alerts
    let (alert_channel, mut alert_events) = AlertChannel::new();
    service.add_observer(Arc::new(alert_channel));
    let escalation = config.escalation.clone();
    let escalation_service = service.clone();
    let escalation_task = tokio::spawn(async move {
        while let Some(event) = alert_events.recv().await {
            if let AlertEvent::DispatchFailed { alert_id, .. } = event {
                escalate(&escalation_service, escalation.as_ref(), &alert_id).await;
            }
        }
    });

    // Optional replay source
    if let Some(path) = args.replay.or_else(|| config.replay_file.as_ref().map(PathBuf::from)) {
        let provider = JsonlProvider::open(&path)?;
        tracing::info!("Replaying samples from {:?}", path);
        service.spawn_provider(Box::new(provider), Duration::from_millis(config.replay_interval_ms.max(1)));
    }

    // Go live
    tracing::info!("Connecting to {}...", config.endpoint);
    if !service.connect().await {
        tracing::warn!("Initial connect failed, retrying in the background");
    }

    tracing::info!("FallWatch is monitoring. Press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        _ = escalation_task => {
            tracing::warn!("Escalation task ended unexpectedly");
        }
    }

    // Cleanup
    tracing::info!("Shutting down...");

    if let Some(pending) = service.alerts().pending() {
        tracing::warn!("Alert {} still pending at shutdown", pending.id);
    }

    service.shutdown();

    // Only a calibration taken during this run is written back
    match service.detector().calibration() {
        Some(model) if Some(model.calibrated_at) != loaded_at => {
            match model.save(&calibration_path) {
                Ok(()) => tracing::info!("Calibration saved to {:?}", calibration_path),
                Err(e) => tracing::error!("Failed to save calibration: {}", e),
            }
        }
        _ => {}
    }

    tracing::info!("FallWatch shutdown complete");

    Ok(())
}

async fn escalate(service: &MonitorService, action: Option<&NotifyAction>, alert_id: &str) {
    let Some(action) = action else {
        tracing::error!("Alert {} undelivered and no escalation configured", alert_id);
        return;
    };

    let unresolved = service.alerts().unresolved().into_iter().find(|u| u.alert_id == alert_id);
    let Some(unresolved) = unresolved else {
        return;
    };

    match action.run(alert_id, &unresolved.notification).await {
        Ok(()) => tracing::info!("Escalation for alert {} completed", alert_id),
        Err(e) => tracing::error!("Escalation for alert {} failed: {}", alert_id, e),
    }
}

fn init_logging(format: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fallwatch=debug,fallwatch_link=debug,fallwatch_monitor=debug"));

    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false))
            .init();
    }
}
