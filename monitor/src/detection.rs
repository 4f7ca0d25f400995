//! Fall Detection
//!
//! Threshold evaluation of motion samples against a per-user calibration.
//! Impact and rotation decide whether a sample is a fall; a heart-rate
//! spike only raises the severity.

use crate::{MonitorError, Result, Severity};
use chrono::{DateTime, Utc};
use fallwatch_link::MotionSample;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

/// Resting-state reference taken at calibration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
    pub heart_rate: Option<f64>,
}

/// Detection thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Gravity-compensated acceleration (m/s²)
    pub impact_magnitude: f64,
    /// Angular velocity (rad/s)
    pub rotation_magnitude: f64,
    /// Rise above the recent average (bpm)
    pub heart_rate_spike: f64,
    pub min_confidence: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            impact_magnitude: 12.0,
            rotation_magnitude: 4.0,
            heart_rate_spike: 20.0,
            min_confidence: 0.85,
        }
    }
}

/// Per-user calibration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationModel {
    pub baseline: Baseline,
    pub thresholds: Thresholds,
    pub calibrated_at: DateTime<Utc>,
}

impl CalibrationModel {
    pub fn from_sample(sample: &MotionSample, thresholds: Thresholds) -> Self {
        Self {
            baseline: Baseline {
                accel: sample.accel,
                gyro: sample.gyro,
                heart_rate: sample.heart_rate,
            },
            thresholds,
            calibrated_at: Utc::now(),
        }
    }

    /// Write the model as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| MonitorError::Calibration(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MonitorError::Calibration(format!("Serialize error: {}", e)))?;

        std::fs::write(path, json).map_err(|e| MonitorError::Calibration(format!("Write error: {}", e)))?;

        tracing::info!("Saved calibration to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MonitorError::Calibration(format!("Read error: {}", e)))?;

        serde_json::from_str(&content).map_err(|e| MonitorError::Calibration(format!("Parse error: {}", e)))
    }
}

/// Maps threshold margins to a severity tier.
///
/// The margin of a measurement is `(value - threshold) / threshold`; the
/// tier comes from the mean of the impact and rotation margins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeverityPolicy {
    pub medium_margin: f64,
    pub high_margin: f64,
    pub critical_margin: f64,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            medium_margin: 0.25,
            high_margin: 0.5,
            critical_margin: 1.0,
        }
    }
}

impl SeverityPolicy {
    pub fn classify(&self, impact: f64, rotation: f64, heart_rate_delta: f64, t: &Thresholds) -> Severity {
        let margin = (relative_margin(impact, t.impact_magnitude) + relative_margin(rotation, t.rotation_magnitude)) / 2.0;

        let base = if margin >= self.critical_margin {
            Severity::Critical
        } else if margin >= self.high_margin {
            Severity::High
        } else if margin >= self.medium_margin {
            Severity::Medium
        } else {
            Severity::Low
        };

        if heart_rate_delta > 2.0 * t.heart_rate_spike {
            base.escalate(2)
        } else if heart_rate_delta > t.heart_rate_spike {
            base.escalate(1)
        } else {
            base
        }
    }
}

fn relative_margin(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 0.0;
    }
    ((value - threshold) / threshold).max(0.0)
}

/// Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Gravity reference subtracted from raw acceleration
    pub gravity: Vector3<f64>,
    /// Thresholds used for new calibrations
    pub thresholds: Thresholds,
    pub severity: SeverityPolicy,
    /// History samples averaged for the heart-rate reference
    pub heart_rate_window: usize,
    /// Samples required in history before evaluation starts
    pub warmup_samples: usize,
    pub history_limit: usize,
    /// History samples used for fall-risk assessment
    pub risk_window: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            gravity: Vector3::new(0.0, 0.0, -9.8),
            thresholds: Thresholds::default(),
            severity: SeverityPolicy::default(),
            heart_rate_window: 5,
            warmup_samples: 10,
            history_limit: 50,
            risk_window: 10,
        }
    }
}

/// Result of evaluating one sample
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub is_fall: bool,
    pub severity: Severity,
    pub impact_magnitude: f64,
    pub rotation_magnitude: f64,
    /// Current heart rate minus the recent average, 0 when unknown
    pub heart_rate_delta: f64,
}

impl Detection {
    fn none() -> Self {
        Self {
            is_fall: false,
            severity: Severity::Low,
            impact_magnitude: 0.0,
            rotation_magnitude: 0.0,
            heart_rate_delta: 0.0,
        }
    }
}

/// Coarse fall risk from recent movement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FallRisk {
    Low,
    Medium,
    High,
}

impl FallRisk {
    pub const HIGH_MEAN_ACCEL: f64 = 15.0;
    pub const MEDIUM_MEAN_ACCEL: f64 = 10.0;
}

/// Sliding window keeping a running sum
struct SlidingWindow {
    data: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl SlidingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum: 0.0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.data.len() >= self.capacity {
            if let Some(old) = self.data.pop_front() {
                self.sum -= old;
            }
        }
        self.data.push_back(value);
        self.sum += value;
    }

    fn mean(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.sum / self.data.len() as f64)
    }
}

/// Bounded rolling history of motion samples, oldest first
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<MotionSample>,
    limit: usize,
}

impl SampleHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, sample: MotionSample) {
        if self.samples.len() >= self.limit {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Newest `n` samples, oldest first
    pub fn recent(&self, n: usize) -> Vec<MotionSample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Fall detection engine
pub struct FallDetectionEngine {
    config: DetectionConfig,
    calibration: RwLock<Option<CalibrationModel>>,
}

impl FallDetectionEngine {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            calibration: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Calibrate from a resting sample, replacing any previous model
    pub fn calibrate(&self, sample: &MotionSample) -> CalibrationModel {
        let model = CalibrationModel::from_sample(sample, self.config.thresholds);
        self.set_calibration(model.clone());
        tracing::info!(
            heart_rate = ?model.baseline.heart_rate,
            "Calibrated (impact > {:.1} m/s², rotation > {:.1} rad/s)",
            model.thresholds.impact_magnitude,
            model.thresholds.rotation_magnitude
        );
        model
    }

    /// Install a previously saved model
    pub fn set_calibration(&self, model: CalibrationModel) {
        *self.calibration.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
    }

    /// Install a stored model under the engine's configured thresholds.
    /// Returns the installed model.
    pub fn restore_calibration(&self, mut model: CalibrationModel) -> CalibrationModel {
        if model.thresholds != self.config.thresholds {
            tracing::info!("Stored calibration thresholds replaced by the configured ones");
            model.thresholds = self.config.thresholds;
        }
        self.set_calibration(model.clone());
        model
    }

    pub fn reset_calibration(&self) {
        *self.calibration.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn calibration(&self) -> Option<CalibrationModel> {
        self.calibration.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Evaluate `sample` against the calibration. `history` is oldest first
    /// and does not include `sample`.
    pub fn evaluate(&self, sample: &MotionSample, history: &[MotionSample]) -> Detection {
        let Some(thresholds) = self.calibration().map(|m| m.thresholds) else {
            tracing::debug!("Skipping evaluation, not calibrated");
            return Detection::none();
        };

        let impact = (sample.accel - self.config.gravity).norm();
        let rotation = sample.gyro.norm();
        let heart_rate_delta = self.heart_rate_delta(sample, history);

        let is_fall = impact > thresholds.impact_magnitude
            && rotation > thresholds.rotation_magnitude
            && sample.confidence > thresholds.min_confidence;

        let severity = if is_fall {
            self.config.severity.classify(impact, rotation, heart_rate_delta, &thresholds)
        } else {
            Severity::Low
        };

        Detection {
            is_fall,
            severity,
            impact_magnitude: impact,
            rotation_magnitude: rotation,
            heart_rate_delta,
        }
    }

    fn heart_rate_delta(&self, sample: &MotionSample, history: &[MotionSample]) -> f64 {
        let Some(current) = sample.heart_rate else {
            return 0.0;
        };

        let n = self.config.heart_rate_window;
        let mut window = SlidingWindow::new(n);
        for bpm in history.iter().skip(history.len().saturating_sub(n)).filter_map(|s| s.heart_rate) {
            window.push(bpm);
        }

        window.mean().map(|avg| current - avg).unwrap_or(0.0)
    }

    /// Fall risk from the mean acceleration magnitude of the newest samples
    pub fn assess_risk(&self, history: &[MotionSample]) -> FallRisk {
        let n = self.config.risk_window;
        let mut window = SlidingWindow::new(n);
        for sample in history.iter().skip(history.len().saturating_sub(n)) {
            window.push(sample.accel.norm());
        }

        match window.mean() {
            Some(m) if m > FallRisk::HIGH_MEAN_ACCEL => FallRisk::High,
            Some(m) if m > FallRisk::MEDIUM_MEAN_ACCEL => FallRisk::Medium,
            _ => FallRisk::Low,
        }
    }
}

impl Default for FallDetectionEngine {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}
