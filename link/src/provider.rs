//! Local sample sources
//!
//! Production reads real sensor input; tests and replays feed fixed
//! sequences through the same trait.

use crate::{frame, InboundFrame, LinkError, MotionSample};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Source of motion samples
pub trait SampleProvider: Send {
    /// Provider name
    fn name(&self) -> &str;

    /// Next sample, `Ok(None)` once the source is exhausted
    fn next_sample(&mut self) -> Result<Option<MotionSample>, LinkError>;
}

/// Fixed sequence of samples
pub struct ScriptedProvider {
    name: String,
    samples: VecDeque<MotionSample>,
    looping: bool,
}

impl ScriptedProvider {
    pub fn new(name: &str, samples: Vec<MotionSample>) -> Self {
        Self {
            name: name.to_string(),
            samples: samples.into(),
            looping: false,
        }
    }

    /// Replay the sequence forever
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SampleProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_sample(&mut self) -> Result<Option<MotionSample>, LinkError> {
        let sample = self.samples.pop_front();
        if self.looping {
            if let Some(ref s) = sample {
                self.samples.push_back(s.clone());
            }
        }
        Ok(sample)
    }
}

/// Replays samples from a JSONL file.
///
/// Each line is either a bare [`MotionSample`] or a `motion_sample` frame.
/// Lines that are neither are skipped with a warning.
pub struct JsonlProvider {
    name: String,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
}

impl JsonlProvider {
    pub fn open(path: &Path) -> Result<Self, LinkError> {
        let file = File::open(path)?;

        Ok(Self {
            name: path.display().to_string(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }

    fn parse_line(line: &str) -> Result<MotionSample, LinkError> {
        if let Ok(sample) = serde_json::from_str::<MotionSample>(line) {
            sample.validate()?;
            return Ok(sample);
        }

        match frame::decode(line)? {
            InboundFrame::MotionSample { data } => Ok(data),
            other => Err(LinkError::InvalidFrame(format!("expected motion sample, got {:?}", other))),
        }
    }
}

impl SampleProvider for JsonlProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_sample(&mut self) -> Result<Option<MotionSample>, LinkError> {
        for line in self.lines.by_ref() {
            let line = line?;
            self.line_no += 1;

            if line.trim().is_empty() {
                continue;
            }

            match Self::parse_line(&line) {
                Ok(sample) => return Ok(Some(sample)),
                Err(e) => {
                    tracing::warn!("Skipping line {} of {}: {}", self.line_no, self.name, e);
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::io::Write;

    fn still(z: f64) -> MotionSample {
        MotionSample::new(Vector3::new(0.0, 0.0, z), Vector3::zeros(), 0.95)
    }

    #[test]
    fn scripted_provider_drains_then_ends() {
        let mut provider = ScriptedProvider::new("script", vec![still(-9.8), still(-9.7)]);

        assert_eq!(provider.next_sample().unwrap().unwrap().accel.z, -9.8);
        assert_eq!(provider.next_sample().unwrap().unwrap().accel.z, -9.7);
        assert!(provider.next_sample().unwrap().is_none());
    }

    #[test]
    fn looping_provider_repeats() {
        let mut provider = ScriptedProvider::new("loop", vec![still(-9.8)]).looping();

        for _ in 0..3 {
            assert!(provider.next_sample().unwrap().is_some());
        }
        assert_eq!(provider.remaining(), 1);
    }

    #[test]
    fn jsonl_provider_accepts_samples_and_frames_and_skips_garbage() {
        let path = std::env::temp_dir().join(format!("fallwatch-provider-{}.jsonl", std::process::id()));
        {
            let mut file = File::create(&path).unwrap();
            writeln!(file, r#"{{"timestamp":"2024-05-01T10:00:00Z","accel":[0,0,-9.8],"gyro":[0,0,0],"confidence":0.9}}"#).unwrap();
            writeln!(file, "garbage").unwrap();
            writeln!(file).unwrap();
            writeln!(file, r#"{{"type":"motion_sample","data":{{"timestamp":"2024-05-01T10:00:01Z","accel":[10,10,-15],"gyro":[5,5,5],"heartRate":130,"confidence":0.9}}}}"#).unwrap();
        }

        let mut provider = JsonlProvider::open(&path).unwrap();
        let first = provider.next_sample().unwrap().unwrap();
        let second = provider.next_sample().unwrap().unwrap();

        assert_eq!(first.accel.z, -9.8);
        assert_eq!(second.heart_rate, Some(130.0));
        assert!(provider.next_sample().unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }
}
