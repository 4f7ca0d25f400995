//! FallWatch Link Replay Demo
//!
//! Reads motion samples from a JSONL file (or a built-in script) and plays
//! them to a client over the in-memory link.
//!
//! ```text
//! cargo run -p fallwatch-link --example replay_samples -- samples.jsonl
//! ```

use fallwatch_link::{
    memory::MemoryConnector, Connector, InboundFrame, JsonlProvider, MotionSample, SampleProvider, ScriptedProvider,
};
use nalgebra::Vector3;
use std::path::Path;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("fallwatch_link=info")
        .init();

    println!("=== FallWatch Link Replay ===\n");

    let mut provider: Box<dyn SampleProvider> = match std::env::args().nth(1) {
        Some(path) => Box::new(JsonlProvider::open(Path::new(&path))?),
        None => Box::new(ScriptedProvider::new("built-in", scripted_fall())),
    };
    println!("Source: {}\n", provider.name());

    let (connector, remote) = MemoryConnector::new();
    let mut link = connector.connect().await?;

    let mut count = 0usize;
    while let Some(sample) = provider.next_sample()? {
        remote.push(InboundFrame::MotionSample { data: sample }).await?;

        match link.inbound.recv().await {
            Some(Ok(InboundFrame::MotionSample { data })) => {
                count += 1;
                println!("#{:<4} {}  |a| {:6.2} m/s²  |ω| {:5.2} rad/s  hr {:>5}  conf {:.2}",
                    count,
                    data.timestamp.format("%H:%M:%S%.3f"),
                    data.accel.norm(),
                    data.gyro.norm(),
                    data.heart_rate.map(|hr| format!("{:.0}", hr)).unwrap_or_else(|| "-".to_string()),
                    data.confidence);
            }
            Some(Ok(other)) => println!("  unexpected frame: {}", other.kind()),
            Some(Err(e)) => println!("  decode error: {}", e),
            None => break,
        }
    }

    println!("\n{} samples replayed", count);
    Ok(())
}

fn scripted_fall() -> Vec<MotionSample> {
    let resting = || {
        MotionSample::new(Vector3::new(0.0, 0.0, -9.8), Vector3::zeros(), 0.95)
            .with_heart_rate(70.0)
            .with_device("demo-watch")
    };

    let mut samples: Vec<MotionSample> = (0..10).map(|_| resting()).collect();
    samples.push(
        MotionSample::new(Vector3::new(10.0, 10.0, -15.0), Vector3::new(5.0, 5.0, 5.0), 0.9)
            .with_heart_rate(96.0)
            .with_device("demo-watch"),
    );
    samples.push(resting());
    samples
}
