//! Attach to the virtual camera as a consumer and report frame statistics.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p softcam --example frame_monitor
//! ```

use anyhow::{Result, bail};
use clap::Parser;
use softcam::{FrameBuffer, FrameBufferConfig, dib_image_size};
use std::time::{Duration, Instant};

#[derive(Debug, Parser)]
#[command(about = "Watch frames published to the virtual camera")]
struct Args {
    /// Name prefix for the shared objects instead of the well-known names
    #[arg(long, env = "SOFTCAM_PREFIX")]
    prefix: Option<String>,

    /// Seconds to wait for each frame
    #[arg(long, default_value_t = 2.0)]
    timeout: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args
        .prefix
        .as_deref()
        .map_or_else(FrameBufferConfig::default, FrameBufferConfig::with_prefix);

    let camera = FrameBuffer::try_open(&config)?;
    let (width, height) = (usize::from(camera.width()), usize::from(camera.height()));
    tracing::info!(
        "attached to {} ({width}x{height} @ {} fps)",
        config.shared_memory_name,
        camera.framerate()
    );

    let mut dib = vec![0u8; dib_image_size(width, height)];
    let mut last = camera.transfer_to_dib(&mut dib)?;
    let mut window_start = Instant::now();
    let mut window_frames = 0u64;

    loop {
        camera.wait_for_new_frame(last, args.timeout);
        if !camera.active() {
            tracing::info!("producer stopped after frame {last}");
            return Ok(());
        }

        let counter = camera.transfer_to_dib(&mut dib)?;
        if counter == last {
            bail!("no frame within {}s", args.timeout);
        }
        window_frames += counter - last;
        last = counter;

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let mean = dib.iter().map(|&b| u64::from(b)).sum::<u64>() / dib.len() as u64;
            tracing::info!(
                "frame {last}: {:.1} fps, mean level {mean}",
                window_frames as f64 / elapsed.as_secs_f64()
            );
            window_start = Instant::now();
            window_frames = 0;
        }
    }
}
