//! Stream a moving color pattern to the virtual camera.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p softcam --example pattern_sender -- --width 640 --height 480 --fps 30
//! ```
//!
//! Run `frame_monitor` in another terminal (with the same `--prefix`, if
//! any) to watch the frames arrive.

use anyhow::{Context, Result};
use clap::Parser;
use softcam::{FrameBufferConfig, Sender, frame_size};

#[derive(Debug, Parser)]
#[command(about = "Send a test pattern to the virtual camera")]
struct Args {
    /// Frame width in pixels (multiple of 4)
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame height in pixels (multiple of 4)
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Frames per second; 0 sends as fast as possible
    #[arg(long, default_value_t = 30.0)]
    fps: f32,

    /// Number of frames to send; 0 runs until interrupted
    #[arg(long, default_value_t = 0)]
    frames: u64,

    /// Seconds to wait for a consumer before sending; 0 waits forever
    #[arg(long, default_value_t = 0.0)]
    wait: f32,

    /// Name prefix for the shared objects instead of the well-known names
    #[arg(long, env = "SOFTCAM_PREFIX")]
    prefix: Option<String>,
}

/// Fill `frame` with diagonal color bands shifted by `tick`.
fn render(frame: &mut [u8], width: usize, tick: u64) {
    let row_len = width * 3;
    for (y, row) in frame.chunks_exact_mut(row_len).enumerate() {
        for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
            let phase = (x + y) as u64 + tick * 4;
            pixel[0] = (phase % 256) as u8;
            pixel[1] = ((phase / 2) % 256) as u8;
            pixel[2] = (255 - phase % 256) as u8;
        }
    }
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

    let mut sender = Sender::with_config(&config, args.width, args.height, args.fps)
        .with_context(|| format!("failed to create camera {}", config.shared_memory_name))?;
    tracing::info!(
        "camera {}x{} @ {} fps on {}",
        sender.width(),
        sender.height(),
        sender.framerate(),
        config.shared_memory_name
    );

    tracing::info!("waiting for a consumer...");
    if !sender.wait_for_connection(args.wait) {
        tracing::warn!("no consumer after {}s, sending anyway", args.wait);
    }

    let width = usize::from(sender.width());
    let height = usize::from(sender.height());
    let mut frame = vec![0u8; frame_size(width, height)];
    let mut tick = 0u64;
    while args.frames == 0 || tick < args.frames {
        render(&mut frame, width, tick);
        sender.send_frame(&frame)?;
        tick += 1;
        if tick % 100 == 0 {
            tracing::debug!("sent {tick} frames");
        }
    }

    tracing::info!("sent {tick} frames, shutting down");
    Ok(())
}
