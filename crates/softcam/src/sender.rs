//! Frame producer with optional pacing.

use softcam_core::{Clock, FrameBuffer, FrameBufferConfig, Result};
use tracing::{debug, info};

/// Sleep between polls in [`Sender::wait_for_connection`], in seconds.
const CONNECTION_POLL_SECS: f32 = 0.001;

/// Producer side of a virtual camera.
///
/// Owns the frame buffer it creates. Frames sent through a sender with a
/// positive framerate are paced to that rate; dropping the sender marks the
/// buffer inactive so consumers show the last frame dimmed.
#[derive(Debug)]
pub struct Sender {
    frame_buffer: FrameBuffer,
    /// Seconds between frames, `None` when unpaced
    interval: Option<f32>,
    /// Reads negative until the next frame is due
    schedule: Clock,
}

impl Sender {
    /// Create a camera under the well-known names.
    ///
    /// `width` and `height` must be multiples of four in `1..=16384`. A
    /// `framerate` of 0 disables pacing.
    pub fn new(width: u32, height: u32, framerate: f32) -> Result<Self> {
        Self::with_config(&FrameBufferConfig::default(), width, height, framerate)
    }

    /// Create a camera bound to the names in `config`.
    pub fn with_config(
        config: &FrameBufferConfig,
        width: u32,
        height: u32,
        framerate: f32,
    ) -> Result<Self> {
        let frame_buffer = FrameBuffer::try_create(config, width, height, framerate)?;
        Ok(Self {
            frame_buffer,
            interval: (framerate > 0.0).then(|| 1.0 / framerate),
            schedule: Clock::new(),
        })
    }

    /// Publish one frame of `width * height * 3` bytes of bottom-up BGR
    /// pixels.
    ///
    /// With pacing enabled this blocks until the frame is due. A sender
    /// that falls more than one interval behind drops the backlog instead
    /// of sending a burst.
    pub fn send_frame(&mut self, pixels: &[u8]) -> Result<()> {
        if let Some(interval) = self.interval {
            let now = self.schedule.now();
            if now < 0.0 {
                Clock::sleep(-now);
            } else if now > interval {
                debug!("sender {now:.3}s behind schedule, resynchronizing");
                self.schedule.reset();
            }
        }

        self.frame_buffer.write(pixels)?;

        if let Some(interval) = self.interval {
            self.schedule.rewind(interval);
        }
        Ok(())
    }

    /// Block until a consumer attaches or `timeout` seconds pass. A
    /// non-positive timeout waits without limit.
    ///
    /// Returns whether a consumer is connected.
    pub fn wait_for_connection(&self, timeout: f32) -> bool {
        let clock = Clock::new();
        loop {
            if self.is_connected() {
                info!("consumer connected");
                return true;
            }
            Clock::sleep(CONNECTION_POLL_SECS);
            if timeout > 0.0 && timeout <= clock.now() {
                return false;
            }
        }
    }

    /// Whether any consumer has attached since creation.
    pub fn is_connected(&self) -> bool {
        self.frame_buffer.connected()
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u16 {
        self.frame_buffer.width()
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u16 {
        self.frame_buffer.height()
    }

    /// Nominal framerate; 0 means unpaced.
    pub fn framerate(&self) -> f32 {
        self.frame_buffer.framerate()
    }

    /// Number of frames sent so far.
    pub fn frame_counter(&self) -> u64 {
        self.frame_buffer.frame_counter()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.frame_buffer.deactivate();
    }
}
