//! Virtual camera producer.
//!
//! A [`Sender`] creates the shared frame buffer a virtual camera device
//! reads from and publishes frames into it, optionally paced to the
//! camera's nominal framerate.
//!
//! # Example
//!
//! ```rust,ignore
//! use softcam::Sender;
//!
//! let mut camera = Sender::new(320, 240, 60.0)?;
//! camera.wait_for_connection(0.0);
//!
//! let mut frame = vec![0u8; 320 * 240 * 3];
//! loop {
//!     render(&mut frame);
//!     camera.send_frame(&frame)?;
//! }
//! ```
//!
//! Frames are packed BGR, three bytes per pixel, with the bottom row first.

#![warn(missing_docs)]

mod sender;

pub use sender::Sender;
pub use softcam_core::{
    FrameBuffer, FrameBufferConfig, MAX_DIMENSION, Result, SoftcamError, dib_image_size,
    frame_size,
};
