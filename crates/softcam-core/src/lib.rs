//! Shared-memory frame buffer for publishing video frames to a virtual camera.
//!
//! A producer process (the application rendering frames) and any number of
//! consumer processes (the camera device side) exchange a single BGR frame
//! through one named shared memory region. Neither side needs the other to be
//! running first and there is no server process: all coordination happens
//! through the region header, guarded by a named cross-process lock, plus
//! polling.
//!
//! # Layout
//!
//! ```text
//! 0x00  image_offset   u32
//! 0x04  width          u16
//! 0x06  height         u16
//! 0x08  framerate      f32
//! 0x0C  is_active      u8
//! 0x0D  connected      u8
//! 0x0E  reserved       u16
//! 0x10  frame_counter  u64
//! 0x18  pixel data     width * height * 3 bytes (B, G, R), bottom-up rows
//! ```
//!
//! All fields are native-endian.
//!
//! # Example
//!
//! ```rust,ignore
//! use softcam_core::FrameBuffer;
//!
//! // Producer
//! let producer = FrameBuffer::create(640, 480, 30.0);
//! producer.write(&vec![0u8; 640 * 480 * 3])?;
//!
//! // Consumer (usually another process)
//! let consumer = FrameBuffer::open();
//! let mut dib = vec![0u8; softcam_core::dib_image_size(640, 480)];
//! consumer.wait_for_new_frame(0, 1.0);
//! let counter = consumer.transfer_to_dib(&mut dib)?;
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Monotonic clock used for polling timeouts and frame pacing
pub mod clock;

// Names and tunables
pub mod config;

// Frame channel protocol
pub mod frame_buffer;

// Platform shared memory and named lock
pub mod shmem;

pub use clock::Clock;
pub use config::FrameBufferConfig;
pub use frame_buffer::{
    FrameBuffer, HEADER_SIZE, MAX_DIMENSION, SharedHeader, check_dimensions, dib_image_size,
    dib_row_stride, frame_size, region_size,
};
pub use shmem::{NamedLock, NamedLockGuard, SharedRegion};

/// Result type for frame buffer operations.
pub type Result<T> = std::result::Result<T, SoftcamError>;

/// Errors that can occur while creating, attaching to or using a frame buffer.
#[derive(Debug, Error)]
pub enum SoftcamError {
    /// Frame dimensions are zero, too large or not a multiple of four.
    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// Framerate is negative or not a number.
    #[error("Invalid framerate: {0}")]
    InvalidFramerate(f32),

    /// Name cannot be used for a shared memory object or lock.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// Requested region size is zero or does not fit the platform.
    #[error("Invalid region size: {0}")]
    InvalidSize(usize),

    /// A shared memory object with this name is held by another handle.
    #[error("Shared memory already exists: {0}")]
    AlreadyExists(String),

    /// No shared memory object with this name exists.
    #[error("Shared memory not found: {0}")]
    NotFound(String),

    /// The region exists but its header does not describe a valid frame.
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    /// A caller-provided buffer cannot hold a full frame.
    #[error("Buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall {
        /// Bytes needed for one frame.
        required: usize,
        /// Bytes provided.
        actual: usize,
    },

    /// Platform shared memory error.
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// Named lock error.
    #[error("Lock error: {0}")]
    Lock(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header serialization error.
    #[error("Header format error: {0}")]
    Format(#[from] binrw::Error),
}

/// Version information for the frame buffer crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Well-known name of the shared memory region.
pub const SHARED_MEMORY_NAME: &str = "DirectShow Softcam/SharedMemory";

/// Well-known name of the cross-process mutex guarding the region.
pub const NAMED_MUTEX_NAME: &str = "DirectShow Softcam/NamedMutex";
