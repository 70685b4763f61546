//! Shared header layout and the size rules derived from it.

use binrw::{BinRead, BinWrite};

use crate::{Result, SoftcamError};

/// Size of [`SharedHeader`] in bytes; also the image offset of every region
/// this crate creates.
pub const HEADER_SIZE: usize = 24;

/// Largest accepted width or height in pixels.
///
/// Larger pictures would overflow the 32-bit size limits of bitmaps and of
/// the shared memory size field.
pub const MAX_DIMENSION: u32 = 16384;

/// Bytes per pixel (B, G, R).
pub const BYTES_PER_PIXEL: usize = 3;

/// Header at offset 0 of the shared region.
///
/// Serialized in native byte order with no padding:
///
/// - Offset 0x00: image_offset (u32)
/// - Offset 0x04: width (u16)
/// - Offset 0x06: height (u16)
/// - Offset 0x08: framerate (f32)
/// - Offset 0x0C: is_active (u8)
/// - Offset 0x0D: connected (u8)
/// - Offset 0x0E: reserved (u16)
/// - Offset 0x10: frame_counter (u64)
#[derive(Debug, Clone, Copy, PartialEq, BinRead, BinWrite)]
pub struct SharedHeader {
    /// Offset from the start of the header to the first pixel byte
    pub image_offset: u32,
    /// Frame width in pixels
    pub width: u16,
    /// Frame height in pixels
    pub height: u16,
    /// Nominal framerate, advisory only
    pub framerate: f32,
    /// Set while a producer is live, cleared once it deactivates
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub is_active: bool,
    /// Set once any consumer has attached
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub connected: bool,
    /// Unused, always written as zero
    pub reserved: u16,
    /// Number of frames written since creation
    pub frame_counter: u64,
}

impl SharedHeader {
    /// Header of a freshly created region: active, unconnected, no frames.
    pub const fn new(width: u16, height: u16, framerate: f32) -> Self {
        Self {
            image_offset: HEADER_SIZE as u32,
            width,
            height,
            framerate,
            is_active: true,
            connected: false,
            reserved: 0,
            frame_counter: 0,
        }
    }
}

/// Check frame dimensions.
///
/// Both sides must be in `1..=16384` and a multiple of four; other sizes tend
/// to break color conversion and compression further down the video
/// pipeline.
pub const fn check_dimensions(width: u32, height: u32) -> bool {
    width >= 1
        && width <= MAX_DIMENSION
        && width % 4 == 0
        && height >= 1
        && height <= MAX_DIMENSION
        && height % 4 == 0
}

/// Bytes of pixel data in one frame.
pub const fn frame_size(width: usize, height: usize) -> usize {
    width * height * BYTES_PER_PIXEL
}

/// Bytes needed for a region holding the header plus one frame.
pub const fn region_size(width: usize, height: usize) -> usize {
    HEADER_SIZE + frame_size(width, height)
}

/// Pixel geometry of an attached region, validated once at create/open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameLayout {
    pub image_offset: usize,
    pub width: usize,
    pub height: usize,
}

impl FrameLayout {
    /// Layout written by a creating producer.
    pub const fn new(width: usize, height: usize) -> Self {
        Self {
            image_offset: HEADER_SIZE,
            width,
            height,
        }
    }

    /// Derive the layout from a header read out of a region of
    /// `region_len` bytes, rejecting anything that would not fit.
    ///
    /// The image offset is accepted anywhere past the header as long as the
    /// pixel data stays inside the region.
    pub fn validate(header: &SharedHeader, region_len: usize) -> Result<Self> {
        if !check_dimensions(u32::from(header.width), u32::from(header.height)) {
            return Err(SoftcamError::InvalidRegion(format!(
                "unsupported dimensions {}x{}",
                header.width, header.height
            )));
        }
        if header.framerate.is_nan() || header.framerate < 0.0 {
            return Err(SoftcamError::InvalidRegion(format!(
                "invalid framerate {}",
                header.framerate
            )));
        }

        let layout = Self {
            image_offset: header.image_offset as usize,
            width: usize::from(header.width),
            height: usize::from(header.height),
        };
        if layout.image_offset < HEADER_SIZE
            || region_len <= layout.image_offset
            || region_len - layout.image_offset < layout.frame_len()
        {
            return Err(SoftcamError::InvalidRegion(format!(
                "image at offset {} with {} bytes does not fit in {region_len} bytes",
                layout.image_offset,
                layout.frame_len()
            )));
        }
        Ok(layout)
    }

    pub const fn frame_len(&self) -> usize {
        frame_size(self.width, self.height)
    }

    pub const fn region_len(&self) -> usize {
        self.image_offset + self.frame_len()
    }
}
