//! Frame channel over a named shared memory region.
//!
//! A [`FrameBuffer`] is either attached to a region or unusable. Creation
//! and attachment never fail loudly: [`FrameBuffer::create`] and
//! [`FrameBuffer::open`] hand back an unusable buffer when the region cannot
//! be created or fails validation, and every operation on an unusable buffer
//! is a no-op returning a zero value. [`FrameBuffer::try_create`] and
//! [`FrameBuffer::try_open`] report the reason instead.
//!
//! Every read or write of the region happens through a [`LockedFrame`],
//! which can only be obtained while holding the named lock.

mod dib;
mod header;

use std::io::Cursor;
use std::mem::ManuallyDrop;

use binrw::{BinRead, BinWrite};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::FrameBufferConfig;
use crate::shmem::{NamedLock, NamedLockGuard, SharedRegion};
use crate::{Result, SoftcamError};

pub use dib::{dib_image_size, dib_row_stride};
pub use header::{
    BYTES_PER_PIXEL, HEADER_SIZE, MAX_DIMENSION, SharedHeader, check_dimensions, frame_size,
    region_size,
};

use header::FrameLayout;

/// Sleep between polls in [`FrameBuffer::wait_for_new_frame`], in seconds.
pub const POLL_INTERVAL_SECS: f32 = 0.001;

/// Single-slot frame channel between one producer and any number of
/// consumers.
#[derive(Debug)]
pub struct FrameBuffer {
    state: State,
}

#[derive(Debug)]
enum State {
    Usable(Attached),
    Unusable,
}

#[derive(Debug)]
struct Attached {
    region: ManuallyDrop<SharedRegion>,
    lock: NamedLock,
    layout: FrameLayout,
}

impl Attached {
    fn lock(&self) -> Result<LockedFrame<'_>> {
        let guard = self.lock.lock()?;
        let bytes = region_bytes(&self.region, &guard);
        Ok(LockedFrame {
            bytes,
            layout: &self.layout,
            _guard: guard,
        })
    }
}

impl Drop for Attached {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // The last-holder check must not interleave with a create or open.
        let _guard = self.lock.lock();
        // SAFETY: `region` is not touched again after this point.
        unsafe { ManuallyDrop::drop(&mut self.region) };
    }
}

/// View the whole region as bytes for as long as `guard` is held.
#[allow(unsafe_code, clippy::mut_from_ref)]
fn region_bytes<'a>(region: &'a SharedRegion, _guard: &NamedLockGuard<'a>) -> &'a mut [u8] {
    // SAFETY: the mapping is `region.len()` bytes and lives as long as
    // `region`. Every handle to the region, in this process or another,
    // touches it only while holding the named lock, so no other access
    // overlaps with the returned slice while the guard is alive.
    unsafe { std::slice::from_raw_parts_mut(region.as_mut_ptr(), region.len()) }
}

fn read_header(bytes: &[u8]) -> Result<SharedHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(SoftcamError::InvalidRegion(format!(
            "region of {} bytes cannot hold a header",
            bytes.len()
        )));
    }
    Ok(SharedHeader::read_ne(&mut Cursor::new(&bytes[..HEADER_SIZE]))?)
}

fn write_header(bytes: &mut [u8], header: &SharedHeader) -> Result<()> {
    header.write_ne(&mut Cursor::new(&mut bytes[..HEADER_SIZE]))?;
    Ok(())
}

/// Region contents, accessible while the named lock is held.
struct LockedFrame<'a> {
    bytes: &'a mut [u8],
    layout: &'a FrameLayout,
    _guard: NamedLockGuard<'a>,
}

impl LockedFrame<'_> {
    fn header(&self) -> Result<SharedHeader> {
        read_header(self.bytes)
    }

    fn store_header(&mut self, header: &SharedHeader) -> Result<()> {
        write_header(self.bytes, header)
    }

    fn pixels(&self) -> &[u8] {
        &self.bytes[self.layout.image_offset..self.layout.region_len()]
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        let end = self.layout.region_len();
        &mut self.bytes[self.layout.image_offset..end]
    }
}

impl FrameBuffer {
    /// A buffer with no backing region.
    pub const fn unusable() -> Self {
        Self {
            state: State::Unusable,
        }
    }

    /// Create the well-known region as its producer.
    ///
    /// Returns an unusable buffer when the dimensions or framerate are
    /// invalid or another handle already holds the region.
    pub fn create(width: u32, height: u32, framerate: f32) -> Self {
        Self::create_with_config(&FrameBufferConfig::default(), width, height, framerate)
    }

    /// Like [`create`](Self::create), binding to the names in `config`.
    pub fn create_with_config(
        config: &FrameBufferConfig,
        width: u32,
        height: u32,
        framerate: f32,
    ) -> Self {
        Self::try_create(config, width, height, framerate).unwrap_or_else(|e| {
            debug!("frame buffer not created: {e}");
            Self::unusable()
        })
    }

    /// Create a region and initialize its header, reporting why creation
    /// failed.
    pub fn try_create(
        config: &FrameBufferConfig,
        width: u32,
        height: u32,
        framerate: f32,
    ) -> Result<Self> {
        if !check_dimensions(width, height) {
            return Err(SoftcamError::InvalidDimensions { width, height });
        }
        if framerate.is_nan() || framerate < 0.0 {
            return Err(SoftcamError::InvalidFramerate(framerate));
        }

        // Both fit in u16 after the dimension check.
        let (width, height) = (width as u16, height as u16);
        let layout = FrameLayout::new(usize::from(width), usize::from(height));
        let lock = NamedLock::open(&config.mutex_name)?;

        let region = {
            let guard = lock.lock()?;
            let region = SharedRegion::create(&config.shared_memory_name, layout.region_len())?;
            let bytes = region_bytes(&region, &guard);
            write_header(bytes, &SharedHeader::new(width, height, framerate))?;
            region
        };

        info!(
            "created frame buffer {} ({width}x{height} @ {framerate} fps)",
            config.shared_memory_name
        );
        Ok(Self {
            state: State::Usable(Attached {
                region: ManuallyDrop::new(region),
                lock,
                layout,
            }),
        })
    }

    /// Attach to the well-known region as a consumer.
    ///
    /// Returns an unusable buffer when the region does not exist or its
    /// header does not describe a valid frame.
    pub fn open() -> Self {
        Self::open_with_config(&FrameBufferConfig::default())
    }

    /// Like [`open`](Self::open), binding to the names in `config`.
    pub fn open_with_config(config: &FrameBufferConfig) -> Self {
        Self::try_open(config).unwrap_or_else(|e| {
            debug!("frame buffer not opened: {e}");
            Self::unusable()
        })
    }

    /// Attach to an existing region, validate it and mark it connected,
    /// reporting why attaching failed.
    ///
    /// A region that fails validation is unmapped before returning.
    pub fn try_open(config: &FrameBufferConfig) -> Result<Self> {
        let lock = NamedLock::open(&config.mutex_name)?;

        let (region, layout) = {
            let guard = lock.lock()?;
            let region = SharedRegion::open(&config.shared_memory_name)?;
            let bytes = region_bytes(&region, &guard);

            let mut header = read_header(bytes)?;
            let layout = FrameLayout::validate(&header, bytes.len())?;
            if !header.connected {
                header.connected = true;
                write_header(bytes, &header)?;
            }
            (region, layout)
        };

        info!(
            "opened frame buffer {} ({}x{})",
            config.shared_memory_name, layout.width, layout.height
        );
        Ok(Self {
            state: State::Usable(Attached {
                region: ManuallyDrop::new(region),
                lock,
                layout,
            }),
        })
    }

    /// Whether this buffer is attached to a region.
    pub const fn is_usable(&self) -> bool {
        matches!(self.state, State::Usable(_))
    }

    /// Snapshot of the header under a single lock, or `None` when unusable.
    pub fn header(&self) -> Option<SharedHeader> {
        let State::Usable(attached) = &self.state else {
            return None;
        };
        match attached.lock().and_then(|frame| frame.header()) {
            Ok(header) => Some(header),
            Err(e) => {
                warn!("failed to read frame buffer header: {e}");
                None
            }
        }
    }

    /// Frame width in pixels, 0 when unusable.
    pub fn width(&self) -> u16 {
        self.header().map_or(0, |h| h.width)
    }

    /// Frame height in pixels, 0 when unusable.
    pub fn height(&self) -> u16 {
        self.header().map_or(0, |h| h.height)
    }

    /// Nominal framerate, 0.0 when unusable.
    pub fn framerate(&self) -> f32 {
        self.header().map_or(0.0, |h| h.framerate)
    }

    /// Number of frames written so far, 0 when unusable.
    pub fn frame_counter(&self) -> u64 {
        self.header().map_or(0, |h| h.frame_counter)
    }

    /// Whether the producer is still live; false when unusable.
    pub fn active(&self) -> bool {
        self.header().is_some_and(|h| h.is_active)
    }

    /// Whether a consumer has attached; false when unusable.
    pub fn connected(&self) -> bool {
        self.header().is_some_and(|h| h.connected)
    }

    /// Signal that no more frames will come. The region stays readable.
    pub fn deactivate(&self) {
        let State::Usable(attached) = &self.state else {
            return;
        };
        let result = attached.lock().and_then(|mut frame| {
            let mut header = frame.header()?;
            header.is_active = false;
            frame.store_header(&header)
        });
        match result {
            Ok(()) => debug!("frame buffer {} deactivated", attached.region.name()),
            Err(e) => warn!("failed to deactivate frame buffer: {e}"),
        }
    }

    /// Publish one frame of packed BGR pixels and bump the frame counter.
    ///
    /// `pixels` must hold at least `width * height * 3` bytes; only that
    /// many are copied. No-op when unusable.
    pub fn write(&self, pixels: &[u8]) -> Result<()> {
        let State::Usable(attached) = &self.state else {
            return Ok(());
        };
        let required = attached.layout.frame_len();
        if pixels.len() < required {
            return Err(SoftcamError::BufferTooSmall {
                required,
                actual: pixels.len(),
            });
        }

        let mut frame = attached.lock()?;
        frame.pixels_mut().copy_from_slice(&pixels[..required]);
        let mut header = frame.header()?;
        header.frame_counter = header.frame_counter.wrapping_add(1);
        frame.store_header(&header)
    }

    /// Copy the current frame into a top-down DIB and return the frame
    /// counter it belongs to.
    ///
    /// `dib` must hold at least [`dib_image_size`] bytes; row padding is
    /// left untouched. When the producer is inactive the copied pixels are
    /// darkened to a quarter of their value. Returns 0 without copying when
    /// unusable.
    pub fn transfer_to_dib(&self, dib: &mut [u8]) -> Result<u64> {
        let State::Usable(attached) = &self.state else {
            return Ok(0);
        };
        let FrameLayout { width, height, .. } = attached.layout;
        let required = dib_image_size(width, height);
        if dib.len() < required {
            return Err(SoftcamError::BufferTooSmall {
                required,
                actual: dib.len(),
            });
        }

        let frame = attached.lock()?;
        let header = frame.header()?;
        dib::copy_flipped(frame.pixels(), dib, width, height);
        if !header.is_active {
            dib::darken(dib, width, height);
        }
        Ok(header.frame_counter)
    }

    /// Block until the frame counter exceeds `frame_counter`, the producer
    /// goes inactive, or `timeout` seconds pass. A non-positive timeout
    /// waits without limit. Returns immediately when unusable.
    pub fn wait_for_new_frame(&self, frame_counter: u64, timeout: f32) {
        let State::Usable(attached) = &self.state else {
            return;
        };
        let clock = Clock::new();
        loop {
            let header = match attached.lock().and_then(|frame| frame.header()) {
                Ok(header) => header,
                Err(e) => {
                    warn!("stopped waiting for a new frame: {e}");
                    return;
                }
            };
            if !header.is_active || header.frame_counter > frame_counter {
                return;
            }
            Clock::sleep(POLL_INTERVAL_SECS);
            if timeout > 0.0 && timeout <= clock.now() {
                return;
            }
        }
    }

    /// Drop this handle's mapping. The buffer becomes unusable; the header
    /// is left as it is.
    pub fn release(&mut self) {
        self.state = State::Unusable;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::unusable()
    }
}
