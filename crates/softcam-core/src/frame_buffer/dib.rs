//! Conversion from the shared pixel layout to a device-independent bitmap.
//!
//! Shared frames are tightly packed and stored bottom-up relative to the
//! top-down image a consumer presents. DIB rows are padded to a multiple of
//! four bytes.

use super::header::BYTES_PER_PIXEL;

/// Bytes per DIB row for `width` pixels, padded to a multiple of four.
pub const fn dib_row_stride(width: usize) -> usize {
    (width * BYTES_PER_PIXEL + 3) & !3
}

/// Bytes needed for a `width` x `height` DIB.
pub const fn dib_image_size(width: usize, height: usize) -> usize {
    dib_row_stride(width) * height
}

/// Copy `src` rows into `dst` in reverse order at DIB stride.
///
/// Padding bytes at the end of each `dst` row are left as they are.
pub(crate) fn copy_flipped(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let row = width * BYTES_PER_PIXEL;
    let stride = dib_row_stride(width);
    for (src_row, dst_row) in src
        .chunks_exact(row)
        .take(height)
        .rev()
        .zip(dst.chunks_mut(stride))
    {
        dst_row[..row].copy_from_slice(src_row);
    }
}

/// Divide every pixel byte of a DIB by four, skipping row padding.
pub(crate) fn darken(dst: &mut [u8], width: usize, height: usize) {
    let row = width * BYTES_PER_PIXEL;
    for dst_row in dst.chunks_mut(dib_row_stride(width)).take(height) {
        for byte in &mut dst_row[..row] {
            *byte /= 4;
        }
    }
}
