// Copyright 2025 the ltsm-remote authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pixel format translation between server and client formats.
//!
//! Conversion is a bit-field extract, rescale, deposit pipeline: pull each
//! colour component out of the source pixel, rescale it to the target
//! component range, then pack it at the target shift. Identity conversions
//! (same format both sides) are exact and take the copy fast path.

use bytes::{BufMut, BytesMut};

use crate::framebuffer::FrameView;
use crate::protocol::PixelFormat;

/// Translates a whole frame view into `dst_format`, tightly packed
/// row-major. When the formats match the rows are copied verbatim.
pub fn translate_view(view: &FrameView<'_>, dst_format: &PixelFormat) -> BytesMut {
    let width = view.width();
    let height = view.height();
    let dst_bpp = dst_format.bytes_per_pixel();
    let mut out = BytesMut::with_capacity(width as usize * height as usize * dst_bpp);

    if view.format == dst_format {
        for y in 0..height {
            out.put_slice(view.row(y));
        }
        return out;
    }

    for y in 0..height {
        for x in 0..width {
            let pixel = convert_pixel(view.pixel(x, y), view.format, dst_format);
            put_pixel(&mut out, pixel, dst_format);
        }
    }
    out
}

/// Translates tightly packed pixel bytes from one format to another.
pub fn translate_pixels(src: &[u8], src_format: &PixelFormat, dst_format: &PixelFormat) -> BytesMut {
    if src_format == dst_format {
        return BytesMut::from(src);
    }

    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    let count = src.len() / src_bpp;
    let mut out = BytesMut::with_capacity(count * dst_bpp);
    for chunk in src.chunks_exact(src_bpp) {
        let raw = read_pixel(chunk, src_format);
        put_pixel(&mut out, convert_pixel(raw, src_format, dst_format), dst_format);
    }
    out
}

/// Converts one raw pixel value between formats.
pub fn convert_pixel(pixel: u32, src: &PixelFormat, dst: &PixelFormat) -> u32 {
    if src == dst {
        return pixel;
    }
    let r = rescale(
        (pixel >> src.red_shift) & src.red_max as u32,
        src.red_max,
        dst.red_max,
    );
    let g = rescale(
        (pixel >> src.green_shift) & src.green_max as u32,
        src.green_max,
        dst.green_max,
    );
    let b = rescale(
        (pixel >> src.blue_shift) & src.blue_max as u32,
        src.blue_max,
        dst.blue_max,
    );
    (r << dst.red_shift) | (g << dst.green_shift) | (b << dst.blue_shift)
}

/// Reads a raw pixel value from bytes laid out per `format`.
pub fn read_pixel(bytes: &[u8], format: &PixelFormat) -> u32 {
    let big = format.big_endian != 0;
    match format.bytes_per_pixel() {
        1 => bytes[0] as u32,
        2 => {
            if big {
                u16::from_be_bytes([bytes[0], bytes[1]]) as u32
            } else {
                u16::from_le_bytes([bytes[0], bytes[1]]) as u32
            }
        }
        _ => {
            if big {
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            } else {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
        }
    }
}

/// Appends a raw pixel value laid out per `format`.
#[allow(clippy::cast_possible_truncation)] // values masked to the format width
pub fn put_pixel(out: &mut BytesMut, pixel: u32, format: &PixelFormat) {
    let big = format.big_endian != 0;
    match format.bytes_per_pixel() {
        1 => out.put_u8(pixel as u8),
        2 => {
            if big {
                out.put_u16(pixel as u16);
            } else {
                out.put_u16_le(pixel as u16);
            }
        }
        _ => {
            if big {
                out.put_u32(pixel);
            } else {
                out.put_u32_le(pixel);
            }
        }
    }
}

/// Rescales a component between ranges. Equal ranges pass through
/// untouched, which is what makes identity conversion exact.
#[inline]
fn rescale(value: u32, src_max: u16, dst_max: u16) -> u32 {
    if src_max == dst_max {
        return value;
    }
    if src_max == 0 {
        return 0;
    }
    (value as u64 * dst_max as u64 / src_max as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{Framebuffer, Region};

    #[test]
    fn identity_conversion_is_exact() {
        let fmt = PixelFormat::rgb888();
        let src: Vec<u8> = (0..32).collect();
        let out = translate_pixels(&src, &fmt, &fmt);
        assert_eq!(&src[..], &out[..]);
    }

    #[test]
    fn red_pixel_to_rgb565() {
        // Source: 32bpp, red in the low byte. Pure red 0x000000FF must
        // come out as 0xF800 little-endian on the wire.
        let src_fmt = PixelFormat::rgb888();
        let dst_fmt = PixelFormat::rgb565();
        let out = translate_pixels(&[0xFF, 0x00, 0x00, 0x00], &src_fmt, &dst_fmt);
        assert_eq!(out.len(), 2);
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0xF800);
    }

    #[test]
    fn component_rescale_bounds() {
        assert_eq!(rescale(255, 255, 31), 31);
        assert_eq!(rescale(0, 255, 31), 0);
        assert_eq!(rescale(31, 31, 255), 255);
        assert_eq!(rescale(128, 255, 255), 128);
    }

    #[test]
    fn convert_pixel_round_trips_at_full_depth() {
        let a = PixelFormat::rgb888();
        let mut b = PixelFormat::rgb888();
        b.red_shift = 16;
        b.blue_shift = 0;
        let px = 0x0012_34AB;
        let there = convert_pixel(px, &a, &b);
        let back = convert_pixel(there, &b, &a);
        assert_eq!(px, back);
    }

    #[test]
    fn translate_view_matches_translate_pixels() {
        let fmt = PixelFormat::rgb888();
        let mut fb = Framebuffer::new(4, 2, fmt.clone());
        let pixels: Vec<u8> = (0..4 * 2 * 4).map(|i| (i * 7) as u8).collect();
        fb.put_region(Region::new(0, 0, 4, 2), &pixels);

        let view = fb.view(fb.bounds()).unwrap();
        let dst = PixelFormat::rgb565();
        assert_eq!(
            translate_view(&view, &dst),
            translate_pixels(&pixels, &fmt, &dst)
        );
    }
}
