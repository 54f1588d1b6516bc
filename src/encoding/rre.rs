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

//! RRE and CoRRE encodings: background colour plus subrectangles.
//!
//! The subrectangle cover is exhaustive over non-background pixels, so
//! both encodings reconstruct the source exactly. CoRRE packs coordinates
//! into u8; the pipeline caps CoRRE rectangles at 255x255 so they always
//! fit.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{client_pixels, EncodeOptions};
use crate::error::{LtsmError, Result};
use crate::framebuffer::FrameView;
use crate::protocol::PixelFormat;
use crate::stream::FramedStream;
use crate::translate;

/// A uniformly coloured subrectangle in rect-local coordinates.
#[derive(Debug)]
struct Subrect {
    color: u32,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

/// Most common pixel value; used as the background colour.
fn background_color(pixels: &[u32]) -> u32 {
    let mut counts = std::collections::HashMap::new();
    for &px in pixels {
        *counts.entry(px).or_insert(0usize) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(color, _)| color)
        .unwrap_or(0)
}

/// Greedy exhaustive cover of non-background pixels with uniform
/// rectangles. Every non-background pixel lands in exactly one subrect.
#[allow(clippy::cast_possible_truncation)] // coordinates bounded by the u16 view size
fn find_subrects(pixels: &[u32], width: usize, height: usize, bg: u32) -> Vec<Subrect> {
    let mut subrects = Vec::new();
    let mut marked = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if marked[idx] || pixels[idx] == bg {
                continue;
            }
            let color = pixels[idx];

            // Grow right, then down, over unmarked same-colour pixels.
            let mut w = 0;
            for tx in x..width {
                if marked[y * width + tx] || pixels[y * width + tx] != color {
                    break;
                }
                w = tx - x + 1;
            }
            let mut h = 1;
            'rows: for ty in (y + 1)..height {
                for tx in x..(x + w) {
                    if marked[ty * width + tx] || pixels[ty * width + tx] != color {
                        break 'rows;
                    }
                }
                h = ty - y + 1;
            }

            for dy in 0..h {
                for dx in 0..w {
                    marked[(y + dy) * width + (x + dx)] = true;
                }
            }
            subrects.push(Subrect {
                color,
                x: x as u16,
                y: y as u16,
                w: w as u16,
                h: h as u16,
            });
        }
    }
    subrects
}

/// RRE: `{u32 count BE, bg pixel, count x (pixel, u16 x, y, w, h BE)}`.
#[allow(clippy::cast_possible_truncation)] // count bounded by pixel count
pub fn encode_rre(view: &FrameView<'_>, opts: &EncodeOptions) -> BytesMut {
    let fmt = &opts.client_format;
    let pixels = client_pixels(view, fmt);
    let bg = background_color(&pixels);
    let subrects = find_subrects(&pixels, view.width() as usize, view.height() as usize, bg);

    let mut buf = BytesMut::with_capacity(8 + subrects.len() * 12);
    buf.put_u32(subrects.len() as u32);
    translate::put_pixel(&mut buf, bg, fmt);
    for sr in subrects {
        translate::put_pixel(&mut buf, sr.color, fmt);
        buf.put_u16(sr.x);
        buf.put_u16(sr.y);
        buf.put_u16(sr.w);
        buf.put_u16(sr.h);
    }
    buf
}

/// CoRRE: like RRE with u8 coordinates. The caller guarantees the view is
/// at most 255x255.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_corre(view: &FrameView<'_>, opts: &EncodeOptions) -> BytesMut {
    debug_assert!(view.width() <= 255 && view.height() <= 255);
    let fmt = &opts.client_format;
    let pixels = client_pixels(view, fmt);
    let bg = background_color(&pixels);
    let subrects = find_subrects(&pixels, view.width() as usize, view.height() as usize, bg);

    let mut buf = BytesMut::with_capacity(8 + subrects.len() * 8);
    buf.put_u32(subrects.len() as u32);
    translate::put_pixel(&mut buf, bg, fmt);
    for sr in subrects {
        translate::put_pixel(&mut buf, sr.color, fmt);
        buf.put_u8(sr.x as u8);
        buf.put_u8(sr.y as u8);
        buf.put_u8(sr.w as u8);
        buf.put_u8(sr.h as u8);
    }
    buf
}

async fn recv_pixel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    format: &PixelFormat,
) -> Result<u32> {
    let bytes = stream.recv_exact(format.bytes_per_pixel()).await?;
    Ok(translate::read_pixel(&bytes, format))
}

fn fill(
    out: &mut [u8],
    width: usize,
    format: &PixelFormat,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    color: u32,
) {
    let bpp = format.bytes_per_pixel();
    let mut pixel = BytesMut::with_capacity(bpp);
    translate::put_pixel(&mut pixel, color, format);
    for dy in 0..h {
        for dx in 0..w {
            let off = ((y + dy) * width + x + dx) * bpp;
            out[off..off + bpp].copy_from_slice(&pixel);
        }
    }
}

async fn decode_common<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
    compact: bool,
) -> Result<Vec<u8>> {
    let count = stream.recv_u32_be().await?;
    let bg = recv_pixel(stream, format).await?;

    let w = width as usize;
    let h = height as usize;
    let mut out = vec![0u8; w * h * format.bytes_per_pixel()];
    fill(&mut out, w, format, 0, 0, w, h, bg);

    for _ in 0..count {
        let color = recv_pixel(stream, format).await?;
        let (sx, sy, sw, sh) = if compact {
            (
                stream.recv_u8().await? as usize,
                stream.recv_u8().await? as usize,
                stream.recv_u8().await? as usize,
                stream.recv_u8().await? as usize,
            )
        } else {
            (
                stream.recv_u16_be().await? as usize,
                stream.recv_u16_be().await? as usize,
                stream.recv_u16_be().await? as usize,
                stream.recv_u16_be().await? as usize,
            )
        };
        if sx + sw > w || sy + sh > h {
            return Err(LtsmError::Protocol("RRE subrect out of bounds".into()));
        }
        fill(&mut out, w, format, sx, sy, sw, sh, color);
    }
    Ok(out)
}

/// Decodes an RRE rectangle into client-format pixels.
pub async fn decode_rre<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    decode_common(stream, width, height, format, false).await
}

/// Decodes a CoRRE rectangle into client-format pixels.
pub async fn decode_corre<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut FramedStream<S>,
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>> {
    decode_common(stream, width, height, format, true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{Framebuffer, Region};

    fn random_tile(seed: u64) -> Vec<u8> {
        // Small xorshift so the tile is deterministic but busy.
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(16 * 16 * 4);
        for _ in 0..16 * 16 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // Limit the palette so subrects actually form.
            let px = [(state % 4) as u8 * 60, (state % 3) as u8 * 80, 0, 0];
            out.extend_from_slice(&px);
        }
        out
    }

    async fn round_trip(compact: bool, seed: u64) {
        let format = PixelFormat::rgb888();
        let mut fb = Framebuffer::new(16, 16, format.clone());
        let pixels = random_tile(seed);
        fb.put_region(Region::new(0, 0, 16, 16), &pixels);
        let view = fb.view(fb.bounds()).unwrap();
        let opts = EncodeOptions {
            client_format: format.clone(),
            ..Default::default()
        };

        let encoded = if compact {
            encode_corre(&view, &opts)
        } else {
            encode_rre(&view, &opts)
        };

        let (a, b) = tokio::io::duplex(65536);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);
        tx.send_all(&encoded);
        tx.flush().await.unwrap();

        let decoded = if compact {
            decode_corre(&mut rx, 16, 16, &format).await.unwrap()
        } else {
            decode_rre(&mut rx, 16, 16, &format).await.unwrap()
        };
        assert_eq!(decoded, pixels);
    }

    #[tokio::test]
    async fn rre_round_trip_random_tiles() {
        for seed in [3, 1717, 99991] {
            round_trip(false, seed).await;
        }
    }

    #[tokio::test]
    async fn corre_round_trip_random_tiles() {
        for seed in [5, 4242, 77777] {
            round_trip(true, seed).await;
        }
    }

    #[tokio::test]
    async fn solid_tile_is_just_background() {
        let format = PixelFormat::rgb888();
        let fb = Framebuffer::new(16, 16, format.clone());
        let view = fb.view(fb.bounds()).unwrap();
        let opts = EncodeOptions {
            client_format: format,
            ..Default::default()
        };
        let encoded = encode_rre(&view, &opts);
        // count = 0, bg pixel only.
        assert_eq!(encoded.len(), 4 + 4);
        assert_eq!(&encoded[..4], &[0, 0, 0, 0]);
    }
}
